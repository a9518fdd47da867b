//! Speech synthesis providers
//!
//! Both backends are asked for raw PCM at the session's output sample rate;
//! the response body is chunked into fixed-duration frames and encoded
//! through the codec as it streams in, so playback can start before the
//! sentence finishes synthesizing.

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{FrameStream, Synthesizer};
use crate::audio::{AudioCodec, Pcm16Codec};
use crate::config::{AudioFormat, TtsConfig};
use crate::{Error, Result};

/// TTS provider backend
#[derive(Clone, Copy, Debug)]
enum TtsProvider {
    OpenAi,
    ElevenLabs,
}

/// Synthesizes sentences into encoded audio frames
pub struct TextToSpeech {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    voice: String,
    speed: f32,
    model: String,
    provider: TtsProvider,
    format: AudioFormat,
    codec: Pcm16Codec,
}

impl TextToSpeech {
    /// Create a TTS instance for an OpenAI-compatible speech endpoint
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new_openai(config: &TtsConfig, format: AudioFormat) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(Error::Config("API key required for TTS".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            voice: config.voice.clone(),
            speed: config.speed,
            model: config.model.clone(),
            provider: TtsProvider::OpenAi,
            format,
            codec: Pcm16Codec::new(format),
        })
    }

    /// Create a TTS instance using ElevenLabs
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new_elevenlabs(config: &TtsConfig, format: AudioFormat) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(Error::Config(
                "ElevenLabs API key required for TTS".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            base_url: String::new(),
            voice: config.voice.clone(),
            speed: 1.0,
            model: config.model.clone(),
            provider: TtsProvider::ElevenLabs,
            format,
            codec: Pcm16Codec::new(format),
        })
    }

    /// Request raw PCM audio for `text` from the configured backend
    async fn request_pcm(&self, text: &str) -> Result<reqwest::Response> {
        let response = match self.provider {
            TtsProvider::OpenAi => {
                #[derive(serde::Serialize)]
                struct SpeechRequest<'a> {
                    model: &'a str,
                    input: &'a str,
                    voice: &'a str,
                    speed: f32,
                    response_format: &'a str,
                }

                self.client
                    .post(format!("{}/audio/speech", self.base_url))
                    .header("Authorization", format!("Bearer {}", self.api_key))
                    .json(&SpeechRequest {
                        model: &self.model,
                        input: text,
                        voice: &self.voice,
                        speed: self.speed,
                        response_format: "pcm",
                    })
                    .send()
                    .await?
            }
            TtsProvider::ElevenLabs => {
                #[derive(serde::Serialize)]
                struct ElevenLabsRequest<'a> {
                    text: &'a str,
                    model_id: &'a str,
                }

                let url = format!(
                    "https://api.elevenlabs.io/v1/text-to-speech/{}/stream?output_format=pcm_{}",
                    self.voice, self.format.sample_rate
                );

                self.client
                    .post(&url)
                    .header("xi-api-key", &self.api_key)
                    .header("Content-Type", "application/json")
                    .json(&ElevenLabsRequest {
                        text,
                        model_id: &self.model,
                    })
                    .send()
                    .await?
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("TTS API error {status}: {body}")));
        }

        Ok(response)
    }
}

#[async_trait]
impl Synthesizer for TextToSpeech {
    async fn synthesize(&self, text: &str) -> Result<FrameStream> {
        if text.trim().is_empty() {
            return Ok(futures::stream::empty().boxed());
        }

        tracing::debug!(text, "synthesizing sentence");
        let response = self.request_pcm(text).await?;

        let codec = self.codec;
        let frame_bytes = self.format.frame_bytes();
        let (tx, rx) = mpsc::channel::<Result<Vec<u8>>>(32);

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut pending: Vec<u8> = Vec::with_capacity(frame_bytes * 2);

            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => {
                        pending.extend_from_slice(&bytes);
                        while pending.len() >= frame_bytes {
                            let rest = pending.split_off(frame_bytes);
                            let frame = std::mem::replace(&mut pending, rest);
                            if send_frame(&codec, &frame, &tx).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(Error::Tts(e.to_string()))).await;
                        return;
                    }
                }
            }

            // Zero-pad the trailing partial frame to full duration
            if !pending.is_empty() {
                pending.resize(frame_bytes, 0);
                let _ = send_frame(&codec, &pending, &tx).await;
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Decode one frame's worth of PCM bytes, encode it, and push it downstream
async fn send_frame(
    codec: &Pcm16Codec,
    pcm: &[u8],
    tx: &mpsc::Sender<Result<Vec<u8>>>,
) -> std::result::Result<(), ()> {
    let samples = pcm_to_samples(pcm);
    match codec.encode(&samples) {
        Ok(frame) => tx.send(Ok(frame)).await.map_err(|_| ()),
        Err(e) => {
            let _ = tx.send(Err(e)).await;
            Err(())
        }
    }
}

/// Interpret little-endian PCM bytes as 16-bit samples
fn pcm_to_samples(pcm: &[u8]) -> Vec<i16> {
    pcm.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AUDIO_OUT;

    fn tts_config(api_key: &str) -> TtsConfig {
        TtsConfig {
            provider: "openai".to_string(),
            api_key: api_key.to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "tts-1".to_string(),
            voice: "alloy".to_string(),
            speed: 1.0,
        }
    }

    #[test]
    fn missing_api_key_is_rejected() {
        assert!(TextToSpeech::new_openai(&tts_config(""), AUDIO_OUT).is_err());
        assert!(TextToSpeech::new_elevenlabs(&tts_config(""), AUDIO_OUT).is_err());
    }

    #[test]
    fn pcm_bytes_convert_to_samples() {
        let pcm = [0x01, 0x00, 0xFF, 0xFF, 0x00, 0x80];
        assert_eq!(pcm_to_samples(&pcm), vec![1, -1, i16::MIN]);
    }

    #[tokio::test]
    async fn empty_text_yields_empty_stream() {
        let tts = TextToSpeech::new_openai(&tts_config("key"), AUDIO_OUT).unwrap();
        let mut stream = tts.synthesize("   ").await.unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn frame_chunking_pads_the_tail() {
        let codec = Pcm16Codec::new(AUDIO_OUT);
        let frame_bytes = AUDIO_OUT.frame_bytes();
        let (tx, mut rx) = mpsc::channel(8);

        // One full frame plus a half frame of PCM
        let full = vec![1u8; frame_bytes];
        send_frame(&codec, &full, &tx).await.unwrap();

        let mut partial = vec![2u8; frame_bytes / 2];
        partial.resize(frame_bytes, 0);
        send_frame(&codec, &partial, &tx).await.unwrap();
        drop(tx);

        let first = rx.recv().await.unwrap().unwrap();
        let second = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.len(), frame_bytes);
        assert_eq!(second.len(), frame_bytes);
        // Padded region decodes to silence
        assert!(second[frame_bytes / 2..].iter().all(|&b| b == 0));
        assert!(rx.recv().await.is_none());
    }
}
