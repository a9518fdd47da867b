//! Speech-to-text providers

use async_trait::async_trait;

use super::Transcriber;
use crate::audio::samples_to_wav;
use crate::config::SttConfig;
use crate::{Error, Result};

/// Response from an OpenAI-compatible Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Response from the Deepgram transcription API
#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// STT provider backend
#[derive(Clone, Copy, Debug)]
enum SttProvider {
    Whisper,
    Deepgram,
}

/// Transcribes device utterances to text
pub struct SpeechToText {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    language: Option<String>,
    provider: SttProvider,
}

impl SpeechToText {
    /// Create an STT instance for an OpenAI-compatible Whisper endpoint
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new_whisper(config: &SttConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(Error::Config(
                "API key required for Whisper STT".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            language: config.language.clone(),
            provider: SttProvider::Whisper,
        })
    }

    /// Create an STT instance using Deepgram
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new_deepgram(config: &SttConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(Error::Config("Deepgram API key required".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            base_url: String::new(),
            model: config.model.clone(),
            language: config.language.clone(),
            provider: SttProvider::Deepgram,
        })
    }

    /// Transcribe using an OpenAI-compatible Whisper endpoint
    async fn transcribe_whisper(&self, wav: Vec<u8>) -> Result<String> {
        tracing::debug!(wav_bytes = wav.len(), "starting Whisper transcription");

        let mut form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone());

        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            return Err(Error::Stt(format!("Whisper API error {status}: {body}")));
        }

        let result: WhisperResponse = response.json().await?;
        tracing::info!(transcript = %result.text, "transcription complete");
        Ok(result.text.trim().to_string())
    }

    /// Transcribe using Deepgram
    async fn transcribe_deepgram(&self, wav: Vec<u8>) -> Result<String> {
        tracing::debug!(wav_bytes = wav.len(), "starting Deepgram transcription");

        let mut url = format!(
            "https://api.deepgram.com/v1/listen?model={}&punctuate=true",
            self.model
        );
        if let Some(language) = &self.language {
            url.push_str("&language=");
            url.push_str(language);
        }

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", "audio/wav")
            .body(wav)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Deepgram API error");
            return Err(Error::Stt(format!("Deepgram API error {status}: {body}")));
        }

        let result: DeepgramResponse = response.json().await?;
        let transcript = result
            .results
            .channels
            .first()
            .and_then(|c| c.alternatives.first())
            .map(|a| a.transcript.trim().to_string())
            .unwrap_or_default();

        tracing::info!(transcript = %transcript, "transcription complete");
        Ok(transcript)
    }
}

#[async_trait]
impl Transcriber for SpeechToText {
    async fn transcribe(&self, samples: &[i16], sample_rate: u32) -> Result<String> {
        let wav = samples_to_wav(samples, sample_rate)?;

        match self.provider {
            SttProvider::Whisper => self.transcribe_whisper(wav).await,
            SttProvider::Deepgram => self.transcribe_deepgram(wav).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stt_config(api_key: &str) -> SttConfig {
        SttConfig {
            provider: "whisper".to_string(),
            api_key: api_key.to_string(),
            base_url: "https://api.groq.com/openai/v1/".to_string(),
            model: "whisper-large-v3-turbo".to_string(),
            language: Some("en".to_string()),
        }
    }

    #[test]
    fn missing_api_key_is_rejected() {
        assert!(SpeechToText::new_whisper(&stt_config("")).is_err());
        assert!(SpeechToText::new_deepgram(&stt_config("")).is_err());
    }

    #[test]
    fn base_url_is_normalized() {
        let stt = SpeechToText::new_whisper(&stt_config("key")).unwrap();
        assert_eq!(stt.base_url, "https://api.groq.com/openai/v1");
    }

    #[test]
    fn deepgram_response_parses() {
        let json = r#"{
            "results": {
                "channels": [
                    {"alternatives": [{"transcript": "turn on the lights"}]}
                ]
            }
        }"#;
        let parsed: DeepgramResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            parsed.results.channels[0].alternatives[0].transcript,
            "turn on the lights"
        );
    }
}
