//! Provider capability interfaces
//!
//! The pipeline depends only on these traits; concrete backends are wired up
//! once at startup from configuration. STT and TTS are HTTP providers, the
//! response generator is an OpenAI-compatible streaming chat endpoint with a
//! fallback chain.

mod llm;
mod stt;
mod tts;

pub use llm::ChatGenerator;
pub use stt::SpeechToText;
pub use tts::TextToSpeech;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::config::Config;
use crate::session::Turn;
use crate::{Error, Result};

/// Lazy sequence of generated text fragments
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Lazy sequence of encoded audio frames
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Batch speech-to-text over one utterance
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe PCM samples to text
    ///
    /// # Errors
    ///
    /// Returns error if the provider call fails.
    async fn transcribe(&self, samples: &[i16], sample_rate: u32) -> Result<String>;
}

/// Streaming conversational response generation
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Open a generation stream seeded with the conversation history
    ///
    /// # Errors
    ///
    /// Returns error if no provider can start streaming. The returned stream
    /// may itself yield an error mid-response.
    async fn generate(&self, history: &[Turn], user_text: &str) -> Result<TextStream>;
}

/// Streaming speech synthesis for one sentence
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize one sentence into a stream of encoded frames
    ///
    /// # Errors
    ///
    /// Returns error if the provider call fails (the caller skips this
    /// sentence's audio and continues).
    async fn synthesize(&self, text: &str) -> Result<FrameStream>;
}

/// The three collaborators a session pipeline needs
#[derive(Clone)]
pub struct ProviderSet {
    pub transcriber: Arc<dyn Transcriber>,
    pub generator: Arc<dyn ResponseGenerator>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

impl ProviderSet {
    /// Assemble providers from explicit implementations (used by tests and
    /// embedders)
    #[must_use]
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        generator: Arc<dyn ResponseGenerator>,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Self {
        Self {
            transcriber,
            generator,
            synthesizer,
        }
    }

    /// Construct the configured provider backends
    ///
    /// # Errors
    ///
    /// Returns error for unknown provider names or missing API keys.
    pub fn from_config(config: &Config) -> Result<Self> {
        let transcriber: Arc<dyn Transcriber> = match config.stt.provider.as_str() {
            "whisper" => Arc::new(SpeechToText::new_whisper(&config.stt)?),
            "deepgram" => Arc::new(SpeechToText::new_deepgram(&config.stt)?),
            other => {
                return Err(Error::Config(format!("unknown STT provider: {other}")));
            }
        };

        let generator: Arc<dyn ResponseGenerator> = Arc::new(ChatGenerator::new(&config.llm)?);

        let synthesizer: Arc<dyn Synthesizer> = match config.tts.provider.as_str() {
            "openai" => Arc::new(TextToSpeech::new_openai(&config.tts, config.audio_out)?),
            "elevenlabs" => Arc::new(TextToSpeech::new_elevenlabs(&config.tts, config.audio_out)?),
            other => {
                return Err(Error::Config(format!("unknown TTS provider: {other}")));
            }
        };

        Ok(Self::new(transcriber, generator, synthesizer))
    }
}
