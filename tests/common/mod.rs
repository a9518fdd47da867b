//! Shared test fixtures: scripted provider stubs
//!
//! The stubs speak the provider traits without any network, so integration
//! tests can drive full sessions deterministically.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;

use chime_gateway::providers::{
    FrameStream, ProviderSet, ResponseGenerator, Synthesizer, TextStream, Transcriber,
};
use chime_gateway::session::Turn;
use chime_gateway::{Error, Result};

/// Transcriber that always returns the same text
pub struct FixedTranscriber(pub &'static str);

#[async_trait]
impl Transcriber for FixedTranscriber {
    async fn transcribe(&self, _samples: &[i16], _sample_rate: u32) -> Result<String> {
        Ok(self.0.to_string())
    }
}

/// Transcriber that always fails
pub struct FailingTranscriber;

#[async_trait]
impl Transcriber for FailingTranscriber {
    async fn transcribe(&self, _samples: &[i16], _sample_rate: u32) -> Result<String> {
        Err(Error::Stt("stub transcriber offline".to_string()))
    }
}

/// Generator that streams a fixed fragment script
pub struct ScriptedGenerator(pub Vec<&'static str>);

#[async_trait]
impl ResponseGenerator for ScriptedGenerator {
    async fn generate(&self, _history: &[Turn], _user_text: &str) -> Result<TextStream> {
        let fragments: Vec<Result<String>> =
            self.0.iter().map(|f| Ok((*f).to_string())).collect();
        Ok(stream::iter(fragments).boxed())
    }
}

/// Synthesizer producing a fixed number of frames per sentence, each tagged
/// with the sentence ordinal in every byte
pub struct FrameSynthesizer {
    pub frames_per_sentence: usize,
    pub frame_bytes: usize,
    calls: AtomicUsize,
}

impl FrameSynthesizer {
    pub fn new(frames_per_sentence: usize, frame_bytes: usize) -> Self {
        Self {
            frames_per_sentence,
            frame_bytes,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Synthesizer for FrameSynthesizer {
    async fn synthesize(&self, _text: &str) -> Result<FrameStream> {
        let tag = u8::try_from(self.calls.fetch_add(1, Ordering::SeqCst)).unwrap_or(255);
        let frames: Vec<Result<Vec<u8>>> = (0..self.frames_per_sentence)
            .map(|_| Ok(vec![tag; self.frame_bytes]))
            .collect();
        Ok(stream::iter(frames).boxed())
    }
}

/// Assemble a provider set from stubs
pub fn providers(
    transcriber: impl Transcriber + 'static,
    generator: impl ResponseGenerator + 'static,
    synthesizer: impl Synthesizer + 'static,
) -> ProviderSet {
    ProviderSet::new(
        Arc::new(transcriber),
        Arc::new(generator),
        Arc::new(synthesizer),
    )
}
