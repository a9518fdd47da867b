//! Conversation pipeline: transcription → generation → synthesis
//!
//! One pipeline run handles one turn. Generation runs as a producer task
//! feeding completed sentences into a bounded FIFO; the pipeline body is the
//! synthesis-and-transmit consumer. That keeps the single outbound audio
//! stream strictly ordered — sentence N's frames finish before sentence N+1
//! starts — while the generator runs ahead. The turn's abort flag is polled
//! before every sentence and every frame, bounding abort latency to one
//! sentence synthesis in the worst case.

mod segmenter;

pub use segmenter::SentenceSegmenter;

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::{AudioFormat, Config};
use crate::protocol::{Outbound, ServerMessage, TtsState};
use crate::providers::ProviderSet;
use crate::session::{AbortFlag, Turn};

/// Frames sent immediately before pacing kicks in, to fill the device's
/// jitter buffer
const PRE_BUFFER_FRAMES: usize = 3;

/// Completion signals from a pipeline task back to its session's socket loop
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Transcription succeeded; the response phase is starting
    Transcribed { turn: u64, text: String },
    /// The pipeline run ended (normally, on failure, or on abort).
    /// `response` carries the assembled assistant text when there is any.
    Finished {
        turn: u64,
        response: Option<String>,
    },
}

/// Orchestrates one turn's STT → LLM → TTS flow
pub struct ConversationPipeline {
    providers: ProviderSet,
    audio_in: AudioFormat,
    audio_out: AudioFormat,
    min_utterance_ms: u32,
    provider_timeout: Duration,
    max_sentence_chars: usize,
}

impl ConversationPipeline {
    /// Build a pipeline over the given providers
    #[must_use]
    pub fn new(providers: ProviderSet, config: &Config) -> Self {
        Self {
            providers,
            audio_in: config.audio_in,
            audio_out: config.audio_out,
            min_utterance_ms: config.session.min_utterance_ms,
            provider_timeout: Duration::from_secs(config.session.provider_timeout_secs),
            max_sentence_chars: config.session.max_sentence_chars,
        }
    }

    /// Run one turn over the accumulated utterance.
    ///
    /// Emits wire messages through `outbound` and state transitions through
    /// `events`. Never returns an error: every failure mode is recovered at
    /// the turn level per the session contract.
    pub async fn run(
        &self,
        turn: u64,
        session_id: String,
        samples: Vec<i16>,
        history: Vec<Turn>,
        outbound: mpsc::Sender<Outbound>,
        events: mpsc::Sender<PipelineEvent>,
        abort: AbortFlag,
    ) {
        let finish = |response: Option<String>| PipelineEvent::Finished { turn, response };

        // Step 1: batch transcription of the whole utterance
        let Some(user_text) = self.transcribe_utterance(&samples).await else {
            if !abort.is_set() {
                let _ = outbound
                    .send(Outbound::Control(ServerMessage::error(
                        &session_id,
                        "stt_failed",
                        "could not transcribe audio",
                    )))
                    .await;
            }
            let _ = events.send(finish(None)).await;
            return;
        };

        if abort.is_set() {
            let _ = events.send(finish(None)).await;
            return;
        }

        tracing::info!(session_id = %session_id, transcript = %user_text, "utterance transcribed");

        // Step 2: transcript notification before generation begins
        let _ = outbound
            .send(Outbound::Control(ServerMessage::Stt {
                text: user_text.clone(),
                session_id: session_id.clone(),
            }))
            .await;

        // Step 3 (history append) happens in the socket loop on this event
        let _ = events
            .send(PipelineEvent::Transcribed {
                turn,
                text: user_text.clone(),
            })
            .await;

        // Step 4: response starting
        let _ = outbound
            .send(Outbound::Control(ServerMessage::Tts {
                state: TtsState::Start,
                text: None,
                session_id: session_id.clone(),
            }))
            .await;
        let _ = outbound
            .send(Outbound::Control(ServerMessage::Llm {
                emotion: "neutral".to_string(),
                session_id: session_id.clone(),
            }))
            .await;

        // Steps 5–7: stream generation into ordered synthesis
        let response = self
            .stream_response(&history, &user_text, &session_id, &outbound, &abort)
            .await;

        // Step 9: response finished (an aborted turn stays silent — the
        // device initiated the cut and resets its own playback)
        if !abort.is_set() {
            let _ = outbound
                .send(Outbound::Control(ServerMessage::Tts {
                    state: TtsState::Stop,
                    text: None,
                    session_id: session_id.clone(),
                }))
                .await;
        }

        let response = (!response.trim().is_empty()).then_some(response);
        let _ = events.send(finish(response)).await;
    }

    /// Transcribe the utterance, treating too-short audio, provider errors,
    /// timeouts, and empty transcripts uniformly as "nothing to respond to"
    async fn transcribe_utterance(&self, samples: &[i16]) -> Option<String> {
        let min_samples =
            (self.audio_in.sample_rate as usize * self.min_utterance_ms as usize) / 1000;
        if samples.len() < min_samples {
            tracing::debug!(
                samples = samples.len(),
                min_samples,
                "utterance too short, skipping"
            );
            return None;
        }

        let call = self
            .providers
            .transcriber
            .transcribe(samples, self.audio_in.sample_rate);
        let text = match tokio::time::timeout(self.provider_timeout, call).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "transcription failed");
                return None;
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.provider_timeout, "transcription timed out");
                return None;
            }
        };

        let text = text.trim();
        if text.is_empty() {
            tracing::debug!("empty transcription, skipping");
            None
        } else {
            Some(text.to_string())
        }
    }

    /// Steps 5–7: generation task → sentence FIFO → ordered synthesis and
    /// transmission. Returns the assembled response text (possibly partial).
    async fn stream_response(
        &self,
        history: &[Turn],
        user_text: &str,
        session_id: &str,
        outbound: &mpsc::Sender<Outbound>,
        abort: &AbortFlag,
    ) -> String {
        let (sentence_tx, mut sentence_rx) = mpsc::channel::<String>(16);

        let generator = self.providers.generator.clone();
        let history = history.to_vec();
        let user_text = user_text.to_string();
        let max_chars = self.max_sentence_chars;
        let producer_abort = abort.clone();

        // Producer: consume the fragment stream, emit completed sentences
        let producer = tokio::spawn(async move {
            let mut assembled = String::new();
            let mut segmenter = SentenceSegmenter::new(max_chars);

            let mut fragments = match generator.generate(&history, &user_text).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(error = %e, "generation failed to start");
                    return assembled;
                }
            };

            while let Some(item) = fragments.next().await {
                if producer_abort.is_set() {
                    return assembled;
                }
                match item {
                    Ok(fragment) => {
                        assembled.push_str(&fragment);
                        for sentence in segmenter.push(&fragment) {
                            if sentence_tx.send(sentence).await.is_err() {
                                return assembled;
                            }
                        }
                    }
                    Err(e) => {
                        // Recoverable at session level: keep what streamed
                        tracing::warn!(error = %e, "generation failed mid-response");
                        return assembled;
                    }
                }
            }

            // Trailing partial sentence (no terminal punctuation)
            if !producer_abort.is_set() {
                if let Some(rest) = segmenter.flush() {
                    let _ = sentence_tx.send(rest).await;
                }
            }
            assembled
        });

        // Consumer: strict sentence order, one at a time
        while let Some(sentence) = sentence_rx.recv().await {
            if abort.is_set() {
                break;
            }
            self.speak_sentence(&sentence, session_id, outbound, abort)
                .await;
        }
        drop(sentence_rx);

        match producer.await {
            Ok(assembled) => assembled,
            Err(e) => {
                tracing::error!(error = %e, "generation task panicked");
                String::new()
            }
        }
    }

    /// Step 6 for one sentence: announce it, synthesize it, stream its
    /// frames at playback cadence. Synthesis failures skip this sentence's
    /// audio without ending the turn.
    async fn speak_sentence(
        &self,
        sentence: &str,
        session_id: &str,
        outbound: &mpsc::Sender<Outbound>,
        abort: &AbortFlag,
    ) {
        let _ = outbound
            .send(Outbound::Control(ServerMessage::Tts {
                state: TtsState::SentenceStart,
                text: Some(sentence.to_string()),
                session_id: session_id.to_string(),
            }))
            .await;

        let mut frames = match self.providers.synthesizer.synthesize(sentence).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, sentence, "synthesis failed, skipping sentence audio");
                return;
            }
        };

        let frame_duration = self.audio_out.frame_duration();
        let mut sent = 0usize;
        let mut next_deadline: Option<Instant> = None;

        while let Some(item) = frames.next().await {
            if abort.is_set() {
                tracing::debug!(session_id, "abort observed, cutting sentence audio");
                return;
            }

            match item {
                Ok(frame) => {
                    if outbound.send(Outbound::Audio(frame)).await.is_err() {
                        return;
                    }
                    sent += 1;

                    // Pace to playback speed after the pre-buffer burst
                    if sent == PRE_BUFFER_FRAMES {
                        next_deadline = Some(Instant::now() + frame_duration);
                    } else if sent > PRE_BUFFER_FRAMES {
                        if let Some(deadline) = next_deadline {
                            tokio::time::sleep_until(deadline).await;
                            next_deadline = Some(deadline + frame_duration);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, sentence, "synthesis stream failed mid-sentence");
                    return;
                }
            }
        }

        tracing::debug!(frames = sent, sentence, "sentence audio sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::stream;

    use crate::providers::{
        FrameStream, ResponseGenerator, Synthesizer, TextStream, Transcriber,
    };
    use crate::{Error, Result};

    const FRAME_BYTES: usize = 16;

    struct StubTranscriber {
        result: Result<String>,
    }

    #[async_trait]
    impl Transcriber for StubTranscriber {
        async fn transcribe(&self, _samples: &[i16], _sample_rate: u32) -> Result<String> {
            match &self.result {
                Ok(text) => Ok(text.clone()),
                Err(_) => Err(Error::Stt("stub failure".to_string())),
            }
        }
    }

    struct ScriptedGenerator {
        fragments: Vec<Result<String>>,
    }

    impl ScriptedGenerator {
        fn ok(fragments: &[&str]) -> Self {
            Self {
                fragments: fragments.iter().map(|f| Ok((*f).to_string())).collect(),
            }
        }
    }

    #[async_trait]
    impl ResponseGenerator for ScriptedGenerator {
        async fn generate(&self, _history: &[Turn], _user_text: &str) -> Result<TextStream> {
            let items: Vec<Result<String>> = self
                .fragments
                .iter()
                .map(|item| match item {
                    Ok(text) => Ok(text.clone()),
                    Err(_) => Err(Error::Llm("stub stream failure".to_string())),
                })
                .collect();
            Ok(stream::iter(items).boxed())
        }
    }

    /// Synthesizer that tags each frame with the sentence ordinal and can
    /// inject latency, failures, or a mid-sentence abort
    struct TaggedSynthesizer {
        frames_per_sentence: usize,
        calls: Arc<AtomicUsize>,
        fail_on_call: Option<usize>,
        delay_first_call: Option<Duration>,
        abort_after_frames: Option<(AbortFlag, usize)>,
    }

    impl TaggedSynthesizer {
        fn new(frames_per_sentence: usize) -> Self {
            Self {
                frames_per_sentence,
                calls: Arc::new(AtomicUsize::new(0)),
                fail_on_call: None,
                delay_first_call: None,
                abort_after_frames: None,
            }
        }
    }

    #[async_trait]
    impl Synthesizer for TaggedSynthesizer {
        async fn synthesize(&self, _text: &str) -> Result<FrameStream> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);

            if self.fail_on_call == Some(call) {
                return Err(Error::Tts("stub synthesis failure".to_string()));
            }
            if call == 0 {
                if let Some(delay) = self.delay_first_call {
                    tokio::time::sleep(delay).await;
                }
            }

            // Lazy stream: the abort flag raises while frame `after` is
            // being pulled, landing between the consumer's checkpoints
            let frames_per_sentence = self.frames_per_sentence;
            let abort = self.abort_after_frames.clone();
            let tag = u8::try_from(call).unwrap_or(255);

            Ok(stream::unfold(0usize, move |i| {
                let abort = abort.clone();
                async move {
                    if i >= frames_per_sentence {
                        return None;
                    }
                    if let Some((flag, after)) = &abort {
                        if call == 0 && i == *after {
                            flag.set();
                        }
                    }
                    Some((Ok(vec![tag; FRAME_BYTES]), i + 1))
                }
            })
            .boxed())
        }
    }

    struct Harness {
        outbound_rx: mpsc::Receiver<Outbound>,
        events_rx: mpsc::Receiver<PipelineEvent>,
    }

    async fn run_pipeline(
        transcriber: StubTranscriber,
        generator: ScriptedGenerator,
        synthesizer: TaggedSynthesizer,
        samples: Vec<i16>,
        abort: AbortFlag,
    ) -> Harness {
        let mut config = Config::default();
        config.session.min_utterance_ms = 300;

        let providers = ProviderSet::new(
            Arc::new(transcriber),
            Arc::new(generator),
            Arc::new(synthesizer),
        );
        let pipeline = ConversationPipeline::new(providers, &config);

        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::channel(16);

        pipeline
            .run(
                1,
                "sess-1".to_string(),
                samples,
                Vec::new(),
                outbound_tx,
                events_tx,
                abort,
            )
            .await;

        Harness {
            outbound_rx,
            events_rx,
        }
    }

    fn drain_outbound(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }

    fn utterance() -> Vec<i16> {
        vec![100; 16_000]
    }

    #[tokio::test(start_paused = true)]
    async fn full_turn_emits_messages_and_frames_in_order() {
        let mut harness = run_pipeline(
            StubTranscriber {
                result: Ok("what's the weather".to_string()),
            },
            ScriptedGenerator::ok(&["It is sunny", ". Stay", " cool."]),
            TaggedSynthesizer::new(4),
            utterance(),
            AbortFlag::new(),
        )
        .await;

        let outbound = drain_outbound(&mut harness.outbound_rx);

        // Control message order: stt, tts start, llm, then per-sentence
        let mut controls = outbound.iter().filter_map(|o| match o {
            Outbound::Control(m) => Some(m),
            Outbound::Audio(_) => None,
        });
        assert!(matches!(controls.next(), Some(ServerMessage::Stt { text, .. }) if text == "what's the weather"));
        assert!(matches!(
            controls.next(),
            Some(ServerMessage::Tts {
                state: TtsState::Start,
                ..
            })
        ));
        assert!(matches!(controls.next(), Some(ServerMessage::Llm { .. })));
        assert!(matches!(
            controls.next(),
            Some(ServerMessage::Tts { state: TtsState::SentenceStart, text: Some(t), .. }) if t == "It is sunny."
        ));
        assert!(matches!(
            controls.next(),
            Some(ServerMessage::Tts { state: TtsState::SentenceStart, text: Some(t), .. }) if t == "Stay cool."
        ));
        assert!(matches!(
            controls.next(),
            Some(ServerMessage::Tts {
                state: TtsState::Stop,
                ..
            })
        ));
        assert!(controls.next().is_none());

        // Frame order: all of sentence 0 before any of sentence 1
        let tags: Vec<u8> = outbound
            .iter()
            .filter_map(|o| match o {
                Outbound::Audio(frame) => Some(frame[0]),
                Outbound::Control(_) => None,
            })
            .collect();
        assert_eq!(tags.len(), 8);
        assert_eq!(&tags[..4], &[0, 0, 0, 0]);
        assert_eq!(&tags[4..], &[1, 1, 1, 1]);

        // Events: transcribed, then finished with the assembled response
        assert!(matches!(
            harness.events_rx.try_recv(),
            Ok(PipelineEvent::Transcribed { turn: 1, text }) if text == "what's the weather"
        ));
        assert!(matches!(
            harness.events_rx.try_recv(),
            Ok(PipelineEvent::Finished { turn: 1, response: Some(r) }) if r == "It is sunny. Stay cool."
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn sentence_order_survives_synthesis_latency() {
        // First sentence synthesizes slowly; its frames must still all land
        // before the second sentence's
        let mut synthesizer = TaggedSynthesizer::new(3);
        synthesizer.delay_first_call = Some(Duration::from_secs(2));

        let mut harness = run_pipeline(
            StubTranscriber {
                result: Ok("hi".to_string()),
            },
            ScriptedGenerator::ok(&["Slow first. Fast second."]),
            synthesizer,
            utterance(),
            AbortFlag::new(),
        )
        .await;

        let tags: Vec<u8> = drain_outbound(&mut harness.outbound_rx)
            .iter()
            .filter_map(|o| match o {
                Outbound::Audio(frame) => Some(frame[0]),
                Outbound::Control(_) => None,
            })
            .collect();
        assert_eq!(tags, vec![0, 0, 0, 1, 1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_cuts_audio_at_the_next_frame_checkpoint() {
        let abort = AbortFlag::new();
        let mut synthesizer = TaggedSynthesizer::new(6);
        synthesizer.abort_after_frames = Some((abort.clone(), 2));

        let mut harness = run_pipeline(
            StubTranscriber {
                result: Ok("hi".to_string()),
            },
            ScriptedGenerator::ok(&["One. Two. Three."]),
            synthesizer,
            utterance(),
            abort,
        )
        .await;

        let outbound = drain_outbound(&mut harness.outbound_rx);
        let audio_count = outbound
            .iter()
            .filter(|o| matches!(o, Outbound::Audio(_)))
            .count();
        // Flag raised while producing frame 2: frames after the checkpoint
        // are never sent
        assert_eq!(audio_count, 2);

        // No trailing tts stop on an aborted turn
        assert!(!outbound.iter().any(|o| matches!(
            o,
            Outbound::Control(ServerMessage::Tts {
                state: TtsState::Stop,
                ..
            })
        )));

        // Still finishes (socket loop returns the session to Idle)
        let mut finished = false;
        while let Ok(event) = harness.events_rx.try_recv() {
            if matches!(event, PipelineEvent::Finished { turn: 1, .. }) {
                finished = true;
            }
        }
        assert!(finished);
    }

    #[tokio::test(start_paused = true)]
    async fn transcription_failure_notifies_and_finishes_empty() {
        let mut harness = run_pipeline(
            StubTranscriber {
                result: Err(Error::Stt("unreachable".to_string())),
            },
            ScriptedGenerator::ok(&["never used"]),
            TaggedSynthesizer::new(2),
            utterance(),
            AbortFlag::new(),
        )
        .await;

        let outbound = drain_outbound(&mut harness.outbound_rx);
        assert_eq!(outbound.len(), 1);
        assert!(matches!(
            &outbound[0],
            Outbound::Control(ServerMessage::Error { code, .. }) if code == "stt_failed"
        ));

        assert!(matches!(
            harness.events_rx.try_recv(),
            Ok(PipelineEvent::Finished {
                turn: 1,
                response: None
            })
        ));
        assert!(harness.events_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn short_utterance_is_treated_as_empty_transcription() {
        let mut harness = run_pipeline(
            StubTranscriber {
                result: Ok("should not be called".to_string()),
            },
            ScriptedGenerator::ok(&["never used"]),
            TaggedSynthesizer::new(2),
            vec![0; 100],
            AbortFlag::new(),
        )
        .await;

        let outbound = drain_outbound(&mut harness.outbound_rx);
        assert!(
            !outbound
                .iter()
                .any(|o| matches!(o, Outbound::Control(ServerMessage::Stt { .. })))
        );
        assert!(matches!(
            harness.events_rx.try_recv(),
            Ok(PipelineEvent::Finished { response: None, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn generation_failure_mid_stream_keeps_what_streamed() {
        let generator = ScriptedGenerator {
            fragments: vec![
                Ok("First sentence. And then".to_string()),
                Err(Error::Llm("provider died".to_string())),
            ],
        };

        let mut harness = run_pipeline(
            StubTranscriber {
                result: Ok("hi".to_string()),
            },
            generator,
            TaggedSynthesizer::new(2),
            utterance(),
            AbortFlag::new(),
        )
        .await;

        let outbound = drain_outbound(&mut harness.outbound_rx);

        // The completed sentence was synthesized and the turn still closed
        let sentence_starts: Vec<&ServerMessage> = outbound
            .iter()
            .filter_map(|o| match o {
                Outbound::Control(
                    m @ ServerMessage::Tts {
                        state: TtsState::SentenceStart,
                        ..
                    },
                ) => Some(m),
                _ => None,
            })
            .collect();
        assert_eq!(sentence_starts.len(), 1);
        assert!(outbound.iter().any(|o| matches!(
            o,
            Outbound::Control(ServerMessage::Tts {
                state: TtsState::Stop,
                ..
            })
        )));

        // Partial response is reported (the fragment that streamed before
        // the failure, including the unfinished tail)
        let mut response = None;
        while let Ok(event) = harness.events_rx.try_recv() {
            if let PipelineEvent::Finished { response: r, .. } = event {
                response = r;
            }
        }
        assert_eq!(response.as_deref(), Some("First sentence. And then"));
    }

    #[tokio::test(start_paused = true)]
    async fn synthesis_failure_skips_one_sentence_not_the_turn() {
        let mut synthesizer = TaggedSynthesizer::new(3);
        synthesizer.fail_on_call = Some(0);

        let mut harness = run_pipeline(
            StubTranscriber {
                result: Ok("hi".to_string()),
            },
            ScriptedGenerator::ok(&["Bad sentence. Good sentence."]),
            synthesizer,
            utterance(),
            AbortFlag::new(),
        )
        .await;

        let outbound = drain_outbound(&mut harness.outbound_rx);

        // Both sentences announced, only the second produced audio
        let announced = outbound
            .iter()
            .filter(|o| {
                matches!(
                    o,
                    Outbound::Control(ServerMessage::Tts {
                        state: TtsState::SentenceStart,
                        ..
                    })
                )
            })
            .count();
        assert_eq!(announced, 2);

        let tags: Vec<u8> = outbound
            .iter()
            .filter_map(|o| match o {
                Outbound::Audio(frame) => Some(frame[0]),
                Outbound::Control(_) => None,
            })
            .collect();
        assert_eq!(tags, vec![1, 1, 1]);
    }
}
