//! Per-connection session state
//!
//! One device connection owns exactly one [`SessionState`], mutated only by
//! that connection's socket task. The single concession to cross-task
//! sharing is the per-turn [`AbortFlag`], which the socket task sets and the
//! pipeline task polls.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;

/// Listen state machine: a strict linear progression, one active phase at a
/// time per session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenState {
    /// Waiting for the device to open the microphone
    Idle,
    /// Accumulating inbound audio
    Listening,
    /// Utterance closed, transcription running
    Processing,
    /// Streaming the generated response
    Responding,
}

/// Speaker role for a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Wire name used in chat-completion requests
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One conversation turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

/// Monotonic one-way cancellation flag, one instance per turn
///
/// Clones share the flag. A turn that has been superseded keeps its own
/// (already set) instance, so arming a fresh flag for the next turn can
/// never un-abort an in-flight pipeline.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Poll the flag
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// State for one device session
#[derive(Debug)]
pub struct SessionState {
    id: String,
    device_id: String,
    client_id: String,
    listen: ListenState,
    ingest: Vec<i16>,
    history: Vec<Turn>,
    abort: AbortFlag,
    turn: u64,
    max_history: usize,
}

impl SessionState {
    /// Create state for a newly accepted connection
    #[must_use]
    pub fn new(device_id: String, client_id: String, max_history: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            device_id,
            client_id,
            listen: ListenState::Idle,
            ingest: Vec::new(),
            history: Vec::new(),
            abort: AbortFlag::new(),
            turn: 0,
            max_history,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub const fn listen(&self) -> ListenState {
        self.listen
    }

    #[must_use]
    pub const fn current_turn(&self) -> u64 {
        self.turn
    }

    /// Samples currently buffered for the open listening interval
    #[must_use]
    pub fn buffered_samples(&self) -> usize {
        self.ingest.len()
    }

    /// Clone of the current turn's abort flag, for handing to a pipeline task
    #[must_use]
    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    /// Enter Listening: abort any in-flight response, clear the ingest
    /// buffer, and arm a fresh abort flag for the new turn.
    ///
    /// Valid from any state; re-entering while already Listening just clears
    /// the buffer.
    pub fn start_listening(&mut self) {
        if matches!(self.listen, ListenState::Processing | ListenState::Responding) {
            self.abort.set();
        }
        self.abort = AbortFlag::new();
        self.ingest.clear();
        self.turn += 1;
        self.listen = ListenState::Listening;
    }

    /// Close the listening interval, consuming the accumulated audio.
    ///
    /// Only meaningful while Listening; in any other state this is an
    /// idempotent no-op and returns `None`.
    pub fn stop_listening(&mut self) -> Option<Vec<i16>> {
        if self.listen != ListenState::Listening {
            return None;
        }
        self.listen = ListenState::Processing;
        Some(std::mem::take(&mut self.ingest))
    }

    /// Append decoded samples while Listening.
    ///
    /// Returns `false` (samples discarded) in any other state, which guards
    /// against stale-audio buildup between turns.
    pub fn append_audio(&mut self, samples: &[i16]) -> bool {
        if self.listen != ListenState::Listening {
            return false;
        }
        self.ingest.extend_from_slice(samples);
        true
    }

    /// Raise the current turn's abort flag
    pub fn abort(&mut self) {
        self.abort.set();
    }

    /// Transcription completed for `turn`: enter Responding
    pub fn mark_responding(&mut self, turn: u64) {
        if turn == self.turn && self.listen == ListenState::Processing {
            self.listen = ListenState::Responding;
        }
    }

    /// Pipeline for `turn` finished (normally or not): return to Idle.
    ///
    /// Stale turns — superseded by a later `start_listening` — are ignored.
    /// Returns whether the completion was current.
    pub fn finish_turn(&mut self, turn: u64) -> bool {
        if turn != self.turn {
            return false;
        }
        self.listen = ListenState::Idle;
        true
    }

    /// Append one turn, truncating to the bounded history window
    pub fn push_turn(&mut self, role: Role, text: String) {
        self.history.push(Turn { role, text });
        if self.history.len() > self.max_history {
            let excess = self.history.len() - self.max_history;
            self.history.drain(..excess);
        }
    }

    #[must_use]
    pub fn history(&self) -> &[Turn] {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionState {
        SessionState::new("dev-1".to_string(), "cli-1".to_string(), 6)
    }

    #[test]
    fn session_ids_are_unique_and_nonempty() {
        let a = session();
        let b = session();
        assert!(!a.id().is_empty());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn stop_while_idle_is_a_noop() {
        let mut s = session();
        assert!(s.stop_listening().is_none());
        assert_eq!(s.listen(), ListenState::Idle);
    }

    #[test]
    fn start_while_listening_clears_buffer() {
        let mut s = session();
        s.start_listening();
        assert!(s.append_audio(&[1, 2, 3]));
        s.start_listening();
        assert_eq!(s.listen(), ListenState::Listening);
        assert_eq!(s.buffered_samples(), 0);
    }

    #[test]
    fn audio_outside_listening_is_discarded() {
        let mut s = session();
        assert!(!s.append_audio(&[1, 2, 3]));
        assert_eq!(s.buffered_samples(), 0);

        s.start_listening();
        assert!(s.append_audio(&[1, 2, 3]));
        s.stop_listening();
        assert!(!s.append_audio(&[4, 5]));
    }

    #[test]
    fn buffer_is_consumed_exactly_once() {
        let mut s = session();
        s.start_listening();
        s.append_audio(&[7; 100]);

        let samples = s.stop_listening().unwrap();
        assert_eq!(samples.len(), 100);
        assert_eq!(s.listen(), ListenState::Processing);
        assert_eq!(s.buffered_samples(), 0);

        // Duplicate stop is idempotent
        assert!(s.stop_listening().is_none());
    }

    #[test]
    fn restart_during_response_aborts_previous_turn() {
        let mut s = session();
        s.start_listening();
        let first_turn = s.current_turn();
        s.stop_listening();
        s.mark_responding(first_turn);

        let old_flag = s.abort_flag();
        s.start_listening();

        assert!(old_flag.is_set());
        assert!(!s.abort_flag().is_set());
        assert_ne!(s.current_turn(), first_turn);
    }

    #[test]
    fn stale_turn_completion_is_ignored() {
        let mut s = session();
        s.start_listening();
        let first_turn = s.current_turn();
        s.stop_listening();

        s.start_listening();
        assert!(!s.finish_turn(first_turn));
        assert_eq!(s.listen(), ListenState::Listening);

        s.stop_listening();
        assert!(s.finish_turn(s.current_turn()));
        assert_eq!(s.listen(), ListenState::Idle);
    }

    #[test]
    fn abort_flag_is_visible_across_clones() {
        let s = {
            let mut s = session();
            s.start_listening();
            s
        };
        let held_by_pipeline = s.abort_flag();
        let held_by_router = s.abort_flag();

        held_by_router.set();
        assert!(held_by_pipeline.is_set());
    }

    #[test]
    fn history_keeps_most_recent_entries() {
        let mut s = session();
        for i in 0..10 {
            s.push_turn(Role::User, format!("u{i}"));
        }
        assert_eq!(s.history().len(), 6);
        assert_eq!(s.history()[0].text, "u4");
        assert_eq!(s.history()[5].text, "u9");
    }
}
