//! Wire protocol for device sessions
//!
//! Text frames carry JSON messages tagged by `type`; binary frames carry
//! exactly one compressed audio frame. Inbound and outbound vocabularies are
//! modeled as serde-tagged enums so unknown message types surface as parse
//! errors the router can log and skip without closing the connection.

use serde::{Deserialize, Serialize};

use crate::config::AudioFormat;

/// Audio parameters exchanged at handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
    /// Codec name on the wire
    #[serde(default = "default_format")]
    pub format: String,

    pub sample_rate: u32,

    pub channels: u16,

    /// Frame duration in milliseconds
    pub frame_duration: u32,
}

fn default_format() -> String {
    "pcm".to_string()
}

impl From<AudioFormat> for AudioParams {
    fn from(fmt: AudioFormat) -> Self {
        Self {
            format: default_format(),
            sample_rate: fmt.sample_rate,
            channels: fmt.channels,
            frame_duration: fmt.frame_duration_ms,
        }
    }
}

/// Listen control sub-state sent by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenEvent {
    /// Device opened the microphone
    Start,
    /// Device closed the microphone; the utterance is complete
    Stop,
    /// Wake word heard on-device (informational)
    Detect,
}

/// Incoming message from the device
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Handshake opener
    Hello {
        #[serde(default)]
        version: u32,
        #[serde(default)]
        transport: String,
        #[serde(default)]
        audio_params: Option<AudioParams>,
    },
    /// Microphone state change
    Listen {
        state: ListenEvent,
        #[serde(default)]
        mode: Option<String>,
        /// Wake word text when `state` is `detect`
        #[serde(default)]
        text: Option<String>,
    },
    /// Cancel the in-flight response
    Abort {
        #[serde(default)]
        reason: Option<String>,
    },
    /// Tool-protocol passthrough — accepted but not processed here
    Mcp {
        #[serde(default)]
        payload: serde_json::Value,
    },
}

/// Outbound TTS stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    /// Response audio is about to start
    Start,
    /// The next sentence's text, ahead of its audio
    SentenceStart,
    /// Response audio is complete
    Stop,
}

/// Outgoing message to the device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake acknowledgement
    Hello {
        transport: String,
        session_id: String,
        audio_params: AudioParams,
    },
    /// Transcript of the device's utterance
    Stt { text: String, session_id: String },
    /// TTS stream state, optionally carrying sentence text
    Tts {
        state: TtsState,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        session_id: String,
    },
    /// Auxiliary response metadata (emotion hint for the device UI)
    Llm { emotion: String, session_id: String },
    /// Recoverable error notification
    Error {
        code: String,
        message: String,
        session_id: String,
    },
}

impl ServerMessage {
    /// Build the handshake acknowledgement for a session
    #[must_use]
    pub fn hello(session_id: &str, fmt: AudioFormat) -> Self {
        Self::Hello {
            transport: "websocket".to_string(),
            session_id: session_id.to_string(),
            audio_params: fmt.into(),
        }
    }

    /// Build a recoverable error notification
    #[must_use]
    pub fn error(session_id: &str, code: &str, message: &str) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.to_string(),
            session_id: session_id.to_string(),
        }
    }
}

/// One unit on a session's outbound channel: a JSON control message or a
/// single binary audio frame
#[derive(Debug, Clone)]
pub enum Outbound {
    Control(ServerMessage),
    Audio(Vec<u8>),
}

/// Extract the compressed audio payload from a binary transport frame.
///
/// Devices declare a binary protocol version at upgrade time:
/// v1 frames are the bare payload, v2 frames carry a 16-byte transport
/// header, v3 frames carry a big-endian payload length at bytes \[2..4\]
/// with the payload at offset 4. Unknown versions fall back to v1 framing.
/// Returns `None` when the frame is too short for its declared framing.
#[must_use]
pub fn extract_audio_payload(data: &[u8], version: u32) -> Option<&[u8]> {
    match version {
        2 => {
            if data.len() > 16 {
                Some(&data[16..])
            } else {
                None
            }
        }
        3 => {
            if data.len() > 4 {
                let len = usize::from(u16::from_be_bytes([data[2], data[3]]));
                data.get(4..4 + len)
            } else {
                None
            }
        }
        _ => Some(data),
    }
}
