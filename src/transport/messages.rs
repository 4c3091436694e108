use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audio::frame::decode_pcm16;
use crate::error::{AudioDecodeError, MessageError};

/// Message sent to the live endpoint as JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Start {
        interview_id: String,
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        live_model: Option<String>,
    },
    Stop,
    BargeIn,
    /// Heartbeat, `ts` in epoch milliseconds
    Ping { ts: i64 },
}

/// Connection or session state carried by a `status` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusState {
    Connected,
    Reconnecting,
    Reconnected,
    Disconnected,
    StreamComplete,
    Stopped,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub state: StatusState,
    /// Close code of the final disconnect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    /// Whether a transcript backup was emitted before the disconnect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_backup: Option<bool>,
}

impl StatusUpdate {
    pub fn new(state: StatusState) -> Self {
        Self {
            state,
            code: None,
            reason: None,
            attempt: None,
            max_attempts: None,
            delay_ms: None,
            has_backup: None,
        }
    }
}

/// One line of the interview transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub role: String,
    pub text: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_final: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub session_id: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interview_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_model: Option<String>,
}

/// Synthesised speech sent as JSON: base64 of little-endian PCM16.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioMessage {
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    pub data: String,
}

fn default_encoding() -> String {
    "pcm16".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(default)]
    pub message: String,
}

/// JSON message received from the live endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status(StatusUpdate),
    Transcript(TranscriptMessage),
    Session(SessionMessage),
    Audio(AudioMessage),
    Error(ErrorMessage),
}

const SERVER_MESSAGE_TYPES: [&str; 5] = ["status", "transcript", "session", "audio", "error"];

impl ServerMessage {
    /// Parse a text frame, telling unknown `type`s apart from malformed JSON.
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(MessageError::MissingType)?
            .to_string();

        if !SERVER_MESSAGE_TYPES.contains(&kind.as_str()) {
            return Err(MessageError::UnknownType(kind));
        }

        Ok(serde_json::from_value(value)?)
    }
}

/// Counters kept by the network worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub total_bytes_sent: u64,
    pub total_batches_sent: u64,
    pub avg_batch_size: u64,
}

/// Transcript line held by the worker for recovery after a dropped connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedTranscript {
    #[serde(flatten)]
    pub message: TranscriptMessage,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptBackup {
    pub transcripts: Vec<CachedTranscript>,
    pub timestamp: DateTime<Utc>,
}

/// Inbound coach audio as it came off the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundAudio {
    /// Binary frame: little-endian PCM16 at the session rate
    Binary(Vec<u8>),
    /// JSON `audio` message carrying the same bytes in base64
    Json(AudioMessage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedAudio {
    pub samples: Vec<i16>,
    /// Rate declared by the sender, if any
    pub sample_rate: Option<u32>,
}

/// Decode inbound coach audio to PCM16 samples.
pub fn decode_audio(payload: InboundAudio) -> Result<DecodedAudio, AudioDecodeError> {
    let (bytes, sample_rate) = match payload {
        InboundAudio::Binary(bytes) => (bytes, None),
        InboundAudio::Json(message) => {
            if !message.encoding.eq_ignore_ascii_case("pcm16") {
                return Err(AudioDecodeError::UnsupportedEncoding(message.encoding));
            }
            let bytes = base64::engine::general_purpose::STANDARD.decode(message.data.as_bytes())?;
            (bytes, message.sample_rate)
        }
    };

    Ok(DecodedAudio {
        samples: decode_pcm16(&bytes)?,
        sample_rate,
    })
}
