use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::transport::TranscriptMessage;

/// One transcript line as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: String,
    pub text: String,
    #[serde(default)]
    pub timestamp: String,
}

impl From<TranscriptMessage> for TranscriptEntry {
    fn from(message: TranscriptMessage) -> Self {
        Self {
            role: message.role,
            text: message.text,
            timestamp: message.timestamp,
        }
    }
}

/// Crash-recovery snapshot of one interview session.
///
/// Timestamps are stored as epoch milliseconds. Fields the pipeline does not
/// know about (interview metadata, scores) live in `data` and round-trip
/// untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,

    /// Time of the last applied update; recovery and eviction order by it
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub transcript: Vec<TranscriptEntry>,

    #[serde(default)]
    pub completed: bool,

    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub ended_at: Option<DateTime<Utc>>,

    /// Set when the last write happened during an unplanned shutdown
    #[serde(default)]
    pub closed_unexpectedly: bool,

    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>, data: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            started_at: now,
            timestamp: now,
            transcript: Vec::new(),
            completed: false,
            ended_at: None,
            closed_unexpectedly: false,
            data,
        }
    }

    /// Shallow-merge `fields` over the record, top-level keys replacing
    /// existing ones. Known fields are type-checked.
    pub fn merge(&mut self, fields: Map<String, Value>) -> Result<(), serde_json::Error> {
        if fields.is_empty() {
            return Ok(());
        }

        let mut merged = match serde_json::to_value(&*self)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        merged.extend(fields);
        *self = serde_json::from_value(Value::Object(merged))?;
        Ok(())
    }

    /// Serialised size in bytes.
    pub fn encoded_len(&self) -> Result<usize, serde_json::Error> {
        Ok(serde_json::to_vec(self)?.len())
    }
}

/// A queued change, applied on the next flush.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PendingWrite {
    Merge {
        fields: Map<String, Value>,
        at: DateTime<Utc>,
    },
    Transcript {
        entry: TranscriptEntry,
        at: DateTime<Utc>,
    },
}

impl PendingWrite {
    pub(crate) fn apply(self, record: &mut SessionRecord) -> Result<(), serde_json::Error> {
        match self {
            PendingWrite::Merge { fields, at } => {
                record.merge(fields)?;
                record.timestamp = at;
            }
            PendingWrite::Transcript { entry, at } => {
                record.transcript.push(entry);
                record.timestamp = at;
            }
        }
        Ok(())
    }
}
