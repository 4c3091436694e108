use thiserror::Error;

/// Failures while acquiring or running the microphone pipeline.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// A required platform capability is missing. Fatal, never retried.
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("input device runs at {native} Hz, cannot produce {target} Hz without upsampling")]
    UnsupportedSampleRate { native: u32, target: u32 },
    #[error("audio device error: {0}")]
    Device(String),
    #[error(transparent)]
    Wav(#[from] hound::Error),
}

/// Failures of the network transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection timed out after {0} ms")]
    ConnectionTimeout(u64),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("network worker unavailable")]
    WorkerUnavailable,
    #[error("transport closed")]
    Closed,
    #[error("socket error: {0}")]
    Socket(String),
}

/// An error raised while tearing something down.
///
/// Only ever logged; `stop()`/`close()` paths swallow it.
#[derive(Debug, Error)]
#[error("cleanup of {component} failed: {reason}")]
pub struct CleanupError {
    pub component: &'static str,
    pub reason: String,
}

impl CleanupError {
    pub fn new(component: &'static str, reason: impl ToString) -> Self {
        Self {
            component,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("session store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("session record serialisation failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors decoding an inbound PCM16 payload.
#[derive(Debug, Error)]
pub enum AudioDecodeError {
    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("PCM16 payload must contain an even number of bytes (got {0})")]
    OddByteLength(usize),
    #[error("unsupported audio encoding '{0}'")]
    UnsupportedEncoding(String),
}

/// Errors parsing a server message.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("message has no 'type' field")]
    MissingType,
    #[error("unrecognized message type '{0}'")]
    UnknownType(String),
}

/// Failures of the output device.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("output device is closed")]
    Closed,
    #[error("frame is {frame} Hz but the playback stream is {stream} Hz")]
    RateMismatch { frame: u32, stream: u32 },
    #[error("output device error: {0}")]
    Device(String),
    #[error(transparent)]
    Wav(#[from] hound::Error),
}
