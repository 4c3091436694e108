//! Live interview transport
//!
//! [`LiveTransport`] is the caller-facing half: a connect state machine and a
//! typed event channel. The socket itself lives in a [`NetworkWorker`] task
//! behind the [`Connector`] port.

mod client;
mod messages;
mod socket;
mod worker;

pub use client::{LinkState, LiveTransport, StartOptions, TransportEvent, TransportOptions};
pub use messages::{
    decode_audio, AudioMessage, CachedTranscript, ClientMessage, DecodedAudio, ErrorMessage,
    InboundAudio, NetworkStats, ServerMessage, SessionMessage, StatusState, StatusUpdate,
    TranscriptBackup, TranscriptMessage,
};
pub use socket::{
    Connector, FrameSink, FrameStream, SocketLink, WireFrame, WsConnector, ABNORMAL_CLOSURE,
    NORMAL_CLOSURE,
};
pub use worker::{Backoff, NetworkWorker, WorkerCommand, WorkerConfig, WorkerEvent};
