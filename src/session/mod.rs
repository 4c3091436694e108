//! Live session management
//!
//! This module provides the `LiveSession` abstraction that manages:
//! - Microphone capture and speech detection
//! - Buffered, paced hand-off of frames to the live transport
//! - Playback of coach speech and barge-in
//! - Crash-recovery persistence of the session record

mod config;
mod persistence;
mod record;
mod session;
mod stats;
mod store;

pub use config::LiveSessionConfig;
pub use persistence::{PersistenceOptions, SessionPersistence};
pub use record::{SessionRecord, TranscriptEntry};
pub use session::{LiveSession, SessionEvent};
pub use stats::SessionStats;
pub use store::{FileStore, MemoryStore, SessionStore};
