use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transport::NetworkStats;

/// Statistics about a live session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Whether the session is still running
    pub is_live: bool,

    /// When the session started
    pub started_at: DateTime<Utc>,

    /// Total duration in seconds
    pub duration_secs: f64,

    /// Frames produced by the capture engine
    pub frames_captured: u64,

    /// Frames handed to the transport
    pub frames_sent: u64,

    /// Frames evicted from the buffer before they could be sent
    pub frames_dropped: u64,

    /// Inbound coach audio buffers scheduled for playback
    pub buffers_played: u64,

    /// Final transcript lines received
    pub transcript_count: usize,

    /// Times the user interrupted coach speech
    pub barge_ins: u64,

    /// Last counters reported by the network worker, if any
    pub network: Option<NetworkStats>,
}
