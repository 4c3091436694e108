use serde::{Deserialize, Serialize};
use tracing::info;

/// Quality tier chosen by preflight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileTier {
    High,
    Medium,
    Low,
    Fallback,
}

/// Audio parameters agreed once per session.
///
/// Capture and playback both read `sample_rate` from the same profile so the
/// two sides of the pipeline never disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioProfile {
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
    pub bitrate: u32,
    pub buffer_size: u32,
    pub profile: ProfileTier,
}

impl AudioProfile {
    pub fn for_tier(tier: ProfileTier) -> Self {
        match tier {
            ProfileTier::High => Self {
                sample_rate: 48000,
                frame_duration_ms: 20,
                bitrate: 128_000,
                buffer_size: 2048,
                profile: tier,
            },
            ProfileTier::Medium => Self {
                sample_rate: 24000,
                frame_duration_ms: 40,
                bitrate: 64_000,
                buffer_size: 2048,
                profile: tier,
            },
            ProfileTier::Low => Self {
                sample_rate: 16000,
                frame_duration_ms: 60,
                bitrate: 32_000,
                buffer_size: 4096,
                profile: tier,
            },
            ProfileTier::Fallback => Self {
                sample_rate: 24000,
                frame_duration_ms: 20,
                bitrate: 64_000,
                buffer_size: 2048,
                profile: tier,
            },
        }
    }

    /// Profile used when no preflight ran.
    pub fn fallback() -> Self {
        Self::for_tier(ProfileTier::Fallback)
    }

    /// Preflight decision matrix over network and device signals.
    pub fn select(probe: &EnvironmentProbe) -> Self {
        let tier = if probe.downlink_mbps > 5.0
            && probe.effective_type == "4g"
            && probe.cpu_cores >= 4
            && !probe.low_battery
        {
            ProfileTier::High
        } else if probe.downlink_mbps > 2.0 && probe.rtt_ms < 200 {
            ProfileTier::Medium
        } else {
            ProfileTier::Low
        };

        let profile = Self::for_tier(tier);
        info!(
            "Selected {:?} audio profile: {}Hz, {}ms frames, {} bps",
            tier, profile.sample_rate, profile.frame_duration_ms, profile.bitrate
        );
        profile
    }
}

impl Default for AudioProfile {
    fn default() -> Self {
        Self::fallback()
    }
}

/// Signals gathered before a session starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentProbe {
    pub downlink_mbps: f64,
    pub effective_type: String,
    pub rtt_ms: u32,
    pub cpu_cores: u32,
    pub low_battery: bool,
}

impl Default for EnvironmentProbe {
    fn default() -> Self {
        Self {
            downlink_mbps: 10.0,
            effective_type: "4g".to_string(),
            rtt_ms: 100,
            cpu_cores: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(4),
            low_battery: false,
        }
    }
}
