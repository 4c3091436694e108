use std::time::Duration;

use crate::audio::buffer::{DEFAULT_FRAME_INTERVAL_MS, DEFAULT_MAX_FRAMES};
use crate::audio::AudioProfile;
use crate::capture::CaptureOptions;
use crate::transport::StartOptions;

/// Configuration for a live interview session
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSessionConfig {
    /// Unique session identifier, also the persisted record id
    pub session_id: String,

    pub interview_id: String,

    pub user_id: String,

    /// Extra fields for the server's `start` message
    pub start: StartOptions,

    /// Negotiated audio parameters shared by capture and playback
    pub profile: AudioProfile,

    pub capture: CaptureOptions,

    /// Frames held while the transport is not ready; oldest dropped first
    pub max_buffered_frames: usize,

    /// How often buffered frames are handed to the transport
    pub frame_interval: Duration,
}

impl LiveSessionConfig {
    pub fn new(interview_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let profile = AudioProfile::fallback();
        Self {
            session_id: format!("session-{}", uuid::Uuid::new_v4()),
            interview_id: interview_id.into(),
            user_id: user_id.into(),
            start: StartOptions::default(),
            profile,
            capture: CaptureOptions::from_profile(&profile),
            max_buffered_frames: DEFAULT_MAX_FRAMES,
            frame_interval: Duration::from_millis(DEFAULT_FRAME_INTERVAL_MS),
        }
    }

    /// Switch to `profile`, keeping the capture rate and frame size in step.
    pub fn with_profile(mut self, profile: AudioProfile) -> Self {
        self.profile = profile;
        self.capture.target_sample_rate = profile.sample_rate;
        self.capture.frame_duration_ms = profile.frame_duration_ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ProfileTier;

    #[test]
    fn test_profile_drives_capture_rate() {
        let config = LiveSessionConfig::new("int-1", "user-1")
            .with_profile(AudioProfile::for_tier(ProfileTier::Low));

        assert_eq!(config.capture.target_sample_rate, 16000);
        assert_eq!(config.capture.frame_duration_ms, 60);
        assert!(config.session_id.starts_with("session-"));
    }
}
