use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::audio::activity::{DEFAULT_FRAME_MS, DEFAULT_SILENCE_THRESHOLD, DEFAULT_SILENCE_WINDOW_MS};
use crate::audio::buffer::{DEFAULT_FRAME_INTERVAL_MS, DEFAULT_MAX_FRAMES};
use crate::audio::ProfileTier;
use crate::session::PersistenceOptions;
use crate::transport::{Backoff, TransportOptions};

/// Prefix for environment overrides, e.g. `VOICE_COACH__TRANSPORT__URL`.
const ENV_PREFIX: &str = "VOICE_COACH";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub transport: TransportConfig,
    pub audio: AudioConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "voice-coach".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub url: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub backoff: Backoff,
    pub heartbeat_interval_ms: u64,
    pub batch_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub close_grace_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8000/ws/live".to_string(),
            max_reconnect_attempts: 3,
            reconnect_delay_ms: 600,
            backoff: Backoff::Fixed,
            heartbeat_interval_ms: 10_000,
            batch_interval_ms: 60,
            connect_timeout_ms: 10_000,
            close_grace_ms: 100,
        }
    }
}

impl TransportConfig {
    pub fn options(&self) -> TransportOptions {
        TransportOptions {
            url: self.url.clone(),
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            backoff: self.backoff,
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            batch_interval: Duration::from_millis(self.batch_interval_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            close_grace: Duration::from_millis(self.close_grace_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub profile: ProfileTier,
    pub speech_threshold: f32,
    /// Voiced time before speech start fires; defaults to one frame
    pub start_window_ms: u32,
    pub silence_window_ms: u32,
    pub max_buffered_frames: usize,
    pub frame_interval_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            profile: ProfileTier::Fallback,
            speech_threshold: DEFAULT_SILENCE_THRESHOLD,
            start_window_ms: DEFAULT_FRAME_MS,
            silence_window_ms: DEFAULT_SILENCE_WINDOW_MS,
            max_buffered_frames: DEFAULT_MAX_FRAMES,
            frame_interval_ms: DEFAULT_FRAME_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub store_path: PathBuf,
    pub auto_save_interval_ms: u64,
    pub max_stored_sessions: usize,
    pub recovery_window_hours: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("data/sessions"),
            auto_save_interval_ms: 5_000,
            max_stored_sessions: 5,
            recovery_window_hours: 24,
        }
    }
}

impl PersistenceConfig {
    pub fn options(&self) -> PersistenceOptions {
        PersistenceOptions {
            auto_save_interval: Duration::from_millis(self.auto_save_interval_ms),
            max_stored_sessions: self.max_stored_sessions,
            recovery_window: Duration::from_secs(self.recovery_window_hours * 60 * 60),
            ..PersistenceOptions::default()
        }
    }
}

impl Config {
    /// Layer `path` (any format the `config` crate knows, extension optional)
    /// under `VOICE_COACH__*` environment overrides. A missing file is fine.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .with_context(|| format!("Failed to load config from {}", path))?;

        settings
            .try_deserialize()
            .context("Invalid configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent");
        let config = Config::load(path.to_str().unwrap()).unwrap();

        assert_eq!(config.service.name, "voice-coach");
        assert_eq!(config.transport.connect_timeout_ms, 10_000);
        assert_eq!(config.persistence.max_stored_sessions, 5);
        assert_eq!(config.audio.silence_window_ms, 400);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("voice-coach.toml");
        std::fs::write(
            &path,
            "[transport]\nurl = \"ws://example.test/ws\"\nbackoff = \"exponential\"\n\n[audio]\nprofile = \"low\"\n",
        )
        .unwrap();

        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.transport.url, "ws://example.test/ws");
        assert_eq!(config.transport.backoff, Backoff::Exponential);
        assert_eq!(config.transport.batch_interval_ms, 60);
        assert_eq!(config.audio.profile, ProfileTier::Low);

        let options = config.transport.options();
        assert_eq!(options.reconnect_delay, Duration::from_millis(600));
        assert_eq!(options.close_grace, Duration::from_millis(100));
    }

    #[test]
    fn test_persistence_options() {
        let options = PersistenceConfig::default().options();
        assert_eq!(options.recovery_window, Duration::from_secs(86_400));
        assert_eq!(options.auto_save_interval, Duration::from_secs(5));
    }
}
