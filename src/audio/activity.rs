use serde::{Deserialize, Serialize};

use super::dsp::rms_pcm16;

pub const DEFAULT_FRAME_MS: u32 = 20;
pub const DEFAULT_SILENCE_THRESHOLD: f32 = 0.02;
pub const DEFAULT_SILENCE_WINDOW_MS: u32 = 400;

/// Energy thresholds and hysteresis windows for speech detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActivityConfig {
    /// Duration of every frame passed to `update`
    pub frame_duration_ms: u32,
    /// RMS (normalised to [-1, 1]) at or above which a frame is voiced
    pub silence_threshold: f32,
    /// Sustained voiced time required before `Start`
    pub start_window_ms: u32,
    /// Sustained silent time required before `End`
    pub silence_window_ms: u32,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            frame_duration_ms: DEFAULT_FRAME_MS,
            silence_threshold: DEFAULT_SILENCE_THRESHOLD,
            start_window_ms: DEFAULT_FRAME_MS,
            silence_window_ms: DEFAULT_SILENCE_WINDOW_MS,
        }
    }
}

/// Edge emitted when the detector changes state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechTransition {
    Start,
    End,
}

/// Speech/silence classifier with hysteresis.
///
/// Only the two state edges are reported; every other call returns `None`.
#[derive(Debug, Clone)]
pub struct ActivityDetector {
    config: ActivityConfig,
    active: bool,
    voiced_ms: u32,
    silence_ms: u32,
    last_level: f32,
}

impl ActivityDetector {
    pub fn new(config: ActivityConfig) -> Self {
        Self {
            config,
            active: false,
            voiced_ms: 0,
            silence_ms: 0,
            last_level: 0.0,
        }
    }

    /// Feed the next contiguous frame.
    pub fn update(&mut self, frame: &[i16]) -> Option<SpeechTransition> {
        let level = rms_pcm16(frame);
        self.last_level = level;

        if level >= self.config.silence_threshold {
            self.silence_ms = 0;
            self.voiced_ms = self.voiced_ms.saturating_add(self.config.frame_duration_ms);

            if !self.active && self.voiced_ms >= self.config.start_window_ms {
                self.active = true;
                return Some(SpeechTransition::Start);
            }
            return None;
        }

        self.voiced_ms = 0;
        if !self.active {
            return None;
        }

        self.silence_ms = self.silence_ms.saturating_add(self.config.frame_duration_ms);
        if self.silence_ms >= self.config.silence_window_ms {
            self.active = false;
            self.silence_ms = 0;
            return Some(SpeechTransition::End);
        }

        None
    }

    /// Return to silent without emitting anything.
    pub fn reset(&mut self) {
        self.active = false;
        self.voiced_ms = 0;
        self.silence_ms = 0;
        self.last_level = 0.0;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// RMS of the most recent frame.
    pub fn level(&self) -> f32 {
        self.last_level
    }

    pub fn config(&self) -> &ActivityConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOICED: [i16; 320] = [8000; 320];
    const SILENT: [i16; 320] = [0; 320];

    fn detector(start_window_ms: u32, silence_window_ms: u32) -> ActivityDetector {
        ActivityDetector::new(ActivityConfig {
            frame_duration_ms: 20,
            silence_threshold: 0.02,
            start_window_ms,
            silence_window_ms,
        })
    }

    #[test]
    fn test_silence_never_triggers() {
        let mut vad = detector(20, 400);
        let quiet = [200i16; 320]; // rms ~0.006
        for _ in 0..200 {
            assert_eq!(vad.update(&quiet), None);
            assert!(!vad.is_active());
        }
    }

    #[test]
    fn test_start_after_window() {
        let mut vad = detector(60, 400);
        assert_eq!(vad.update(&VOICED), None);
        assert_eq!(vad.update(&VOICED), None);
        assert_eq!(vad.update(&VOICED), Some(SpeechTransition::Start));
        assert!(vad.is_active());

        for _ in 0..50 {
            assert_eq!(vad.update(&VOICED), None);
        }
    }

    #[test]
    fn test_short_burst_does_not_start() {
        let mut vad = detector(60, 400);
        assert_eq!(vad.update(&VOICED), None);
        assert_eq!(vad.update(&VOICED), None);
        assert_eq!(vad.update(&SILENT), None);
        assert_eq!(vad.update(&VOICED), None);
        assert!(!vad.is_active());
    }

    #[test]
    fn test_end_after_silence_window() {
        let mut vad = detector(20, 100);
        assert_eq!(vad.update(&VOICED), Some(SpeechTransition::Start));

        for _ in 0..4 {
            assert_eq!(vad.update(&SILENT), None);
        }
        assert_eq!(vad.update(&SILENT), Some(SpeechTransition::End));
        assert!(!vad.is_active());

        for _ in 0..20 {
            assert_eq!(vad.update(&SILENT), None);
        }
    }

    #[test]
    fn test_voiced_frame_resets_silence_counter() {
        let mut vad = detector(20, 100);
        vad.update(&VOICED);

        for _ in 0..4 {
            assert_eq!(vad.update(&SILENT), None);
        }
        assert_eq!(vad.update(&VOICED), None);
        for _ in 0..4 {
            assert_eq!(vad.update(&SILENT), None);
        }
        assert!(vad.is_active());
        assert_eq!(vad.update(&SILENT), Some(SpeechTransition::End));
    }

    #[test]
    fn test_reset_is_silent() {
        let mut vad = detector(20, 400);
        vad.update(&VOICED);
        assert!(vad.is_active());

        vad.reset();
        assert!(!vad.is_active());
        assert_eq!(vad.update(&SILENT), None);
        assert_eq!(vad.update(&VOICED), Some(SpeechTransition::Start));
    }

    #[test]
    fn test_level_tracks_last_frame() {
        let mut vad = detector(20, 400);
        vad.update(&[16384; 320]);
        assert!((vad.level() - 0.5).abs() < 1e-6);
    }
}
