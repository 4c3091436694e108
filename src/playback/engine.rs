use tracing::{debug, info, warn};

use super::device::{OutputBuffer, OutputDevice, OutputState};
use crate::audio::dsp::pcm16_to_float;
use crate::audio::AudioFrame;
use crate::error::{CleanupError, PlaybackError};

/// Placement of one scheduled buffer on the device clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub start: f64,
    pub duration: f64,
}

/// Gapless sequential playback of PCM16 buffers.
///
/// `next_time` only moves forward: each buffer starts at
/// `max(next_time, device clock)` and pushes the cursor by its duration.
pub struct PlaybackEngine {
    device: Box<dyn OutputDevice>,
    sample_rate: u32,
    next_time: f64,
    scheduled: u64,
}

impl PlaybackEngine {
    /// `sample_rate` is the negotiated stream rate, independent of the
    /// device's native rate.
    pub fn new(device: Box<dyn OutputDevice>, sample_rate: u32) -> Self {
        if device.native_sample_rate() != sample_rate {
            info!(
                "Output device runs at {}Hz, stream at {}Hz; device will resample",
                device.native_sample_rate(),
                sample_rate
            );
        }

        Self {
            device,
            sample_rate,
            next_time: 0.0,
            scheduled: 0,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Schedule raw PCM16 samples at the stream rate.
    ///
    /// Empty input is ignored.
    pub fn play(&mut self, pcm16: &[i16]) -> Result<Option<ScheduledBuffer>, PlaybackError> {
        if pcm16.is_empty() {
            return Ok(None);
        }
        if self.device.state() == OutputState::Closed {
            return Err(PlaybackError::Closed);
        }

        let buffer = OutputBuffer::new(pcm16_to_float(pcm16), self.sample_rate);
        let duration = buffer.duration();

        let now = self.device.current_time();
        if self.next_time < now {
            if self.scheduled > 0 {
                debug!("Playback fell behind by {:.3}s, resyncing", now - self.next_time);
            }
            self.next_time = now;
        }

        let start = self.next_time;
        self.device.schedule(buffer, start)?;
        self.next_time += duration;
        self.scheduled += 1;

        Ok(Some(ScheduledBuffer { start, duration }))
    }

    /// Schedule a frame, rejecting one recorded at another rate.
    pub fn play_frame(&mut self, frame: &AudioFrame) -> Result<Option<ScheduledBuffer>, PlaybackError> {
        if frame.sample_rate() != self.sample_rate {
            return Err(PlaybackError::RateMismatch {
                frame: frame.sample_rate(),
                stream: self.sample_rate,
            });
        }
        self.play(frame.samples())
    }

    /// Unsuspend the device. No-op unless suspended.
    pub async fn resume(&mut self) -> Result<(), PlaybackError> {
        if self.device.state() == OutputState::Suspended {
            self.device.resume().await?;
        }
        Ok(())
    }

    /// Release the device. Idempotent; failures are logged.
    pub async fn stop(&mut self) {
        if self.device.state() == OutputState::Closed {
            return;
        }
        if let Err(e) = self.device.close().await {
            warn!("{}", CleanupError::new("output device", e));
        }
    }

    /// Whether scheduled audio is still ahead of the device clock.
    pub fn is_playing(&self) -> bool {
        self.device.state() == OutputState::Running && self.next_time > self.device.current_time()
    }

    pub fn next_time(&self) -> f64 {
        self.next_time
    }

    pub fn scheduled_count(&self) -> u64 {
        self.scheduled
    }

    pub fn state(&self) -> OutputState {
        self.device.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorded {
        schedules: Vec<(f64, u32, usize)>,
        now: f64,
        state: Option<OutputState>,
        resumes: usize,
        closes: usize,
    }

    struct ManualOutput {
        native_rate: u32,
        shared: Arc<Mutex<Recorded>>,
    }

    #[async_trait::async_trait]
    impl OutputDevice for ManualOutput {
        fn native_sample_rate(&self) -> u32 {
            self.native_rate
        }

        fn current_time(&self) -> f64 {
            self.shared.lock().unwrap().now
        }

        fn state(&self) -> OutputState {
            self.shared.lock().unwrap().state.unwrap_or(OutputState::Suspended)
        }

        async fn resume(&mut self) -> Result<(), PlaybackError> {
            let mut shared = self.shared.lock().unwrap();
            shared.resumes += 1;
            shared.state = Some(OutputState::Running);
            Ok(())
        }

        async fn close(&mut self) -> Result<(), PlaybackError> {
            let mut shared = self.shared.lock().unwrap();
            shared.closes += 1;
            shared.state = Some(OutputState::Closed);
            Ok(())
        }

        fn schedule(&mut self, buffer: OutputBuffer, start_at: f64) -> Result<(), PlaybackError> {
            self.shared
                .lock()
                .unwrap()
                .schedules
                .push((start_at, buffer.sample_rate(), buffer.samples().len()));
            Ok(())
        }
    }

    fn engine(native_rate: u32, stream_rate: u32) -> (PlaybackEngine, Arc<Mutex<Recorded>>) {
        let shared = Arc::new(Mutex::new(Recorded::default()));
        let device = ManualOutput {
            native_rate,
            shared: Arc::clone(&shared),
        };
        (PlaybackEngine::new(Box::new(device), stream_rate), shared)
    }

    #[test]
    fn test_back_to_back_frames_are_gapless() {
        let (mut playback, shared) = engine(24000, 24000);

        // 20ms, 40ms, 10ms
        for len in [480usize, 960, 240] {
            playback.play(&vec![100; len]).unwrap();
        }

        let schedules = shared.lock().unwrap().schedules.clone();
        let starts: Vec<f64> = schedules.iter().map(|s| s.0).collect();
        assert!((starts[0] - 0.0).abs() < 1e-9);
        assert!((starts[1] - 0.02).abs() < 1e-9);
        assert!((starts[2] - 0.06).abs() < 1e-9);
        assert!((playback.next_time() - 0.07).abs() < 1e-9);
    }

    #[test]
    fn test_resyncs_to_clock_after_gap() {
        let (mut playback, shared) = engine(24000, 24000);
        playback.play(&[1; 240]).unwrap();

        shared.lock().unwrap().now = 5.0;
        let placed = playback.play(&[1; 240]).unwrap().unwrap();
        assert_eq!(placed.start, 5.0);
        assert!((playback.next_time() - 5.01).abs() < 1e-9);
    }

    #[test]
    fn test_buffer_rate_is_stream_rate_not_device_rate() {
        let (mut playback, shared) = engine(48000, 24000);
        playback.play(&[1; 240]).unwrap();

        let (_, rate, _) = shared.lock().unwrap().schedules[0];
        assert_eq!(rate, 24000);
    }

    #[test]
    fn test_play_frame_rejects_other_rates() {
        let (mut playback, _) = engine(24000, 24000);
        let frame = AudioFrame::new(vec![1; 160], 16000);
        assert!(matches!(
            playback.play_frame(&frame),
            Err(PlaybackError::RateMismatch { frame: 16000, stream: 24000 })
        ));
    }

    #[test]
    fn test_empty_input_ignored() {
        let (mut playback, shared) = engine(24000, 24000);
        assert_eq!(playback.play(&[]).unwrap(), None);
        assert!(shared.lock().unwrap().schedules.is_empty());
    }

    #[tokio::test]
    async fn test_resume_and_stop_are_idempotent() {
        let (mut playback, shared) = engine(24000, 24000);

        playback.resume().await.unwrap();
        playback.resume().await.unwrap();
        assert_eq!(shared.lock().unwrap().resumes, 1);

        playback.stop().await;
        playback.stop().await;
        assert_eq!(shared.lock().unwrap().closes, 1);
        assert!(matches!(playback.play(&[1; 10]), Err(PlaybackError::Closed)));
    }
}
