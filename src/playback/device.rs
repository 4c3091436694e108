use crate::error::PlaybackError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    Suspended,
    Running,
    Closed,
}

/// Mono float samples tagged with the rate they were recorded at.
///
/// The device resamples to its own rate if it differs; the buffer's rate is
/// always the stream's rate.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputBuffer {
    sample_rate: u32,
    samples: Vec<f32>,
}

impl OutputBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            sample_rate,
            samples,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Audio output port with its own clock.
///
/// `current_time` is in seconds on the device clock and only advances while
/// the device is running.
#[async_trait::async_trait]
pub trait OutputDevice: Send {
    fn native_sample_rate(&self) -> u32;

    fn current_time(&self) -> f64;

    fn state(&self) -> OutputState;

    async fn resume(&mut self) -> Result<(), PlaybackError>;

    async fn close(&mut self) -> Result<(), PlaybackError>;

    /// Queue `buffer` to start at `start_at` seconds on the device clock.
    fn schedule(&mut self, buffer: OutputBuffer, start_at: f64) -> Result<(), PlaybackError>;
}
