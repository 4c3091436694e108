use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tokio::time::Instant;
use tracing::{info, warn};

use super::device::{OutputBuffer, OutputDevice, OutputState};
use crate::audio::dsp::{float_to_pcm16, resample_linear};
use crate::error::PlaybackError;

/// Output device that renders its timeline into a WAV file.
///
/// The clock is wall time while running and frozen while suspended, starting
/// suspended. Scheduled buffers land at their start time; gaps become silence.
pub struct WavOutput {
    path: PathBuf,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    native_rate: u32,
    state: OutputState,
    elapsed: Duration,
    resumed_at: Option<Instant>,
    written_samples: u64,
}

impl WavOutput {
    pub fn create(path: impl AsRef<Path>, native_rate: u32) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: native_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let writer = hound::WavWriter::create(&path, spec)
            .with_context(|| format!("Failed to create WAV file: {:?}", path))?;

        info!("Playback output: {} ({}Hz)", path.display(), native_rate);

        Ok(Self {
            path,
            writer: Some(writer),
            native_rate,
            state: OutputState::Suspended,
            elapsed: Duration::ZERO,
            resumed_at: None,
            written_samples: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Seconds of audio rendered so far, silence included.
    pub fn rendered_duration(&self) -> f64 {
        self.written_samples as f64 / self.native_rate as f64
    }

    fn finalize(&mut self) -> Result<(), PlaybackError> {
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl OutputDevice for WavOutput {
    fn native_sample_rate(&self) -> u32 {
        self.native_rate
    }

    fn current_time(&self) -> f64 {
        let running = self
            .resumed_at
            .map(|at| at.elapsed())
            .unwrap_or(Duration::ZERO);
        (self.elapsed + running).as_secs_f64()
    }

    fn state(&self) -> OutputState {
        self.state
    }

    async fn resume(&mut self) -> Result<(), PlaybackError> {
        match self.state {
            OutputState::Closed => Err(PlaybackError::Closed),
            OutputState::Running => Ok(()),
            OutputState::Suspended => {
                self.resumed_at = Some(Instant::now());
                self.state = OutputState::Running;
                Ok(())
            }
        }
    }

    async fn close(&mut self) -> Result<(), PlaybackError> {
        if self.state == OutputState::Closed {
            return Ok(());
        }
        if let Some(at) = self.resumed_at.take() {
            self.elapsed += at.elapsed();
        }
        self.state = OutputState::Closed;
        self.finalize()?;
        info!(
            "Playback output closed: {} ({:.2}s rendered)",
            self.path.display(),
            self.rendered_duration()
        );
        Ok(())
    }

    fn schedule(&mut self, buffer: OutputBuffer, start_at: f64) -> Result<(), PlaybackError> {
        let writer = self.writer.as_mut().ok_or(PlaybackError::Closed)?;

        let samples = resample_linear(buffer.samples(), buffer.sample_rate(), self.native_rate);
        let start_sample = (start_at * self.native_rate as f64).round().max(0.0) as u64;

        if start_sample < self.written_samples {
            warn!(
                "Buffer scheduled at {:.3}s overlaps rendered audio, appending",
                start_at
            );
        }
        for _ in self.written_samples..start_sample {
            writer.write_sample(0i16)?;
            self.written_samples += 1;
        }

        for sample in float_to_pcm16(&samples) {
            writer.write_sample(sample)?;
        }
        self.written_samples += samples.len() as u64;

        Ok(())
    }
}

impl Drop for WavOutput {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            warn!("Failed to finalize playback WAV on drop: {}", e);
        }
    }
}
