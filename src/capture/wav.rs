use std::path::{Path, PathBuf};
use std::time::Duration;

use hound::{SampleFormat, WavReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use super::device::{DeviceCapabilities, InputStream, MicrophoneDevice, StreamConstraints};
use crate::error::CaptureError;

/// Render quantum of a typical audio graph.
pub const DEFAULT_BLOCK_SIZE: usize = 128;

/// Microphone backed by a WAV file.
///
/// Multi-channel files are mixed down to mono. With `realtime` set, blocks are
/// released at the pace a live device would deliver them.
pub struct WavMicrophone {
    path: PathBuf,
    name: String,
    block_size: usize,
    realtime: bool,
    capabilities: DeviceCapabilities,
    producer: Option<JoinHandle<()>>,
}

impl WavMicrophone {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            name: format!("wav:{}", path.display()),
            path,
            block_size: DEFAULT_BLOCK_SIZE,
            realtime: false,
            capabilities: DeviceCapabilities::default(),
            producer: None,
        }
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// Override the advertised capabilities, e.g. to force the inline strategy.
    pub fn with_capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn read_mono(&self) -> Result<(u32, Vec<f32>), CaptureError> {
        let reader = WavReader::open(&self.path).map_err(map_open_error)?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let interleaved: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<Vec<_>, _>>()?,
            SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<Vec<_>, _>>()?
            }
        };

        let mono = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();

        Ok((spec.sample_rate, mono))
    }
}

fn map_open_error(err: hound::Error) -> CaptureError {
    match err {
        hound::Error::IoError(io) if io.kind() == std::io::ErrorKind::PermissionDenied => {
            CaptureError::PermissionDenied
        }
        other => CaptureError::Wav(other),
    }
}

#[async_trait::async_trait]
impl MicrophoneDevice for WavMicrophone {
    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    async fn open(&mut self, constraints: &StreamConstraints) -> Result<InputStream, CaptureError> {
        if self.producer.is_some() {
            return Err(CaptureError::Device("microphone already open".to_string()));
        }

        let (sample_rate, samples) = self.read_mono()?;
        info!(
            "Opened {} ({}Hz, {:.1}s, {} channel requested)",
            self.name,
            sample_rate,
            samples.len() as f64 / sample_rate.max(1) as f64,
            constraints.channel_count
        );

        let (tx, rx) = mpsc::channel(64);
        let block_size = self.block_size;
        let pace = self
            .realtime
            .then(|| Duration::from_secs_f64(block_size as f64 / sample_rate.max(1) as f64));

        let producer = tokio::spawn(async move {
            let mut ticker = pace.map(tokio::time::interval);
            for block in samples.chunks(block_size) {
                if let Some(ticker) = ticker.as_mut() {
                    ticker.tick().await;
                }
                if tx.send(block.to_vec()).await.is_err() {
                    break;
                }
            }
        });

        self.producer = Some(producer);
        Ok(InputStream {
            sample_rate,
            blocks: rx,
        })
    }

    async fn close(&mut self) -> Result<(), CaptureError> {
        if let Some(producer) = self.producer.take() {
            producer.abort();
            info!("Closed {}", self.name);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.producer.is_some()
    }

    fn name(&self) -> &str {
        &self.name
    }
}
