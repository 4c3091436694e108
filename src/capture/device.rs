use tokio::sync::mpsc;

use crate::error::CaptureError;

/// What the platform offers for capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// A microphone can be opened at all
    pub microphone: bool,
    /// Blocks may be processed on a dedicated audio thread
    pub audio_thread: bool,
    /// Blocks may be processed inline by the dispatching task
    pub block_processor: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            microphone: true,
            audio_thread: true,
            block_processor: true,
        }
    }
}

impl DeviceCapabilities {
    pub fn is_supported(&self) -> bool {
        self.microphone && (self.audio_thread || self.block_processor)
    }
}

/// Processing requested from the input device. Best effort: a device may
/// ignore any of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConstraints {
    pub channel_count: u16,
    pub noise_suppression: bool,
    pub echo_cancellation: bool,
    pub auto_gain_control: bool,
}

impl Default for StreamConstraints {
    fn default() -> Self {
        Self {
            channel_count: 1,
            noise_suppression: true,
            echo_cancellation: true,
            auto_gain_control: true,
        }
    }
}

/// An open microphone stream: mono float blocks at the device's native rate.
///
/// The stream ends when the device is closed or runs out of input.
#[derive(Debug)]
pub struct InputStream {
    pub sample_rate: u32,
    pub blocks: mpsc::Receiver<Vec<f32>>,
}

/// Microphone port.
///
/// Implementations:
/// - `WavMicrophone`: reads a WAV file, optionally paced in real time
#[async_trait::async_trait]
pub trait MicrophoneDevice: Send + Sync {
    fn capabilities(&self) -> DeviceCapabilities;

    /// Acquire the microphone.
    ///
    /// Fails with `PermissionDenied` if access is refused.
    async fn open(&mut self, constraints: &StreamConstraints) -> Result<InputStream, CaptureError>;

    /// Release the microphone. Must be safe to call when not open.
    async fn close(&mut self) -> Result<(), CaptureError>;

    fn is_open(&self) -> bool;

    /// Device name for logging
    fn name(&self) -> &str;
}
