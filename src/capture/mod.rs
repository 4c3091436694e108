//! Microphone capture
//!
//! Acquires an input device, resamples to the session rate, cuts fixed-size
//! PCM16 frames and runs speech detection over each frame. Processing happens
//! on a dedicated audio thread when the device allows it, inline otherwise;
//! callers see the same `CaptureEvent` stream either way.

mod device;
mod engine;
mod processor;
mod thread;
mod wav;

pub use device::{DeviceCapabilities, InputStream, MicrophoneDevice, StreamConstraints};
pub use engine::{is_supported, start_capture, CaptureHandle, CaptureOptions, CaptureStrategy};
pub use processor::{CaptureEvent, CaptureStatus, FrameProcessor};
pub use thread::AudioThread;
pub use wav::{WavMicrophone, DEFAULT_BLOCK_SIZE};
