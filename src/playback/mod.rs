//! Coach speech playback
//!
//! Decoded PCM16 buffers are queued back to back on the output device's
//! clock so consecutive buffers play without gaps.

mod device;
mod engine;
mod wav;

pub use device::{OutputBuffer, OutputDevice, OutputState};
pub use engine::{PlaybackEngine, ScheduledBuffer};
pub use wav::WavOutput;
