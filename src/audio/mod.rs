pub mod activity;
pub mod buffer;
pub mod dsp;
pub mod frame;
pub mod profile;

pub use activity::{ActivityConfig, ActivityDetector, SpeechTransition};
pub use buffer::{shared_buffer, FrameBuffer, FrameFlusher, SharedFrameBuffer};
pub use frame::{frame_len, AudioFrame};
pub use profile::{AudioProfile, EnvironmentProbe, ProfileTier};
