pub mod audio;
pub mod capture;
pub mod config;
pub mod error;
pub mod playback;
pub mod preload;
pub mod session;
pub mod transport;

pub use audio::{
    ActivityConfig, ActivityDetector, AudioFrame, AudioProfile, EnvironmentProbe, FrameBuffer,
    FrameFlusher, ProfileTier, SpeechTransition,
};
pub use capture::{
    start_capture, CaptureEvent, CaptureHandle, CaptureOptions, CaptureStatus, CaptureStrategy,
    MicrophoneDevice, WavMicrophone,
};
pub use config::Config;
pub use error::{
    AudioDecodeError, CaptureError, CleanupError, MessageError, PersistenceError, PlaybackError,
    TransportError,
};
pub use playback::{OutputDevice, PlaybackEngine, WavOutput};
pub use preload::{PoolState, Preloader, ResourcePool};
pub use session::{
    FileStore, LiveSession, LiveSessionConfig, MemoryStore, SessionEvent, SessionPersistence,
    SessionRecord, SessionStats, SessionStore,
};
pub use transport::{
    Connector, LinkState, LiveTransport, NetworkWorker, StartOptions, TransportEvent,
    TransportOptions, WsConnector,
};
