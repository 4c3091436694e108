use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::device::{MicrophoneDevice, StreamConstraints};
use super::processor::{CaptureEvent, CaptureStatus, FrameProcessor};
use super::thread::{run_inline, AudioThread, CaptureJob};
use crate::audio::activity::{DEFAULT_SILENCE_THRESHOLD, DEFAULT_SILENCE_WINDOW_MS};
use crate::audio::{ActivityConfig, AudioProfile};
use crate::error::{CaptureError, CleanupError};
use crate::preload::ResourcePool;

/// Where input blocks are processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStrategy {
    /// Dedicated OS thread, nothing runs on the async runtime
    AudioThread,
    /// Inside a tokio task, for platforms without an audio thread
    Inline,
}

/// Capture parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOptions {
    pub target_sample_rate: u32,
    pub frame_duration_ms: u32,
    pub speech_threshold: f32,
    pub start_window_ms: u32,
    pub silence_window_ms: u32,
    pub constraints: StreamConstraints,
}

impl CaptureOptions {
    pub fn from_profile(profile: &AudioProfile) -> Self {
        Self {
            target_sample_rate: profile.sample_rate,
            frame_duration_ms: profile.frame_duration_ms,
            ..Self::default()
        }
    }

    pub fn activity(&self) -> ActivityConfig {
        ActivityConfig {
            frame_duration_ms: self.frame_duration_ms,
            silence_threshold: self.speech_threshold,
            start_window_ms: self.start_window_ms,
            silence_window_ms: self.silence_window_ms,
        }
    }
}

impl Default for CaptureOptions {
    fn default() -> Self {
        let profile = AudioProfile::fallback();
        Self {
            target_sample_rate: profile.sample_rate,
            frame_duration_ms: profile.frame_duration_ms,
            speech_threshold: DEFAULT_SILENCE_THRESHOLD,
            start_window_ms: profile.frame_duration_ms,
            silence_window_ms: DEFAULT_SILENCE_WINDOW_MS,
            constraints: StreamConstraints::default(),
        }
    }
}

enum Worker {
    Thread(std::thread::JoinHandle<()>),
    Task(JoinHandle<()>),
}

struct Running {
    device: Box<dyn MicrophoneDevice>,
    worker: Worker,
    stop: Arc<AtomicBool>,
}

/// A running capture. `stop` releases everything.
pub struct CaptureHandle {
    sample_rate: u32,
    strategy: CaptureStrategy,
    running: Mutex<Option<Running>>,
}

impl CaptureHandle {
    /// Rate of the emitted frames.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn strategy(&self) -> CaptureStrategy {
        self.strategy
    }

    /// Stop processing, release the microphone and join the worker.
    ///
    /// Idempotent. Cleanup failures are logged, never returned.
    pub async fn stop(&self) {
        let Some(mut running) = self.running.lock().await.take() else {
            return;
        };

        running.stop.store(true, Ordering::SeqCst);

        if let Err(e) = running.device.close().await {
            warn!("{}", CleanupError::new("microphone", e));
        }

        match running.worker {
            Worker::Thread(handle) => {
                match tokio::task::spawn_blocking(move || handle.join()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => warn!("{}", CleanupError::new("audio thread", "panicked")),
                    Err(e) => warn!("{}", CleanupError::new("audio thread", e)),
                }
            }
            Worker::Task(handle) => {
                handle.abort();
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        warn!("{}", CleanupError::new("capture task", e));
                    }
                }
            }
        }

        info!("Microphone capture stopped ({})", running.device.name());
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

/// Whether capture can run on this device at all.
pub fn is_supported(device: &dyn MicrophoneDevice) -> bool {
    device.capabilities().is_supported()
}

/// Acquire the microphone and start emitting frames.
///
/// The strategy is picked from the device's capabilities; both produce the
/// same event stream. A preloaded audio thread is claimed from `pool` if one
/// is ready.
pub async fn start_capture(
    mut device: Box<dyn MicrophoneDevice>,
    options: CaptureOptions,
    pool: Option<&ResourcePool<AudioThread>>,
) -> Result<(CaptureHandle, mpsc::UnboundedReceiver<CaptureEvent>), CaptureError> {
    let capabilities = device.capabilities();
    if !capabilities.microphone {
        return Err(CaptureError::Unsupported(
            "microphone capture not supported".to_string(),
        ));
    }
    let mut strategy = if capabilities.audio_thread {
        CaptureStrategy::AudioThread
    } else if capabilities.block_processor {
        CaptureStrategy::Inline
    } else {
        return Err(CaptureError::Unsupported(
            "no audio processing primitive available".to_string(),
        ));
    };

    let stream = device.open(&options.constraints).await?;
    if stream.sample_rate < options.target_sample_rate {
        if let Err(e) = device.close().await {
            warn!("{}", CleanupError::new("microphone", e));
        }
        return Err(CaptureError::UnsupportedSampleRate {
            native: stream.sample_rate,
            target: options.target_sample_rate,
        });
    }

    info!(
        "Microphone '{}' open: {}Hz native -> {}Hz, {}ms frames",
        device.name(),
        stream.sample_rate,
        options.target_sample_rate,
        options.frame_duration_ms
    );

    let processor = FrameProcessor::new(
        stream.sample_rate,
        options.target_sample_rate,
        options.activity(),
    );
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let stop = Arc::new(AtomicBool::new(false));

    let thread = if strategy == CaptureStrategy::AudioThread {
        let claimed = match pool {
            Some(pool) => pool.acquire(|| async { AudioThread::spawn() }).await,
            None => AudioThread::spawn(),
        };
        match claimed {
            Ok(thread) => Some(thread),
            Err(e) => {
                warn!("Audio thread unavailable, processing inline: {}", e);
                strategy = CaptureStrategy::Inline;
                None
            }
        }
    } else {
        None
    };

    let _ = events_tx.send(CaptureEvent::Status(CaptureStatus::Ready));

    let job = CaptureJob {
        processor,
        blocks: stream.blocks,
        events: events_tx,
        stop: Arc::clone(&stop),
    };

    let worker = match thread {
        Some(thread) => match thread.run(job) {
            Ok(handle) => Worker::Thread(handle),
            Err(e) => {
                if let Err(close_err) = device.close().await {
                    warn!("{}", CleanupError::new("microphone", close_err));
                }
                return Err(e);
            }
        },
        None => Worker::Task(tokio::spawn(run_inline(job))),
    };

    let handle = CaptureHandle {
        sample_rate: options.target_sample_rate,
        strategy,
        running: Mutex::new(Some(Running {
            device,
            worker,
            stop,
        })),
    };

    Ok((handle, events_rx))
}
