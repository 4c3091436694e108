// Bounded frame queue and the paced loop that drains it.
//
// The buffer drops its oldest frames when full. The flusher pulls one frame
// per tick and stops itself when the queue is empty or sending is gated off;
// the producer restarts it when new frames arrive.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use super::frame::AudioFrame;

pub const DEFAULT_MAX_FRAMES: usize = 60;
pub const DEFAULT_FRAME_INTERVAL_MS: u64 = 20;

/// FIFO of frames with drop-oldest overflow.
#[derive(Debug)]
pub struct FrameBuffer {
    frames: VecDeque<AudioFrame>,
    max_frames: usize,
    dropped: u64,
}

impl FrameBuffer {
    pub fn new(max_frames: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(max_frames),
            max_frames,
            dropped: 0,
        }
    }

    /// Append a frame. Empty frames are ignored.
    pub fn push(&mut self, frame: AudioFrame) {
        if frame.is_empty() {
            return;
        }

        self.frames.push_back(frame);
        while self.frames.len() > self.max_frames {
            self.frames.pop_front();
            self.dropped += 1;
        }
    }

    pub fn shift(&mut self) -> Option<AudioFrame> {
        self.frames.pop_front()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn size(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_frames
    }

    /// Frames discarded by overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAMES)
    }
}

/// Buffer shared between the capture side and the flusher.
pub type SharedFrameBuffer = Arc<Mutex<FrameBuffer>>;

pub fn shared_buffer(max_frames: usize) -> SharedFrameBuffer {
    Arc::new(Mutex::new(FrameBuffer::new(max_frames)))
}

fn lock(buffer: &SharedFrameBuffer) -> MutexGuard<'_, FrameBuffer> {
    buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type SendFrame = Arc<dyn Fn(AudioFrame) + Send + Sync>;
type ShouldSend = Arc<dyn Fn() -> bool + Send + Sync>;

struct FlushRun {
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Fixed-interval drain of a `FrameBuffer`.
///
/// Must be started from within a tokio runtime.
pub struct FrameFlusher {
    buffer: SharedFrameBuffer,
    send_frame: SendFrame,
    should_send: ShouldSend,
    interval: Duration,
    run: Mutex<Option<FlushRun>>,
}

impl FrameFlusher {
    pub fn new<S, P>(
        buffer: SharedFrameBuffer,
        interval: Duration,
        send_frame: S,
        should_send: P,
    ) -> Self
    where
        S: Fn(AudioFrame) + Send + Sync + 'static,
        P: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            buffer,
            send_frame: Arc::new(send_frame),
            should_send: Arc::new(should_send),
            interval,
            run: Mutex::new(None),
        }
    }

    /// Start the timer. Returns `false` if one is already running.
    pub fn start(&self) -> bool {
        let mut run = self.run.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(current) = run.as_ref() {
            if current.running.load(Ordering::SeqCst) {
                return false;
            }
        }

        let running = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(flush_loop(
            Arc::clone(&self.buffer),
            Arc::clone(&self.send_frame),
            Arc::clone(&self.should_send),
            self.interval,
            Arc::clone(&running),
        ));

        *run = Some(FlushRun { running, task });
        true
    }

    pub fn stop(&self) {
        let mut run = self.run.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(current) = run.take() {
            current.running.store(false, Ordering::SeqCst);
            current.task.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        let run = self.run.lock().unwrap_or_else(|p| p.into_inner());
        run.as_ref()
            .map(|current| current.running.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

impl Drop for FrameFlusher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn flush_loop(
    buffer: SharedFrameBuffer,
    send_frame: SendFrame,
    should_send: ShouldSend,
    period: Duration,
    running: Arc<AtomicBool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        if !running.load(Ordering::SeqCst) {
            break;
        }
        if !should_send() {
            debug!("Frame flusher gated off, stopping");
            break;
        }

        let next = lock(&buffer).shift();
        match next {
            Some(frame) => send_frame(frame),
            None => {
                debug!("Frame buffer drained, flusher stopping");
                break;
            }
        }
    }

    running.store(false, Ordering::SeqCst);
}
