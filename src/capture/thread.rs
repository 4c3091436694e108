// Dedicated audio-processing thread.
//
// The thread is spawned parked on a job channel so it can be created ahead of
// time and claimed later. It runs exactly one capture job, then exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;
use tracing::{debug, info};

use super::processor::{CaptureEvent, CaptureStatus, FrameProcessor};
use crate::error::CaptureError;

pub(crate) struct CaptureJob {
    pub processor: FrameProcessor,
    pub blocks: mpsc::Receiver<Vec<f32>>,
    pub events: mpsc::UnboundedSender<CaptureEvent>,
    pub stop: Arc<AtomicBool>,
}

/// A parked OS thread waiting for its capture job.
pub struct AudioThread {
    jobs: std_mpsc::SyncSender<CaptureJob>,
    handle: JoinHandle<()>,
}

impl AudioThread {
    pub fn spawn() -> Result<Self, CaptureError> {
        let (jobs, job_rx) = std_mpsc::sync_channel::<CaptureJob>(1);

        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                // Parked until claimed; a dropped AudioThread ends the wait.
                if let Ok(job) = job_rx.recv() {
                    run_job(job);
                }
            })
            .map_err(|e| CaptureError::Unsupported(format!("audio thread unavailable: {e}")))?;

        debug!("Audio thread spawned");
        Ok(Self { jobs, handle })
    }

    /// Hand the thread its job. Consumes the thread.
    pub(crate) fn run(self, job: CaptureJob) -> Result<JoinHandle<()>, CaptureError> {
        self.jobs
            .send(job)
            .map_err(|_| CaptureError::Device("audio thread exited before start".to_string()))?;
        Ok(self.handle)
    }
}

fn run_job(mut job: CaptureJob) {
    info!("Audio thread processing started");

    while let Some(block) = job.blocks.blocking_recv() {
        if job.stop.load(Ordering::SeqCst) {
            break;
        }
        for event in job.processor.process(&block) {
            if job.events.send(event).is_err() {
                return;
            }
        }
    }

    if !job.stop.load(Ordering::SeqCst) {
        let _ = job.events.send(CaptureEvent::Status(CaptureStatus::Ended));
    }
    info!("Audio thread processing stopped");
}

/// Inline counterpart of `run_job` for platforms without an audio thread.
pub(crate) async fn run_inline(mut job: CaptureJob) {
    debug!("Inline capture processing started");

    while let Some(block) = job.blocks.recv().await {
        if job.stop.load(Ordering::SeqCst) {
            break;
        }
        for event in job.processor.process(&block) {
            if job.events.send(event).is_err() {
                return;
            }
        }
    }

    if !job.stop.load(Ordering::SeqCst) {
        let _ = job.events.send(CaptureEvent::Status(CaptureStatus::Ended));
    }
    debug!("Inline capture processing stopped");
}
