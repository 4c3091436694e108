use super::config::LiveSessionConfig;
use super::persistence::SessionPersistence;
use super::record::TranscriptEntry;
use super::stats::SessionStats;
use crate::audio::{shared_buffer, AudioFrame, FrameFlusher, SharedFrameBuffer};
use crate::capture::{start_capture, AudioThread, CaptureEvent, CaptureHandle, CaptureStatus, MicrophoneDevice};
use crate::playback::{OutputDevice, PlaybackEngine};
use crate::preload::ResourcePool;
use crate::transport::{
    LiveTransport, SessionMessage, StatusState, StatusUpdate, TranscriptMessage, TransportEvent,
};
use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long `stop` waits for the capture pump to drain before aborting it
const CAPTURE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const STATS_REPLY_TIMEOUT: Duration = Duration::from_millis(500);

/// Events for the UI collaborator
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Capture(CaptureStatus),
    Connection(StatusUpdate),
    SpeechStart,
    SpeechEnd,
    Activity { speaking: bool, level: f32 },
    Transcript(TranscriptMessage),
    Session(SessionMessage),
    Error(String),
}

#[derive(Default)]
struct Counters {
    frames_captured: AtomicU64,
    frames_sent: AtomicU64,
    buffers_played: AtomicU64,
    barge_ins: AtomicU64,
    transcripts: AtomicUsize,
}

type SharedPlayback = Arc<Mutex<Option<PlaybackEngine>>>;

/// A live interview session: microphone to server, coach speech back to the
/// speaker, transcript into crash-recovery storage.
pub struct LiveSession {
    /// Session configuration
    config: LiveSessionConfig,

    /// Connection to the live endpoint
    transport: Arc<LiveTransport>,

    /// Transport events, consumed once the session starts
    transport_events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,

    /// Crash-recovery storage
    persistence: Arc<SessionPersistence>,

    /// Preloaded audio thread, if any
    audio_pool: Option<Arc<ResourcePool<AudioThread>>>,

    /// Outbound events for the UI
    events: mpsc::UnboundedSender<SessionEvent>,

    /// When the session started
    started_at: chrono::DateTime<chrono::Utc>,

    /// Whether the session is currently live
    is_live: Arc<AtomicBool>,

    counters: Arc<Counters>,

    /// Captured frames waiting for the transport
    buffer: SharedFrameBuffer,

    capture: Mutex<Option<CaptureHandle>>,
    flusher: Mutex<Option<Arc<FrameFlusher>>>,
    playback: SharedPlayback,

    /// Handle for the capture event task
    capture_task: Mutex<Option<JoinHandle<()>>>,

    /// Handle for the transport event task
    transport_task: Mutex<Option<JoinHandle<()>>>,
}

impl LiveSession {
    pub fn new(
        config: LiveSessionConfig,
        transport: LiveTransport,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        persistence: Arc<SessionPersistence>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        info!("Creating live session: {}", config.session_id);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let buffer = shared_buffer(config.max_buffered_frames);

        let session = Self {
            config,
            transport: Arc::new(transport),
            transport_events: Mutex::new(Some(transport_events)),
            persistence,
            audio_pool: None,
            events: events_tx,
            started_at: Utc::now(),
            is_live: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
            buffer,
            capture: Mutex::new(None),
            flusher: Mutex::new(None),
            playback: Arc::new(Mutex::new(None)),
            capture_task: Mutex::new(None),
            transport_task: Mutex::new(None),
        };
        (session, events_rx)
    }

    /// Claim the audio thread from `pool` if one was preloaded.
    pub fn with_audio_pool(mut self, pool: Arc<ResourcePool<AudioThread>>) -> Self {
        self.audio_pool = Some(pool);
        self
    }

    pub fn config(&self) -> &LiveSessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &LiveTransport {
        &self.transport
    }

    /// Connect, start the interview and begin capturing.
    pub async fn start(
        &self,
        microphone: Box<dyn MicrophoneDevice>,
        output: Box<dyn OutputDevice>,
    ) -> Result<()> {
        if self.is_live.swap(true, Ordering::SeqCst) {
            warn!("Session already started");
            return Ok(());
        }

        info!("Starting live session: {}", self.config.session_id);

        if let Err(e) = self.bring_up(microphone, output).await {
            error!("Session start failed: {:#}", e);
            if let Err(stop_err) = self.stop().await {
                warn!("Cleanup after failed start: {:#}", stop_err);
            }
            return Err(e);
        }

        info!("Live session started successfully");
        Ok(())
    }

    async fn bring_up(
        &self,
        microphone: Box<dyn MicrophoneDevice>,
        output: Box<dyn OutputDevice>,
    ) -> Result<()> {
        let profile = self.config.profile;
        let initial = json!({
            "interview_id": self.config.interview_id,
            "user_id": self.config.user_id,
            "profile": profile,
        });
        self.persistence
            .start_session(&self.config.session_id, into_map(initial))
            .await
            .context("Failed to create session record")?;

        // Playback first so the first coach audio has somewhere to go
        let mut playback = PlaybackEngine::new(output, profile.sample_rate);
        if let Err(e) = playback.resume().await {
            warn!("Output device did not resume: {}", e);
        }
        *self.playback.lock().await = Some(playback);

        let transport_events = self
            .transport_events
            .lock()
            .await
            .take()
            .context("Transport events already consumed")?;
        let transport_task = tokio::spawn(pump_transport(
            transport_events,
            Arc::clone(&self.playback),
            Arc::clone(&self.persistence),
            Arc::clone(&self.counters),
            self.events.clone(),
            profile.sample_rate,
        ));
        *self.transport_task.lock().await = Some(transport_task);

        self.transport
            .connect()
            .await
            .context("Failed to connect to live endpoint")?;
        self.transport.start(
            &self.config.interview_id,
            &self.config.user_id,
            self.config.start.clone(),
        );

        let (capture, capture_events) = start_capture(
            microphone,
            self.config.capture.clone(),
            self.audio_pool.as_deref(),
        )
        .await
        .context("Failed to start microphone capture")?;
        *self.capture.lock().await = Some(capture);

        let flusher = {
            let send = Arc::clone(&self.transport);
            let gate = Arc::clone(&self.transport);
            let counters = Arc::clone(&self.counters);
            Arc::new(FrameFlusher::new(
                Arc::clone(&self.buffer),
                self.config.frame_interval,
                move |frame: AudioFrame| {
                    counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                    send.send_audio(frame);
                },
                move || gate.is_connected(),
            ))
        };
        *self.flusher.lock().await = Some(Arc::clone(&flusher));

        let capture_task = tokio::spawn(pump_capture(
            capture_events,
            Arc::clone(&self.buffer),
            flusher,
            Arc::clone(&self.transport),
            Arc::clone(&self.playback),
            Arc::clone(&self.counters),
            self.events.clone(),
        ));
        *self.capture_task.lock().await = Some(capture_task);

        Ok(())
    }

    /// Tear down capture, flusher, transport, playback and persistence, in
    /// that order. Teardown failures are logged, never returned.
    pub async fn stop(&self) -> Result<SessionStats> {
        if !self.is_live.swap(false, Ordering::SeqCst) {
            warn!("Session not live");
            return self.get_stats().await;
        }

        info!("Stopping live session: {}", self.config.session_id);

        if let Some(capture) = self.capture.lock().await.take() {
            capture.stop().await;
        }

        // The pump ends once the capture side drops its sender
        if let Some(task) = self.capture_task.lock().await.take() {
            let abort = task.abort_handle();
            match tokio::time::timeout(CAPTURE_DRAIN_TIMEOUT, task).await {
                Ok(Err(e)) if !e.is_cancelled() => error!("Capture task panicked: {}", e),
                Ok(_) => {}
                Err(_) => {
                    warn!("Capture task did not drain, aborting");
                    abort.abort();
                }
            }
        }

        if let Some(flusher) = self.flusher.lock().await.take() {
            flusher.stop();
        }
        let unsent = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|p| p.into_inner());
            let unsent = buffer.size();
            buffer.clear();
            unsent
        };
        if unsent > 0 {
            debug!("Discarding {} unsent frames", unsent);
        }

        // The reply is dropped once the transport is closed
        self.transport.request_stats(STATS_REPLY_TIMEOUT).await;
        self.transport.stop();
        self.transport.close();

        if let Some(task) = self.transport_task.lock().await.take() {
            task.abort();
        }

        if let Some(mut playback) = self.playback.lock().await.take() {
            playback.stop().await;
        }

        let stats = self.get_stats().await?;

        let final_data = json!({
            "stats": {
                "duration_secs": stats.duration_secs,
                "frames_captured": stats.frames_captured,
                "frames_sent": stats.frames_sent,
                "frames_dropped": stats.frames_dropped,
                "barge_ins": stats.barge_ins,
            }
        });
        if let Err(e) = self.persistence.end_session(into_map(final_data)).await {
            warn!("Failed to finalise session record: {}", e);
        }

        info!("Live session stopped successfully");
        Ok(stats)
    }

    /// Get current session statistics
    pub async fn get_stats(&self) -> Result<SessionStats> {
        let duration = Utc::now().signed_duration_since(self.started_at);
        let frames_dropped = self
            .buffer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .dropped();

        Ok(SessionStats {
            is_live: self.is_live.load(Ordering::SeqCst),
            started_at: self.started_at,
            duration_secs: duration.num_milliseconds() as f64 / 1000.0,
            frames_captured: self.counters.frames_captured.load(Ordering::Relaxed),
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            frames_dropped,
            buffers_played: self.counters.buffers_played.load(Ordering::Relaxed),
            transcript_count: self.counters.transcripts.load(Ordering::Relaxed),
            barge_ins: self.counters.barge_ins.load(Ordering::Relaxed),
            network: self.transport.last_stats(),
        })
    }

    /// Save queued session updates immediately, e.g. before the process is
    /// backgrounded.
    pub async fn checkpoint(&self) {
        if let Err(e) = self.persistence.flush().await {
            warn!("Session checkpoint failed: {}", e);
        }
    }
}

fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn emit(events: &mpsc::UnboundedSender<SessionEvent>, event: SessionEvent) {
    // The UI may have gone away; the pipeline keeps running regardless.
    let _ = events.send(event);
}

async fn pump_capture(
    mut capture_events: mpsc::UnboundedReceiver<CaptureEvent>,
    buffer: SharedFrameBuffer,
    flusher: Arc<FrameFlusher>,
    transport: Arc<LiveTransport>,
    playback: SharedPlayback,
    counters: Arc<Counters>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    info!("Capture task started");

    while let Some(event) = capture_events.recv().await {
        match event {
            CaptureEvent::Frame(frame) => {
                counters.frames_captured.fetch_add(1, Ordering::Relaxed);
                buffer.lock().unwrap_or_else(|p| p.into_inner()).push(frame);
                flusher.start();
            }
            CaptureEvent::SpeechStart => {
                let coach_speaking = playback
                    .lock()
                    .await
                    .as_ref()
                    .map(|engine| engine.is_playing())
                    .unwrap_or(false);
                if coach_speaking {
                    info!("User spoke over coach audio, sending barge-in");
                    counters.barge_ins.fetch_add(1, Ordering::Relaxed);
                    transport.barge_in();
                }
                emit(&events, SessionEvent::SpeechStart);
            }
            CaptureEvent::SpeechEnd => emit(&events, SessionEvent::SpeechEnd),
            CaptureEvent::Activity { speaking, level } => {
                emit(&events, SessionEvent::Activity { speaking, level });
            }
            CaptureEvent::Status(status) => {
                if status == CaptureStatus::Ended {
                    info!("Microphone input ended");
                }
                emit(&events, SessionEvent::Capture(status));
            }
        }
    }

    info!("Capture task stopped");
}

async fn pump_transport(
    mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    playback: SharedPlayback,
    persistence: Arc<SessionPersistence>,
    counters: Arc<Counters>,
    events: mpsc::UnboundedSender<SessionEvent>,
    stream_rate: u32,
) {
    info!("Transport task started");

    while let Some(event) = transport_events.recv().await {
        match event {
            TransportEvent::Audio(decoded) => {
                let frame = AudioFrame::new(decoded.samples, decoded.sample_rate.unwrap_or(stream_rate));
                let mut guard = playback.lock().await;
                let Some(engine) = guard.as_mut() else {
                    continue;
                };
                match engine.play_frame(&frame) {
                    Ok(Some(_)) => {
                        counters.buffers_played.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Dropping coach audio: {}", e),
                }
            }
            TransportEvent::Transcript(transcript) => {
                if transcript.is_final != Some(false) {
                    counters.transcripts.fetch_add(1, Ordering::Relaxed);
                    persistence.add_transcript(TranscriptEntry::from(transcript.clone()));
                }
                info!("[{}] {}", transcript.role, transcript.text);
                emit(&events, SessionEvent::Transcript(transcript));
            }
            TransportEvent::Session(session) => {
                info!("Server session {} ({})", session.session_id, session.mode);
                persistence.update_session(into_map(json!({
                    "server_session_id": session.session_id,
                    "mode": session.mode,
                })));
                emit(&events, SessionEvent::Session(session));
            }
            TransportEvent::Status(status) => {
                match status.state {
                    StatusState::Reconnecting => warn!(
                        "Connection lost, reconnecting (attempt {}/{})",
                        status.attempt.unwrap_or(0),
                        status.max_attempts.unwrap_or(0)
                    ),
                    StatusState::Disconnected => {
                        warn!("Disconnected from live endpoint");
                        if let Err(e) = persistence.flush().await {
                            warn!("Flush after disconnect failed: {}", e);
                        }
                    }
                    StatusState::StreamComplete => info!("Coach finished speaking"),
                    _ => debug!("Status: {:?}", status.state),
                }
                emit(&events, SessionEvent::Connection(status));
            }
            TransportEvent::Error(message) => {
                warn!("Live endpoint error: {}", message);
                emit(&events, SessionEvent::Error(message));
            }
            TransportEvent::TranscriptBackup(backup) => match serde_json::to_value(&backup) {
                Ok(value) => persistence.update_session(into_map(json!({ "transcript_backup": value }))),
                Err(e) => warn!("Failed to encode transcript backup: {}", e),
            },
        }
    }

    info!("Transport task stopped");
}
