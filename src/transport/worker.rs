//! Network worker
//!
//! A tokio task that owns the socket. Everything else talks to it through
//! [`WorkerCommand`] and [`WorkerEvent`] channels only: socket I/O, reconnect
//! delays, the heartbeat and audio batching never run on the caller's task.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::messages::{
    CachedTranscript, ClientMessage, InboundAudio, NetworkStats, ServerMessage, SessionMessage,
    StatusState, StatusUpdate, TranscriptBackup, TranscriptMessage,
};
use super::socket::{Connector, FrameSink, FrameStream, SocketLink, WireFrame, ABNORMAL_CLOSURE, NORMAL_CLOSURE};
use crate::audio::AudioFrame;
use crate::error::{MessageError, TransportError};

/// Inbound transcript lines kept for recovery.
const TRANSCRIPT_CACHE_LIMIT: usize = 100;

/// Spacing between reconnect attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every attempt
    #[default]
    Fixed,
    /// Delay doubles per attempt
    Exponential,
}

/// Connection parameters handed to the worker with `connect`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub url: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub backoff: Backoff,
    pub heartbeat_interval: Duration,
    pub batch_interval: Duration,
}

impl WorkerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_millis(600),
            backoff: Backoff::Fixed,
            heartbeat_interval: Duration::from_secs(10),
            batch_interval: Duration::from_millis(60),
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.reconnect_delay,
            Backoff::Exponential => {
                let exponent = attempt.saturating_sub(1).min(16);
                self.reconnect_delay.saturating_mul(1 << exponent)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum WorkerCommand {
    Connect(WorkerConfig),
    Disconnect,
    /// Queued for the next batch; the frame moves into the worker
    Audio(AudioFrame),
    Send(serde_json::Value),
    Start {
        interview_id: String,
        user_id: String,
        resume: Option<bool>,
        live_model: Option<String>,
    },
    Stop,
    BargeIn,
    GetStats,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Status(StatusUpdate),
    Transcript(TranscriptMessage),
    Session(SessionMessage),
    Audio(InboundAudio),
    Error(String),
    Stats(NetworkStats),
    TranscriptBackup(TranscriptBackup),
    /// A message the worker could not classify
    Unrecognized(String),
}

/// Handle to a running network worker task.
///
/// The task idles until it receives `Connect`, so a worker can be spawned
/// ahead of time and parked in a resource pool.
pub struct NetworkWorker {
    commands: mpsc::UnboundedSender<WorkerCommand>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    task: JoinHandle<()>,
}

impl NetworkWorker {
    pub fn spawn(connector: Arc<dyn Connector>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let state = WorkerState::new(connector, events_tx);
        let task = tokio::spawn(run(state, commands_rx));

        Self {
            commands: commands_tx,
            events: events_rx,
            task,
        }
    }

    pub fn send(&self, command: WorkerCommand) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .map_err(|_| TransportError::WorkerUnavailable)
    }

    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        self.events.recv().await
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<WorkerCommand>,
        mpsc::UnboundedReceiver<WorkerEvent>,
        JoinHandle<()>,
    ) {
        (self.commands, self.events, self.task)
    }
}

struct WorkerState {
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    config: Option<WorkerConfig>,
    sink: Option<FrameSink>,
    stream: Option<FrameStream>,
    pending_connect: Option<BoxFuture<'static, Result<SocketLink, TransportError>>>,
    reconnect_at: Option<Instant>,
    should_reconnect: bool,
    reconnect_attempts: u32,
    batch_timer: Option<Interval>,
    heartbeat_timer: Option<Interval>,
    audio_batch: Vec<AudioFrame>,
    stats: NetworkStats,
    transcript_cache: VecDeque<CachedTranscript>,
}

async fn run(mut state: WorkerState, mut commands: mpsc::UnboundedReceiver<WorkerCommand>) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => state.handle_command(command).await,
                None => {
                    state.disconnect().await;
                    break;
                }
            },
            inbound = next_frame(&mut state.stream) => state.handle_inbound(inbound),
            result = finish_connect(&mut state.pending_connect) => state.on_connect_result(result),
            _ = sleep_until(state.reconnect_at) => {
                state.reconnect_at = None;
                state.begin_connect();
            }
            _ = tick(&mut state.batch_timer) => state.flush_batch().await,
            _ = tick(&mut state.heartbeat_timer) => state.send_heartbeat().await,
        }
    }
    debug!("Network worker stopped");
}

async fn next_frame(stream: &mut Option<FrameStream>) -> Option<Result<WireFrame, TransportError>> {
    match stream.as_mut() {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// The future stays in its slot if this is cancelled, so polling resumes
/// on the next loop iteration.
async fn finish_connect(
    pending: &mut Option<BoxFuture<'static, Result<SocketLink, TransportError>>>,
) -> Result<SocketLink, TransportError> {
    let result = match pending.as_mut() {
        Some(connect) => connect.await,
        None => std::future::pending().await,
    };
    *pending = None;
    result
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer.as_mut() {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn periodic(period: Duration) -> Interval {
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

impl WorkerState {
    fn new(connector: Arc<dyn Connector>, events: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self {
            connector,
            events,
            config: None,
            sink: None,
            stream: None,
            pending_connect: None,
            reconnect_at: None,
            should_reconnect: false,
            reconnect_attempts: 0,
            batch_timer: None,
            heartbeat_timer: None,
            audio_batch: Vec::new(),
            stats: NetworkStats::default(),
            transcript_cache: VecDeque::with_capacity(TRANSCRIPT_CACHE_LIMIT),
        }
    }

    fn emit(&self, event: WorkerEvent) {
        // The receiver is gone once the transport has been torn down.
        let _ = self.events.send(event);
    }

    fn is_open(&self) -> bool {
        self.sink.is_some()
    }

    async fn handle_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Connect(config) => {
                self.config = Some(config);
                if self.is_open() {
                    self.emit(WorkerEvent::Status(StatusUpdate::new(StatusState::Connected)));
                    return;
                }
                self.should_reconnect = true;
                if self.pending_connect.is_none() {
                    self.reconnect_at = None;
                    self.begin_connect();
                }
            }
            WorkerCommand::Disconnect => self.disconnect().await,
            WorkerCommand::Audio(frame) => {
                if !frame.is_empty() {
                    self.audio_batch.push(frame);
                }
            }
            WorkerCommand::Send(payload) => self.send_json(&payload).await,
            WorkerCommand::Start {
                interview_id,
                user_id,
                resume,
                live_model,
            } => {
                let message = ClientMessage::Start {
                    interview_id,
                    user_id,
                    resume,
                    live_model,
                };
                self.send_json(&message).await;
            }
            WorkerCommand::Stop => self.send_json(&ClientMessage::Stop).await,
            WorkerCommand::BargeIn => self.send_json(&ClientMessage::BargeIn).await,
            WorkerCommand::GetStats => self.emit(WorkerEvent::Stats(self.stats)),
        }
    }

    fn begin_connect(&mut self) {
        let Some(config) = self.config.as_ref() else {
            warn!("Connect requested before the worker was configured");
            return;
        };

        let url = config.url.clone();
        let connector = Arc::clone(&self.connector);
        debug!("Opening socket to {}", url);
        self.pending_connect = Some(Box::pin(async move { connector.connect(&url).await }));
    }

    fn on_connect_result(&mut self, result: Result<SocketLink, TransportError>) {
        match result {
            Ok(link) => {
                if !self.should_reconnect {
                    debug!("Dropping socket opened after disconnect");
                    return;
                }

                let Some(config) = self.config.as_ref() else {
                    return;
                };
                self.batch_timer = Some(periodic(config.batch_interval));
                self.heartbeat_timer = Some(periodic(config.heartbeat_interval));
                self.sink = Some(link.sink);
                self.stream = Some(link.stream);

                let state = if self.reconnect_attempts > 0 {
                    info!("Reconnected after {} attempt(s)", self.reconnect_attempts);
                    StatusState::Reconnected
                } else {
                    info!("Connected to {}", config.url);
                    StatusState::Connected
                };
                self.reconnect_attempts = 0;
                self.emit(WorkerEvent::Status(StatusUpdate::new(state)));
            }
            Err(e) => {
                warn!("Socket connect failed: {}", e);
                self.emit(WorkerEvent::Error(format!("WebSocket error: {}", e)));
                self.handle_close(ABNORMAL_CLOSURE, e.to_string());
            }
        }
    }

    fn handle_inbound(&mut self, inbound: Option<Result<WireFrame, TransportError>>) {
        match inbound {
            Some(Ok(WireFrame::Text(text))) => self.handle_text(&text),
            Some(Ok(WireFrame::Binary(bytes))) => {
                self.emit(WorkerEvent::Audio(InboundAudio::Binary(bytes)));
            }
            Some(Ok(WireFrame::Close { code, reason })) => self.handle_close(code, reason),
            Some(Err(e)) => {
                warn!("Socket error: {}", e);
                self.emit(WorkerEvent::Error(format!("WebSocket error: {}", e)));
                self.handle_close(ABNORMAL_CLOSURE, e.to_string());
            }
            None => self.handle_close(ABNORMAL_CLOSURE, "connection lost".to_string()),
        }
    }

    fn handle_text(&mut self, text: &str) {
        match ServerMessage::parse(text) {
            Ok(ServerMessage::Status(status)) => self.emit(WorkerEvent::Status(status)),
            Ok(ServerMessage::Transcript(transcript)) => {
                if self.transcript_cache.len() == TRANSCRIPT_CACHE_LIMIT {
                    self.transcript_cache.pop_front();
                }
                self.transcript_cache.push_back(CachedTranscript {
                    message: transcript.clone(),
                    cached_at: Utc::now(),
                });
                self.emit(WorkerEvent::Transcript(transcript));
            }
            Ok(ServerMessage::Session(session)) => self.emit(WorkerEvent::Session(session)),
            Ok(ServerMessage::Audio(audio)) => self.emit(WorkerEvent::Audio(InboundAudio::Json(audio))),
            Ok(ServerMessage::Error(error)) => self.emit(WorkerEvent::Error(error.message)),
            Err(MessageError::Malformed(e)) => {
                warn!("Invalid JSON from server: {}", e);
                self.emit(WorkerEvent::Error("Invalid JSON from server".to_string()));
            }
            Err(e) => self.emit(WorkerEvent::Unrecognized(e.to_string())),
        }
    }

    fn handle_close(&mut self, code: u16, reason: String) {
        self.sink = None;
        self.stream = None;
        self.batch_timer = None;
        self.heartbeat_timer = None;
        if !self.audio_batch.is_empty() {
            debug!("Dropping {} unsent audio frames", self.audio_batch.len());
            self.audio_batch.clear();
        }

        info!("Socket closed: {} {}", code, reason);

        let abnormal = code != NORMAL_CLOSURE;
        let max_attempts = self
            .config
            .as_ref()
            .map(|c| c.max_reconnect_attempts)
            .unwrap_or(0);

        if abnormal && self.should_reconnect && self.reconnect_attempts < max_attempts {
            self.send_backup();
            self.schedule_reconnect(max_attempts);
            return;
        }

        self.should_reconnect = false;
        let has_backup = self.send_backup();
        self.emit(WorkerEvent::Status(StatusUpdate {
            code: Some(code),
            reason: Some(reason),
            has_backup: Some(has_backup),
            ..StatusUpdate::new(StatusState::Disconnected)
        }));
    }

    fn schedule_reconnect(&mut self, max_attempts: u32) {
        self.reconnect_attempts += 1;
        let delay = self
            .config
            .as_ref()
            .map(|c| c.delay_for(self.reconnect_attempts))
            .unwrap_or_default();

        info!(
            "Reconnecting in {}ms (attempt {}/{})",
            delay.as_millis(),
            self.reconnect_attempts,
            max_attempts
        );

        self.emit(WorkerEvent::Status(StatusUpdate {
            attempt: Some(self.reconnect_attempts),
            max_attempts: Some(max_attempts),
            delay_ms: Some(delay.as_millis() as u64),
            ..StatusUpdate::new(StatusState::Reconnecting)
        }));
        self.reconnect_at = Some(Instant::now() + delay);
    }

    /// Emit the transcript cache if it holds anything.
    fn send_backup(&self) -> bool {
        if self.transcript_cache.is_empty() {
            return false;
        }
        self.emit(WorkerEvent::TranscriptBackup(TranscriptBackup {
            transcripts: self.transcript_cache.iter().cloned().collect(),
            timestamp: Utc::now(),
        }));
        true
    }

    async fn disconnect(&mut self) {
        self.should_reconnect = false;
        self.reconnect_at = None;
        self.pending_connect = None;

        if self.is_open() {
            self.flush_batch().await;
            if let Some(mut sink) = self.sink.take() {
                let close = WireFrame::Close {
                    code: NORMAL_CLOSURE,
                    reason: "Client disconnect".to_string(),
                };
                if let Err(e) = sink.send(close).await {
                    debug!("Close frame not delivered: {}", e);
                }
            }
        }

        self.stream = None;
        self.batch_timer = None;
        self.heartbeat_timer = None;
        self.audio_batch.clear();
        self.reconnect_attempts = 0;
    }

    async fn send_frame(&mut self, frame: WireFrame) -> bool {
        let Some(sink) = self.sink.as_mut() else {
            return false;
        };
        match sink.send(frame).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Socket send failed: {}", e);
                false
            }
        }
    }

    async fn send_json<T: Serialize>(&mut self, payload: &T) {
        if !self.is_open() {
            debug!("Socket not open, dropping message");
            return;
        }
        match serde_json::to_string(payload) {
            Ok(text) => {
                self.send_frame(WireFrame::Text(text)).await;
            }
            Err(e) => warn!("Failed to serialise outbound message: {}", e),
        }
    }

    /// Concatenate queued frames into one binary message.
    async fn flush_batch(&mut self) {
        if self.audio_batch.is_empty() || !self.is_open() {
            return;
        }

        let total: usize = self.audio_batch.iter().map(|f| f.len() * 2).sum();
        let mut payload = Vec::with_capacity(total);
        for frame in self.audio_batch.drain(..) {
            payload.extend_from_slice(&frame.to_le_bytes());
        }

        if self.send_frame(WireFrame::Binary(payload)).await {
            self.stats.total_bytes_sent += total as u64;
            self.stats.total_batches_sent += 1;
            self.stats.avg_batch_size = self.stats.total_bytes_sent / self.stats.total_batches_sent;
            debug!("Sent audio batch of {} bytes", total);
        }
    }

    async fn send_heartbeat(&mut self) {
        let ping = ClientMessage::Ping {
            ts: Utc::now().timestamp_millis(),
        };
        self.send_json(&ping).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay() {
        let config = WorkerConfig::new("ws://localhost");
        assert_eq!(config.delay_for(1), Duration::from_millis(600));
        assert_eq!(config.delay_for(3), Duration::from_millis(600));
    }

    #[test]
    fn test_exponential_delay() {
        let config = WorkerConfig {
            backoff: Backoff::Exponential,
            ..WorkerConfig::new("ws://localhost")
        };
        assert_eq!(config.delay_for(1), Duration::from_millis(600));
        assert_eq!(config.delay_for(2), Duration::from_millis(1200));
        assert_eq!(config.delay_for(3), Duration::from_millis(2400));
    }

    #[test]
    fn test_backoff_deserializes_lowercase() {
        let backoff: Backoff = serde_json::from_str("\"exponential\"").unwrap();
        assert_eq!(backoff, Backoff::Exponential);
    }
}
