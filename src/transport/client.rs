use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::messages::{
    decode_audio, DecodedAudio, NetworkStats, SessionMessage, StatusState, StatusUpdate,
    TranscriptBackup, TranscriptMessage,
};
use super::socket::Connector;
use super::worker::{Backoff, NetworkWorker, WorkerCommand, WorkerConfig, WorkerEvent};
use crate::audio::AudioFrame;
use crate::error::TransportError;
use crate::preload::ResourcePool;

/// Settings for a [`LiveTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransportOptions {
    pub url: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub backoff: Backoff,
    pub heartbeat_interval: Duration,
    pub batch_interval: Duration,
    /// Deadline for a `connected` status after `connect()`
    pub connect_timeout: Duration,
    /// Time the worker gets to flush and close after `close()`
    pub close_grace: Duration,
}

impl TransportOptions {
    pub fn new(url: impl Into<String>) -> Self {
        let worker = WorkerConfig::new(url);
        Self {
            url: worker.url,
            max_reconnect_attempts: worker.max_reconnect_attempts,
            reconnect_delay: worker.reconnect_delay,
            backoff: worker.backoff,
            heartbeat_interval: worker.heartbeat_interval,
            batch_interval: worker.batch_interval,
            connect_timeout: Duration::from_secs(10),
            close_grace: Duration::from_millis(100),
        }
    }

    fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            url: self.url.clone(),
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_delay: self.reconnect_delay,
            backoff: self.backoff,
            heartbeat_interval: self.heartbeat_interval,
            batch_interval: self.batch_interval,
        }
    }
}

/// Extra fields of the `start` message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOptions {
    pub resume: bool,
    pub live_model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    /// Terminal; set by `close()`
    Closed,
}

/// Everything the transport reports to its owner, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Status(StatusUpdate),
    Transcript(TranscriptMessage),
    Session(SessionMessage),
    Audio(DecodedAudio),
    Error(String),
    TranscriptBackup(TranscriptBackup),
}

#[derive(Debug, Clone)]
struct Phase {
    state: LinkState,
    /// Bumped by every connect attempt this client launches
    attempt: u64,
    failure: Option<(u64, TransportError)>,
    deadline: Option<Instant>,
}

struct Shared {
    phase: watch::Sender<Phase>,
    stats: watch::Sender<Option<NetworkStats>>,
}

struct WorkerLink {
    commands: mpsc::UnboundedSender<WorkerCommand>,
    task: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

enum ConnectPlan {
    Ready,
    Rejected(TransportError),
    Launch { attempt: u64, deadline: Instant },
    Join { attempt: u64, deadline: Instant },
}

/// Client side of the live interview socket.
///
/// Socket I/O runs in a [`NetworkWorker`] task; this type only sends it
/// commands and turns its events into [`TransportEvent`]s plus the link state.
pub struct LiveTransport {
    options: TransportOptions,
    connector: Arc<dyn Connector>,
    pool: Option<Arc<ResourcePool<NetworkWorker>>>,
    worker: Mutex<Option<WorkerLink>>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl LiveTransport {
    pub fn new(
        options: TransportOptions,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (phase, _) = watch::channel(Phase {
            state: LinkState::Idle,
            attempt: 0,
            failure: None,
            deadline: None,
        });

        let transport = Self {
            options,
            connector,
            pool: None,
            worker: Mutex::new(None),
            shared: Arc::new(Shared {
                phase,
                stats: watch::channel(None).0,
            }),
            events: events_tx,
        };
        (transport, events_rx)
    }

    /// Take the worker from `pool` if one was preloaded.
    pub fn with_pool(mut self, pool: Arc<ResourcePool<NetworkWorker>>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn state(&self) -> LinkState {
        self.shared.phase.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Open the connection and wait for the `connected` status.
    ///
    /// Resolves immediately when already connected. Concurrent calls share one
    /// attempt and one deadline.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let timeout = self.options.connect_timeout;
        let mut plan = ConnectPlan::Ready;

        self.shared.phase.send_if_modified(|phase| match phase.state {
            LinkState::Connected => false,
            LinkState::Closed => {
                plan = ConnectPlan::Rejected(TransportError::Closed);
                false
            }
            LinkState::Connecting | LinkState::Reconnecting => {
                if phase.state == LinkState::Reconnecting {
                    // The worker is already retrying; earlier failures belong to
                    // attempts this caller never saw.
                    phase.attempt += 1;
                    phase.failure = None;
                }
                let now = Instant::now();
                let deadline = match phase.deadline {
                    Some(deadline) if deadline > now => deadline,
                    _ => now + timeout,
                };
                phase.deadline = Some(deadline);
                plan = ConnectPlan::Join {
                    attempt: phase.attempt,
                    deadline,
                };
                false
            }
            LinkState::Idle | LinkState::Disconnected => {
                phase.state = LinkState::Connecting;
                phase.attempt += 1;
                phase.failure = None;
                let deadline = Instant::now() + timeout;
                phase.deadline = Some(deadline);
                plan = ConnectPlan::Launch {
                    attempt: phase.attempt,
                    deadline,
                };
                true
            }
        });

        let (attempt, deadline) = match plan {
            ConnectPlan::Ready => return Ok(()),
            ConnectPlan::Rejected(e) => return Err(e),
            ConnectPlan::Join { attempt, deadline } => {
                debug!("Joining in-flight connect");
                (attempt, deadline)
            }
            ConnectPlan::Launch { attempt, deadline } => {
                info!("Connecting to {}", self.options.url);
                if let Err(e) = self.launch().await {
                    self.fail_attempt(attempt, e.clone());
                    return Err(e);
                }
                (attempt, deadline)
            }
        };

        let mut phase_rx = self.shared.phase.subscribe();
        let outcome = tokio::time::timeout_at(deadline, async {
            loop {
                if let Some(result) = connect_outcome(&phase_rx.borrow_and_update(), attempt) {
                    return result;
                }
                if phase_rx.changed().await.is_err() {
                    return Err(TransportError::WorkerUnavailable);
                }
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                let error = TransportError::ConnectionTimeout(timeout.as_millis() as u64);
                warn!("{}", error);
                self.fail_attempt(attempt, error.clone());
                Err(error)
            }
        }
    }

    async fn launch(&self) -> Result<(), TransportError> {
        let has_worker = self.lock_worker().is_some();
        if !has_worker {
            let worker = match &self.pool {
                Some(pool) => {
                    let connector = Arc::clone(&self.connector);
                    pool.acquire(|| async move {
                        Ok::<_, TransportError>(NetworkWorker::spawn(connector))
                    })
                    .await?
                }
                None => NetworkWorker::spawn(Arc::clone(&self.connector)),
            };
            self.install(worker);
        }

        let worker = self.lock_worker();
        let link = worker.as_ref().ok_or(TransportError::WorkerUnavailable)?;
        link.commands
            .send(WorkerCommand::Connect(self.options.worker_config()))
            .map_err(|_| TransportError::WorkerUnavailable)
    }

    fn install(&self, worker: NetworkWorker) {
        let mut slot = self.lock_worker();
        if slot.is_some() {
            return;
        }

        let (commands, worker_events, task) = worker.into_parts();
        let dispatcher = tokio::spawn(dispatch(
            worker_events,
            Arc::clone(&self.shared),
            self.events.clone(),
        ));
        *slot = Some(WorkerLink {
            commands,
            task,
            dispatcher,
        });
    }

    /// Record a failed attempt unless the link has moved on since.
    fn fail_attempt(&self, attempt: u64, error: TransportError) {
        self.shared.phase.send_if_modified(|phase| {
            if phase.attempt != attempt || phase.state != LinkState::Connecting {
                return false;
            }
            phase.state = LinkState::Disconnected;
            phase.deadline = None;
            phase.failure = Some((attempt, error));
            true
        });
    }

    fn command(&self, command: WorkerCommand) -> bool {
        match self.lock_worker().as_ref() {
            Some(link) => link.commands.send(command).is_ok(),
            None => false,
        }
    }

    /// Ask the server to begin the interview.
    pub fn start(&self, interview_id: &str, user_id: &str, options: StartOptions) {
        let sent = self.command(WorkerCommand::Start {
            interview_id: interview_id.to_string(),
            user_id: user_id.to_string(),
            resume: options.resume.then_some(true),
            live_model: options.live_model,
        });
        if !sent {
            warn!("start() called without a network worker");
        }
    }

    pub fn stop(&self) {
        self.command(WorkerCommand::Stop);
    }

    /// Queue a frame for the next batch. Dropped unless connected.
    pub fn send_audio(&self, frame: AudioFrame) {
        if frame.is_empty() || !self.is_connected() {
            return;
        }
        self.command(WorkerCommand::Audio(frame));
    }

    /// Send an arbitrary JSON payload.
    pub fn send<T: Serialize>(&self, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => {
                self.command(WorkerCommand::Send(value));
            }
            Err(e) => warn!("Failed to serialise payload: {}", e),
        }
    }

    /// Fire-and-forget interruption of coach speech.
    pub fn barge_in(&self) {
        self.command(WorkerCommand::BargeIn);
    }

    /// Request a stats snapshot; it arrives asynchronously in [`Self::last_stats`].
    pub fn get_stats(&self) {
        self.command(WorkerCommand::GetStats);
    }

    pub fn last_stats(&self) -> Option<NetworkStats> {
        *self.shared.stats.borrow()
    }

    /// Ask the worker for a fresh snapshot and wait up to `wait` for it.
    ///
    /// Falls back to the last known snapshot when there is no worker or the
    /// reply does not arrive in time.
    pub async fn request_stats(&self, wait: Duration) -> Option<NetworkStats> {
        let mut updates = self.shared.stats.subscribe();
        if !self.command(WorkerCommand::GetStats) {
            return self.last_stats();
        }
        if tokio::time::timeout(wait, updates.changed()).await.is_err() {
            debug!("No stats reply within {:?}", wait);
        }
        self.last_stats()
    }

    /// Close the connection for good.
    ///
    /// The worker gets `close_grace` to flush queued audio and send the close
    /// frame before it is torn down. Safe to call repeatedly.
    pub fn close(&self) {
        self.shared.phase.send_if_modified(|phase| {
            if phase.state == LinkState::Closed {
                return false;
            }
            phase.state = LinkState::Closed;
            phase.deadline = None;
            true
        });

        let Some(link) = self.lock_worker().take() else {
            return;
        };
        info!("Closing transport");

        let _ = link.commands.send(WorkerCommand::Disconnect);
        let grace = self.options.close_grace;
        let WorkerLink {
            commands,
            task,
            dispatcher,
        } = link;

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            drop(commands);
            task.abort();
            dispatcher.abort();
        });
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<WorkerLink>> {
        self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for LiveTransport {
    fn drop(&mut self) {
        if let Some(link) = self.lock_worker().take() {
            link.task.abort();
            link.dispatcher.abort();
        }
    }
}

/// `None` while the attempt is still undecided.
fn connect_outcome(phase: &Phase, attempt: u64) -> Option<Result<(), TransportError>> {
    if let Some((failed, error)) = &phase.failure {
        if *failed == attempt {
            return Some(Err(error.clone()));
        }
    }
    match phase.state {
        LinkState::Connected => Some(Ok(())),
        LinkState::Closed => Some(Err(TransportError::Closed)),
        LinkState::Disconnected | LinkState::Idle => Some(Err(TransportError::ConnectionFailed(
            "connection lost".to_string(),
        ))),
        LinkState::Connecting | LinkState::Reconnecting => None,
    }
}

/// Move worker events onto the transport's event channel, updating the link
/// state on the way.
async fn dispatch(
    mut worker_events: mpsc::UnboundedReceiver<WorkerEvent>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(event) = worker_events.recv().await {
        if shared.phase.borrow().state == LinkState::Closed {
            continue;
        }

        let forward = match event {
            WorkerEvent::Status(status) => {
                apply_status(&shared, status.state);
                Some(TransportEvent::Status(status))
            }
            WorkerEvent::Error(message) => {
                shared.phase.send_if_modified(|phase| {
                    if phase.state != LinkState::Connecting {
                        return false;
                    }
                    phase.state = LinkState::Disconnected;
                    phase.deadline = None;
                    phase.failure = Some((
                        phase.attempt,
                        TransportError::ConnectionFailed(message.clone()),
                    ));
                    true
                });
                Some(TransportEvent::Error(message))
            }
            WorkerEvent::Transcript(transcript) => Some(TransportEvent::Transcript(transcript)),
            WorkerEvent::Session(session) => Some(TransportEvent::Session(session)),
            WorkerEvent::Audio(inbound) => match decode_audio(inbound) {
                Ok(decoded) => Some(TransportEvent::Audio(decoded)),
                Err(e) => {
                    warn!("Dropping inbound audio: {}", e);
                    Some(TransportEvent::Error(e.to_string()))
                }
            },
            WorkerEvent::TranscriptBackup(backup) => {
                info!("Transcript backup with {} entries", backup.transcripts.len());
                Some(TransportEvent::TranscriptBackup(backup))
            }
            WorkerEvent::Stats(stats) => {
                debug!(
                    "Network stats: {} bytes in {} batches (avg {})",
                    stats.total_bytes_sent, stats.total_batches_sent, stats.avg_batch_size
                );
                shared.stats.send_replace(Some(stats));
                None
            }
            WorkerEvent::Unrecognized(detail) => {
                warn!("Ignoring server message: {}", detail);
                None
            }
        };

        if let Some(event) = forward {
            let _ = events.send(event);
        }
    }
}

fn apply_status(shared: &Shared, status: StatusState) {
    let next = match status {
        StatusState::Connected | StatusState::Reconnected => LinkState::Connected,
        StatusState::Reconnecting => LinkState::Reconnecting,
        StatusState::Disconnected => LinkState::Disconnected,
        _ => return,
    };

    shared.phase.send_if_modified(|phase| {
        if phase.state == LinkState::Closed || phase.state == next {
            return false;
        }
        phase.state = next;
        if next != LinkState::Reconnecting {
            phase.deadline = None;
        }
        true
    });
}
