use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::record::{PendingWrite, SessionRecord, TranscriptEntry};
use super::store::SessionStore;
use crate::error::PersistenceError;

/// Limits and timers for [`SessionPersistence`].
#[derive(Debug, Clone, PartialEq)]
pub struct PersistenceOptions {
    pub auto_save_interval: Duration,
    pub max_stored_sessions: usize,
    /// Incomplete records older than this are not offered for recovery
    pub recovery_window: Duration,
    /// Records above this encoded size keep only the newest transcript lines
    pub max_record_bytes: usize,
    pub trimmed_transcript_len: usize,
}

impl Default for PersistenceOptions {
    fn default() -> Self {
        Self {
            auto_save_interval: Duration::from_secs(5),
            max_stored_sessions: 5,
            recovery_window: Duration::from_secs(24 * 60 * 60),
            max_record_bytes: 5 * 1024 * 1024,
            trimmed_transcript_len: 50,
        }
    }
}

#[derive(Default)]
struct Active {
    id: Option<String>,
    pending: Vec<PendingWrite>,
    /// Last record written for the active session
    snapshot: Option<SessionRecord>,
}

struct Core {
    store: Arc<dyn SessionStore>,
    options: PersistenceOptions,
    active: Mutex<Active>,
    /// Serialises read-modify-write cycles against the store
    flush_lock: tokio::sync::Mutex<()>,
}

/// Crash-recovery snapshots of the active session.
///
/// Updates are queued and applied in batches: on the auto-save timer, on
/// [`flush`](Self::flush) and when the session ends. At most one session is
/// active at a time.
pub struct SessionPersistence {
    core: Arc<Core>,
    auto_save: Mutex<Option<JoinHandle<()>>>,
}

impl SessionPersistence {
    pub fn new(store: Arc<dyn SessionStore>, options: PersistenceOptions) -> Self {
        Self {
            core: Arc::new(Core {
                store,
                options,
                active: Mutex::new(Active::default()),
                flush_lock: tokio::sync::Mutex::new(()),
            }),
            auto_save: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &PersistenceOptions {
        &self.core.options
    }

    pub fn current_session_id(&self) -> Option<String> {
        self.core.active().id.clone()
    }

    /// Create and save a record, then start the auto-save timer.
    pub async fn start_session(
        &self,
        id: &str,
        initial: Map<String, Value>,
    ) -> Result<SessionRecord, PersistenceError> {
        let record = SessionRecord::new(id, initial);
        {
            let mut active = self.core.active();
            if let Some(previous) = active.id.replace(id.to_string()) {
                warn!("Session {} replaced by {} before it ended", previous, id);
            }
            active.pending.clear();
            active.snapshot = None;
        }

        let saved = {
            let _guard = self.core.flush_lock.lock().await;
            self.core.save(record).await?
        };

        self.start_auto_save();
        info!("Persisting session {}", id);
        Ok(saved)
    }

    /// Queue a shallow merge of `fields` into the active record.
    pub fn update_session(&self, fields: Map<String, Value>) {
        self.core.queue(PendingWrite::Merge {
            fields,
            at: Utc::now(),
        });
    }

    pub fn add_transcript(&self, entry: TranscriptEntry) {
        self.core.queue(PendingWrite::Transcript {
            entry,
            at: Utc::now(),
        });
    }

    pub fn pending_writes(&self) -> usize {
        self.core.active().pending.len()
    }

    /// Apply queued updates to the stored record now.
    pub async fn flush(&self) -> Result<(), PersistenceError> {
        self.core.flush().await
    }

    /// Flush, mark the record completed and merge `final_data`.
    ///
    /// Returns the final record, or `None` without an active session.
    pub async fn end_session(
        &self,
        final_data: Map<String, Value>,
    ) -> Result<Option<SessionRecord>, PersistenceError> {
        self.stop_auto_save();

        let Some(id) = self.current_session_id() else {
            return Ok(None);
        };

        self.core.flush().await?;

        let _guard = self.core.flush_lock.lock().await;
        let stored = match self.core.store.get(&id).await? {
            Some(record) => Some(record),
            None => self.core.active().snapshot.clone(),
        };

        let result = match stored {
            Some(mut record) => {
                record.ended_at = Some(Utc::now());
                record.completed = true;
                if let Err(e) = record.merge(final_data) {
                    warn!("Ignoring final session data: {}", e);
                }
                Some(self.core.save(record).await?)
            }
            None => None,
        };

        let mut active = self.core.active();
        active.id = None;
        active.pending.clear();
        active.snapshot = None;
        info!("Session {} ended", id);

        Ok(result)
    }

    /// Best-effort synchronous save for an unplanned shutdown.
    ///
    /// Applies queued updates to the last snapshot and marks the record
    /// `closed_unexpectedly`. Never fails; errors are logged.
    pub fn save_on_unload(&self) {
        let (mut record, pending) = {
            let mut active = self.core.active();
            let Some(id) = active.id.clone() else {
                return;
            };
            if active.pending.is_empty() {
                return;
            }
            let record = active
                .snapshot
                .clone()
                .unwrap_or_else(|| SessionRecord::new(id, Map::new()));
            (record, std::mem::take(&mut active.pending))
        };

        for write in pending {
            if let Err(e) = write.apply(&mut record) {
                warn!("Dropping pending session update: {}", e);
            }
        }
        record.timestamp = Utc::now();
        record.closed_unexpectedly = true;

        match self.core.store.put_blocking(&record) {
            Ok(()) => info!("Saved session {} on shutdown", record.id),
            Err(e) => warn!("Failed to save session {} on shutdown: {}", record.id, e),
        }
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, PersistenceError> {
        self.core.store.get(id).await
    }

    /// Newest record if it is incomplete and inside the recovery window.
    pub async fn get_recoverable_session(&self) -> Result<Option<SessionRecord>, PersistenceError> {
        let records = self.core.store.list().await?;
        let Some(newest) = records.into_iter().max_by_key(|r| r.timestamp) else {
            return Ok(None);
        };

        let age = (Utc::now() - newest.timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if newest.completed || age >= self.core.options.recovery_window {
            return Ok(None);
        }
        Ok(Some(newest))
    }

    pub async fn delete_session(&self, id: &str) -> Result<bool, PersistenceError> {
        self.core.store.delete(id).await
    }

    /// Evict all but the newest `max_stored_sessions` records.
    pub async fn cleanup_old_sessions(&self) -> Result<usize, PersistenceError> {
        self.core.cleanup().await
    }

    fn start_auto_save(&self) {
        let mut slot = self.auto_save.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            return;
        }

        let core = Arc::clone(&self.core);
        let period = core.options.auto_save_interval;
        *slot = Some(tokio::spawn(async move {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                if let Err(e) = core.flush().await {
                    warn!("Auto-save failed: {}", e);
                }
            }
        }));
    }

    fn stop_auto_save(&self) {
        let handle = self.auto_save.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for SessionPersistence {
    fn drop(&mut self) {
        self.stop_auto_save();
    }
}

impl Core {
    fn active(&self) -> MutexGuard<'_, Active> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn queue(&self, write: PendingWrite) {
        let mut active = self.active();
        if active.id.is_none() {
            debug!("No active session, dropping update");
            return;
        }
        active.pending.push(write);
    }

    async fn flush(&self) -> Result<(), PersistenceError> {
        let _guard = self.flush_lock.lock().await;

        let (id, pending) = {
            let mut active = self.active();
            let Some(id) = active.id.clone() else {
                return Ok(());
            };
            if active.pending.is_empty() {
                return Ok(());
            }
            (id, std::mem::take(&mut active.pending))
        };

        let mut record = match self.store.get(&id).await {
            Ok(Some(record)) => record,
            Ok(None) => SessionRecord::new(id.as_str(), Map::new()),
            Err(e) => {
                self.requeue(&id, pending);
                return Err(e);
            }
        };

        for write in pending.iter().cloned() {
            if let Err(e) = write.apply(&mut record) {
                warn!("Dropping pending session update: {}", e);
            }
        }

        if let Err(e) = self.save(record).await {
            self.requeue(&id, pending);
            return Err(e);
        }
        debug!("Flushed {} session update(s) for {}", pending.len(), id);
        Ok(())
    }

    /// Put the writes of a failed flush back ahead of anything queued since.
    fn requeue(&self, id: &str, mut writes: Vec<PendingWrite>) {
        let mut active = self.active();
        if active.id.as_deref() != Some(id) {
            warn!("Session {} ended, dropping {} unsaved update(s)", id, writes.len());
            return;
        }
        writes.append(&mut active.pending);
        active.pending = writes;
    }

    /// Write `record`, trimming oversize transcripts, then evict old records.
    async fn save(&self, mut record: SessionRecord) -> Result<SessionRecord, PersistenceError> {
        let size = record.encoded_len()?;
        let keep = self.options.trimmed_transcript_len;
        if size > self.options.max_record_bytes && record.transcript.len() > keep {
            let excess = record.transcript.len() - keep;
            record.transcript.drain(..excess);
            warn!(
                "Session {} is {} bytes, trimmed transcript to last {} entries",
                record.id, size, keep
            );
        }

        self.store.put(&record).await?;

        {
            let mut active = self.active();
            if active.id.as_deref() == Some(record.id.as_str()) {
                active.snapshot = Some(record.clone());
            }
        }

        if let Err(e) = self.cleanup().await {
            warn!("Session cleanup failed: {}", e);
        }
        Ok(record)
    }

    async fn cleanup(&self) -> Result<usize, PersistenceError> {
        let mut records = self.store.list().await?;
        if records.len() <= self.options.max_stored_sessions {
            return Ok(0);
        }

        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let mut evicted = 0;
        for record in records.into_iter().skip(self.options.max_stored_sessions) {
            if self.store.delete(&record.id).await? {
                debug!("Evicted session record {}", record.id);
                evicted += 1;
            }
        }
        Ok(evicted)
    }
}
