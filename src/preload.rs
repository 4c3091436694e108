//! Warm-up of expensive resources ahead of user action.
//!
//! A [`ResourcePool`] holds at most one pre-built instance. `acquire` hands the
//! cached instance to exactly one caller and clears the slot; later callers get
//! a freshly built one. [`Preloader`] warms the audio thread and the network
//! worker once per process.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::capture::AudioThread;
use crate::transport::{Connector, NetworkWorker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Uninitialized,
    Warming,
    Ready,
}

enum Slot<T> {
    Uninitialized,
    Warming,
    Ready(T),
}

/// Single-slot cache for a pre-built resource.
pub struct ResourcePool<T> {
    name: &'static str,
    slot: Mutex<Slot<T>>,
}

impl<T: Send> ResourcePool<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Mutex::new(Slot::Uninitialized),
        }
    }

    pub fn state(&self) -> PoolState {
        match &*self.lock() {
            Slot::Uninitialized => PoolState::Uninitialized,
            Slot::Warming => PoolState::Warming,
            Slot::Ready(_) => PoolState::Ready,
        }
    }

    /// Build and cache an instance if the slot is empty.
    ///
    /// Returns `true` if this call filled the slot. A failed build leaves the
    /// slot uninitialised so the resource is created on demand instead.
    pub async fn warm<F, Fut, E>(&self, factory: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        {
            let mut slot = self.lock();
            if !matches!(*slot, Slot::Uninitialized) {
                return false;
            }
            *slot = Slot::Warming;
        }

        match factory().await {
            Ok(resource) => {
                let mut slot = self.lock();
                if matches!(*slot, Slot::Warming) {
                    *slot = Slot::Ready(resource);
                    debug!("{} preloaded", self.name);
                    true
                } else {
                    false
                }
            }
            Err(e) => {
                warn!("{} preload failed, will load on demand: {}", self.name, e);
                let mut slot = self.lock();
                if matches!(*slot, Slot::Warming) {
                    *slot = Slot::Uninitialized;
                }
                false
            }
        }
    }

    /// Claim the cached instance, if one is ready.
    pub fn take(&self) -> Option<T> {
        let mut slot = self.lock();
        if !matches!(*slot, Slot::Ready(_)) {
            return None;
        }
        match std::mem::replace(&mut *slot, Slot::Uninitialized) {
            Slot::Ready(resource) => Some(resource),
            _ => None,
        }
    }

    /// Claim the cached instance or build a new one.
    pub async fn acquire<F, Fut, E>(&self, factory: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(resource) = self.take() {
            debug!("Using preloaded {}", self.name);
            return Ok(resource);
        }
        factory().await
    }

    /// Drop whatever is cached.
    pub fn discard(&self) {
        *self.lock() = Slot::Uninitialized;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Delay before a non-immediate preload starts.
const IDLE_PRELOAD_DELAY: Duration = Duration::from_secs(1);

/// Warms the audio thread and the network worker in the background.
pub struct Preloader {
    audio: Arc<ResourcePool<AudioThread>>,
    network: Arc<ResourcePool<NetworkWorker>>,
    connector: Arc<dyn Connector>,
    started: AtomicBool,
    complete_tx: watch::Sender<bool>,
}

impl Preloader {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let (complete_tx, _) = watch::channel(false);
        Self {
            audio: Arc::new(ResourcePool::new("audio thread")),
            network: Arc::new(ResourcePool::new("network worker")),
            connector,
            started: AtomicBool::new(false),
            complete_tx,
        }
    }

    pub fn audio_pool(&self) -> Arc<ResourcePool<AudioThread>> {
        Arc::clone(&self.audio)
    }

    pub fn network_pool(&self) -> Arc<ResourcePool<NetworkWorker>> {
        Arc::clone(&self.network)
    }

    /// Start warming both pools. Only the first call does anything.
    pub fn preload(&self, immediate: bool) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let audio = Arc::clone(&self.audio);
        let network = Arc::clone(&self.network);
        let connector = Arc::clone(&self.connector);
        let complete_tx = self.complete_tx.clone();

        tokio::spawn(async move {
            if !immediate {
                tokio::time::sleep(IDLE_PRELOAD_DELAY).await;
            }

            tokio::join!(
                audio.warm(|| async { AudioThread::spawn() }),
                network.warm(|| async move {
                    Ok::<_, std::convert::Infallible>(NetworkWorker::spawn(connector))
                }),
            );

            info!("Audio system preload complete");
            let _ = complete_tx.send(true);
        });
    }

    pub fn is_complete(&self) -> bool {
        *self.complete_tx.borrow()
    }

    /// Resolve once preload has finished. Returns immediately if it already has.
    pub async fn wait(&self) {
        let mut rx = self.complete_tx.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_acquire_consumes_preloaded_once() {
        let pool: ResourcePool<u32> = ResourcePool::new("test");
        assert_eq!(pool.state(), PoolState::Uninitialized);

        assert!(pool.warm(|| async { Ok::<_, String>(7) }).await);
        assert_eq!(pool.state(), PoolState::Ready);

        let counter = AtomicUsize::new(0);
        let built = &counter;
        let first = pool
            .acquire(move || async move {
                built.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(1)
            })
            .await
            .unwrap();
        assert_eq!(first, 7);
        assert_eq!(pool.state(), PoolState::Uninitialized);

        let second = pool
            .acquire(move || async move {
                built.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(1)
            })
            .await
            .unwrap();
        assert_eq!(second, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_warm_twice_is_noop() {
        let pool: ResourcePool<u32> = ResourcePool::new("test");
        assert!(pool.warm(|| async { Ok::<_, String>(1) }).await);
        assert!(!pool.warm(|| async { Ok::<_, String>(2) }).await);
        assert_eq!(pool.take(), Some(1));
    }

    #[tokio::test]
    async fn test_failed_warm_leaves_pool_empty() {
        let pool: ResourcePool<u32> = ResourcePool::new("test");
        assert!(!pool.warm(|| async { Err::<u32, _>("boom") }).await);
        assert_eq!(pool.state(), PoolState::Uninitialized);
        assert_eq!(pool.take(), None);
    }

    #[tokio::test]
    async fn test_discard_clears_slot() {
        let pool: ResourcePool<u32> = ResourcePool::new("test");
        pool.warm(|| async { Ok::<_, String>(3) }).await;
        pool.discard();
        assert_eq!(pool.state(), PoolState::Uninitialized);
    }
}
