//! Admission control fleet
//!
//! The [`Throttler`] owns one [`RevisionThrottler`] per revision, routes
//! `try_run` calls by key, applies topology updates, and implements the
//! connection-refusal retry loop on top of slot acquisition.

pub mod capacity;
pub mod pod_tracker;
pub mod revision_throttler;

pub use revision_throttler::{RevisionThrottler, SlotGuard};

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::ActivatorConfig;
use crate::discovery::{EndpointsSnapshot, EventType, SksState};
use crate::error::{ActivatorError, Result};
use crate::revision::{Revision, RevisionKey};

/// Topology change routed to the fleet by the endpoint watcher.
#[derive(Debug, Clone)]
pub enum ThrottlerUpdate {
    Revision {
        event: EventType,
        revision: Revision,
    },
    Endpoints {
        key: RevisionKey,
        snapshot: EndpointsSnapshot,
    },
    ServerlessService {
        key: RevisionKey,
        sks: SksState,
    },
}

/// Map entry tagged with its lifecycle so deletion races resolve
/// through the key rather than through owning pointers.
enum Entry {
    Live(Arc<RevisionThrottler>),
    Draining(Arc<RevisionThrottler>),
}

impl Entry {
    fn throttler(&self) -> &Arc<RevisionThrottler> {
        match self {
            Entry::Live(t) | Entry::Draining(t) => t,
        }
    }
}

/// Fleet of per-revision throttlers.
pub struct Throttler {
    own_ip: String,
    pod_addressability: bool,
    max_queue_depth: usize,
    max_retries: u32,
    retry_backoff: Duration,
    draining: AtomicBool,
    revisions: RwLock<HashMap<RevisionKey, Entry>>,
}

impl Throttler {
    pub fn new(
        own_ip: impl Into<String>,
        pod_addressability: bool,
        max_queue_depth: usize,
        max_retries: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            own_ip: own_ip.into(),
            pod_addressability,
            max_queue_depth,
            max_retries,
            retry_backoff,
            draining: AtomicBool::new(false),
            revisions: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ActivatorConfig, own_ip: impl Into<String>) -> Self {
        Self::new(
            own_ip,
            config.pod_addressability(),
            config.max_queue_depth,
            config.max_proxy_retries,
            config.retry_backoff(),
        )
    }

    /// Consume topology updates until the channel closes.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<ThrottlerUpdate>) {
        while let Some(update) = rx.recv().await {
            self.apply(update);
        }
        tracing::debug!("Throttler update channel closed");
    }

    /// Apply a single topology update.
    pub fn apply(&self, update: ThrottlerUpdate) {
        match update {
            ThrottlerUpdate::Revision { event, revision } => match event {
                EventType::Add | EventType::Update => self.upsert_revision(&revision),
                EventType::Delete => self.delete_revision(&revision.key),
            },
            ThrottlerUpdate::Endpoints { key, snapshot } => {
                let map = self.revisions.read().unwrap();
                if let Some(entry) = map.get(&key) {
                    RevisionThrottler::update_endpoints(entry.throttler(), &snapshot);
                } else {
                    tracing::debug!(revision = %key, "Endpoints for unknown revision dropped");
                }
            }
            ThrottlerUpdate::ServerlessService { key, sks } => {
                let map = self.revisions.read().unwrap();
                if let Some(entry) = map.get(&key) {
                    tracing::debug!(
                        revision = %key,
                        mode = ?sks.mode,
                        num_activators = sks.num_activators,
                        "Routing state updated"
                    );
                    RevisionThrottler::update_sks(entry.throttler(), &sks);
                } else {
                    tracing::debug!(revision = %key, "SKS state for unknown revision dropped");
                }
            }
        }
        self.sweep();
    }

    fn upsert_revision(&self, revision: &Revision) {
        let mut map = self.revisions.write().unwrap();
        match map.get(&revision.key) {
            Some(Entry::Live(t)) => {
                RevisionThrottler::update_revision(t, revision);
            }
            _ => {
                // New revision, or a re-add racing a drain: fresh state.
                let t = RevisionThrottler::new(
                    revision,
                    self.own_ip.clone(),
                    self.pod_addressability,
                    self.max_queue_depth,
                );
                tracing::info!(revision = %revision.key, "Revision throttler created");
                map.insert(revision.key.clone(), Entry::Live(t));
            }
        }
    }

    fn delete_revision(&self, key: &RevisionKey) {
        let mut map = self.revisions.write().unwrap();
        if let Some(entry) = map.remove(key) {
            let t = entry.throttler().clone();
            RevisionThrottler::drain(&t);
            tracing::info!(revision = %key, "Revision throttler draining");
            if !t.is_idle() {
                map.insert(key.clone(), Entry::Draining(t));
            }
        }
    }

    /// Drop draining entries whose in-flight work has finished.
    fn sweep(&self) {
        let mut map = self.revisions.write().unwrap();
        map.retain(|key, entry| match entry {
            Entry::Live(_) => true,
            Entry::Draining(t) => {
                let keep = !t.is_idle();
                if !keep {
                    tracing::debug!(revision = %key, "Drained revision throttler removed");
                }
                keep
            }
        });
    }

    fn get_live(&self, key: &RevisionKey) -> Result<Arc<RevisionThrottler>> {
        if self.draining.load(Ordering::Relaxed) {
            return Err(ActivatorError::Draining);
        }
        let map = self.revisions.read().unwrap();
        match map.get(key) {
            Some(Entry::Live(t)) => Ok(t.clone()),
            Some(Entry::Draining(_)) => Err(ActivatorError::RevisionGone(key.to_string())),
            None => Err(ActivatorError::RevisionNotFound(key.to_string())),
        }
    }

    /// Acquire a slot without the retry loop. Used by the upgrade path,
    /// which holds the slot for the lifetime of the relayed connection.
    pub async fn acquire(&self, key: &RevisionKey) -> Result<SlotGuard> {
        let throttler = self.get_live(key)?;
        RevisionThrottler::acquire(&throttler).await
    }

    /// Admit a request against the revision's capacity and run `f` with
    /// the chosen pod address. Exactly one slot is held while `f` runs.
    /// A retryable failure releases the slot and re-enters acquisition
    /// with a fresh pod pick, up to the configured retry budget.
    pub async fn try_run<T, F, Fut>(&self, key: &RevisionKey, mut f: F) -> Result<T>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let guard = self.acquire(key).await?;
            let result = f(guard.dest().to_string()).await;
            drop(guard);
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    tracing::debug!(
                        revision = %key,
                        attempt,
                        error = %e,
                        "Retrying against a fresh pod"
                    );
                    if !self.retry_backoff.is_zero() {
                        tokio::time::sleep(self.retry_backoff).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Refuse all new admissions; called on SIGTERM. In-flight requests
    /// complete, queued waiters fail with the draining error.
    pub fn drain_all(&self) {
        self.draining.store(true, Ordering::Relaxed);
        let map = self.revisions.read().unwrap();
        for entry in map.values() {
            RevisionThrottler::drain(entry.throttler());
        }
    }

    /// Number of tracked revisions (draining included)
    pub fn revision_count(&self) -> usize {
        self.revisions.read().unwrap().len()
    }

    /// Local capacity of a revision, for introspection and tests
    pub fn capacity_of(&self, key: &RevisionKey) -> Option<u32> {
        let map = self.revisions.read().unwrap();
        map.get(key).map(|e| e.throttler().capacity())
    }

    /// Slots currently held against a revision
    pub fn in_flight_of(&self, key: &RevisionKey) -> Option<u32> {
        let map = self.revisions.read().unwrap();
        map.get(key).map(|e| e.throttler().in_flight())
    }
}
