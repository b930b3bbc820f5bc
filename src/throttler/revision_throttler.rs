//! Per-revision admission control
//!
//! One throttler per revision owns the local capacity slice, the FIFO
//! waiter queue, and the pod ring. Everything is guarded by a single
//! mutex; waiters park on oneshot channels and are handed slots in
//! enqueue order as capacity frees up.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use super::capacity::{assigned_share, local_capacity};
use super::pod_tracker::{PodList, UNBOUNDED_WEIGHT};
use crate::discovery::{EndpointsSnapshot, SksState};
use crate::error::{ActivatorError, Result};
use crate::revision::{Revision, RevisionKey};

/// An admission token. Holding it counts against the revision's local
/// capacity and the selected pod's weight; dropping it releases both
/// and hands the freed slot to the next queued waiter.
#[derive(Debug)]
pub struct SlotGuard {
    throttler: Arc<RevisionThrottler>,
    dest: Option<String>,
}

impl SlotGuard {
    /// Address chosen atomically with the slot acquisition
    pub fn dest(&self) -> &str {
        self.dest.as_deref().unwrap_or_default()
    }

    /// Take the destination without releasing. Used by the dispatcher
    /// when a waiter vanished and the slot must be returned under the
    /// lock already held.
    fn disarm(mut self) -> Option<String> {
        self.dest.take()
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(dest) = self.dest.take() {
            let throttler = self.throttler.clone();
            RevisionThrottler::release(&throttler, &dest);
        }
    }
}

#[derive(Debug)]
struct Waiter {
    tx: oneshot::Sender<Result<SlotGuard>>,
}

#[derive(Debug)]
struct Inner {
    container_concurrency: u32,
    /// Local capacity slice. `u32::MAX` stands in for unbounded.
    capacity: u32,
    in_flight: u32,
    pods: PodList,
    pod_count: usize,
    queue: VecDeque<Waiter>,
    draining: bool,
    activator_ips: BTreeSet<String>,
    num_activators: u32,
    private_service: String,
}

/// Admission control for a single revision.
#[derive(Debug)]
pub struct RevisionThrottler {
    key: RevisionKey,
    own_ip: String,
    pod_addressability: bool,
    max_queue_depth: usize,
    inner: Mutex<Inner>,
}

impl RevisionThrottler {
    pub fn new(
        revision: &Revision,
        own_ip: impl Into<String>,
        pod_addressability: bool,
        max_queue_depth: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            key: revision.key.clone(),
            own_ip: own_ip.into(),
            pod_addressability,
            max_queue_depth,
            inner: Mutex::new(Inner {
                container_concurrency: revision.container_concurrency,
                capacity: 0,
                in_flight: 0,
                pods: PodList::default(),
                pod_count: 0,
                queue: VecDeque::new(),
                draining: false,
                activator_ips: BTreeSet::new(),
                num_activators: 0,
                private_service: String::new(),
            }),
        })
    }

    pub fn key(&self) -> &RevisionKey {
        &self.key
    }

    /// Acquire a slot, parking FIFO behind earlier waiters when the
    /// revision is at capacity. Cancellation-safe: dropping the future
    /// while parked never consumes a slot.
    pub async fn acquire(this: &Arc<Self>) -> Result<SlotGuard> {
        let rx = {
            let mut inner = this.inner.lock().unwrap();
            if inner.draining {
                return Err(ActivatorError::RevisionGone(this.key.to_string()));
            }
            if inner.queue.is_empty() {
                if let Some(guard) = Self::try_acquire_locked(this, &mut inner) {
                    return Ok(guard);
                }
            }
            if inner.queue.len() >= this.max_queue_depth {
                return Err(ActivatorError::Overload(this.key.to_string()));
            }
            let (tx, rx) = oneshot::channel();
            inner.queue.push_back(Waiter { tx });
            // Skips over waiters that were cancelled while parked, so a
            // stale queue cannot strand us with capacity available.
            Self::dispatch_locked(this, &mut inner);
            rx
        };

        match rx.await {
            Ok(result) => result,
            // Sender dropped without dispatch: the throttler went away.
            Err(_) => Err(ActivatorError::RevisionGone(this.key.to_string())),
        }
    }

    fn try_acquire_locked(this: &Arc<Self>, inner: &mut Inner) -> Option<SlotGuard> {
        if inner.capacity == 0 || inner.in_flight >= inner.capacity {
            return None;
        }
        let dest = if this.pod_addressability {
            inner.pods.acquire_next()?
        } else {
            if inner.private_service.is_empty() {
                return None;
            }
            inner.private_service.clone()
        };
        inner.in_flight += 1;
        Some(SlotGuard {
            throttler: this.clone(),
            dest: Some(dest),
        })
    }

    pub(super) fn release(this: &Arc<Self>, dest: &str) {
        let mut inner = this.inner.lock().unwrap();
        Self::release_locked(this, &mut inner, dest);
        Self::dispatch_locked(this, &mut inner);
    }

    fn release_locked(this: &Arc<Self>, inner: &mut Inner, dest: &str) {
        if this.pod_addressability {
            inner.pods.release(dest);
        }
        inner.in_flight = inner.in_flight.saturating_sub(1);
    }

    /// Hand freed capacity to queued waiters in FIFO order. Waiters that
    /// were cancelled while parked are skipped and their slot returned.
    fn dispatch_locked(this: &Arc<Self>, inner: &mut Inner) {
        while !inner.queue.is_empty() {
            let Some(guard) = Self::try_acquire_locked(this, inner) else {
                break;
            };
            let waiter = inner.queue.pop_front().unwrap();
            if let Err(unclaimed) = waiter.tx.send(Ok(guard)) {
                if let Ok(guard) = unclaimed {
                    if let Some(dest) = guard.disarm() {
                        Self::release_locked(this, inner, &dest);
                    }
                }
            }
        }
    }

    /// Apply a revision spec change.
    pub fn update_revision(this: &Arc<Self>, revision: &Revision) {
        let mut inner = this.inner.lock().unwrap();
        if inner.container_concurrency != revision.container_concurrency {
            inner.container_concurrency = revision.container_concurrency;
            let weight = Self::weight_for(revision.container_concurrency);
            inner.pods.set_weight(weight);
        }
        Self::recompute_locked(this, &mut inner);
    }

    /// Apply a fresh endpoints snapshot (pods and activator set).
    pub fn update_endpoints(this: &Arc<Self>, snapshot: &EndpointsSnapshot) {
        let mut inner = this.inner.lock().unwrap();
        inner.activator_ips = snapshot.activator_ips.clone();
        inner.pod_count = snapshot.ready_pod_ips.len();
        if this.pod_addressability {
            let weight = Self::weight_for(inner.container_concurrency);
            inner.pods.update(&snapshot.ready_pod_ips, weight);
        }
        Self::recompute_locked(this, &mut inner);
    }

    /// Apply a serverless-service change (assigned activator count and
    /// the private service used when pods are not directly dialable).
    pub fn update_sks(this: &Arc<Self>, sks: &SksState) {
        let mut inner = this.inner.lock().unwrap();
        inner.num_activators = sks.num_activators;
        inner.private_service = sks.private_service.clone();
        Self::recompute_locked(this, &mut inner);
    }

    fn weight_for(container_concurrency: u32) -> u32 {
        if container_concurrency == 0 {
            UNBOUNDED_WEIGHT
        } else {
            container_concurrency
        }
    }

    fn recompute_locked(this: &Arc<Self>, inner: &mut Inner) {
        let share = assigned_share(&this.own_ip, &inner.activator_ips, inner.num_activators);
        let new = match share {
            None => 0,
            Some(share) => {
                if inner.container_concurrency == 0 {
                    if inner.pod_count > 0 {
                        u32::MAX
                    } else {
                        0
                    }
                } else {
                    local_capacity(
                        inner.container_concurrency,
                        inner.pod_count,
                        share.participants,
                    )
                }
            }
        };
        if new != inner.capacity {
            tracing::debug!(
                revision = %this.key,
                old = inner.capacity,
                new,
                pods = inner.pod_count,
                "Local capacity changed"
            );
            inner.capacity = new;
        }
        // A growth edge wakes waiters; a shrink is absorbed by releases.
        Self::dispatch_locked(this, inner);
    }

    /// Stop admitting. Queued waiters fail immediately; in-flight
    /// requests complete and release as usual.
    pub fn drain(this: &Arc<Self>) {
        let mut inner = this.inner.lock().unwrap();
        inner.draining = true;
        while let Some(waiter) = inner.queue.pop_front() {
            let _ = waiter
                .tx
                .send(Err(ActivatorError::RevisionGone(this.key.to_string())));
        }
    }

    /// Whether nothing is in flight or queued.
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.in_flight == 0 && inner.queue.is_empty()
    }

    pub fn capacity(&self) -> u32 {
        self.inner.lock().unwrap().capacity
    }

    pub fn in_flight(&self) -> u32 {
        self.inner.lock().unwrap().in_flight
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::Protocol;
    use std::time::Duration;

    fn revision(cc: u32) -> Revision {
        Revision {
            key: RevisionKey::new("default", "hello-00001"),
            container_concurrency: cc,
            timeout: Duration::from_secs(300),
            response_start_timeout: Duration::ZERO,
            idle_timeout: Duration::ZERO,
            protocol: Protocol::Http1,
            tls_port_enabled: false,
        }
    }

    fn snapshot(pods: &[&str], activators: &[&str], version: u64) -> EndpointsSnapshot {
        EndpointsSnapshot {
            ready_pod_ips: pods.iter().map(|s| s.to_string()).collect(),
            activator_ips: activators.iter().map(|s| s.to_string()).collect(),
            resource_version: version,
        }
    }

    fn backed(cc: u32, pods: &[&str]) -> Arc<RevisionThrottler> {
        let rt = RevisionThrottler::new(&revision(cc), "10.1.0.1", true, 100);
        RevisionThrottler::update_endpoints(&rt, &snapshot(pods, &["10.1.0.1"], 1));
        rt
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let rt = backed(2, &["10.0.0.1:8012"]);
        assert_eq!(rt.capacity(), 2);

        let g1 = RevisionThrottler::acquire(&rt).await.unwrap();
        assert_eq!(g1.dest(), "10.0.0.1:8012");
        assert_eq!(rt.in_flight(), 1);

        drop(g1);
        assert_eq!(rt.in_flight(), 0);
        assert!(rt.is_idle());
    }

    #[tokio::test]
    async fn test_waiters_park_until_release() {
        let rt = backed(1, &["10.0.0.1:8012"]);
        let g1 = RevisionThrottler::acquire(&rt).await.unwrap();

        let rt2 = rt.clone();
        let waiter = tokio::spawn(async move { RevisionThrottler::acquire(&rt2).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rt.queue_depth(), 1);

        drop(g1);
        let g2 = waiter.await.unwrap().unwrap();
        assert_eq!(g2.dest(), "10.0.0.1:8012");
        assert_eq!(rt.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let rt = backed(1, &["10.0.0.1:8012"]);
        let g = RevisionThrottler::acquire(&rt).await.unwrap();

        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
        for i in 0..3 {
            let rt = rt.clone();
            let done = done_tx.clone();
            tokio::spawn(async move {
                let guard = RevisionThrottler::acquire(&rt).await.unwrap();
                done.send(i).unwrap();
                drop(guard);
            });
            // Serialize spawns so enqueue order is deterministic.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        drop(g);
        assert_eq!(done_rx.recv().await, Some(0));
        assert_eq!(done_rx.recv().await, Some(1));
        assert_eq!(done_rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_cold_start_waiters_proceed_when_pod_appears() {
        // No endpoints yet: capacity 0, everything parks.
        let rt = RevisionThrottler::new(&revision(10), "10.1.0.1", true, 100);
        assert_eq!(rt.capacity(), 0);

        let mut handles = Vec::new();
        for _ in 0..5 {
            let rt = rt.clone();
            handles.push(tokio::spawn(
                async move { RevisionThrottler::acquire(&rt).await },
            ));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rt.queue_depth(), 5);

        RevisionThrottler::update_endpoints(&rt, &snapshot(&["10.0.0.1:8012"], &["10.1.0.1"], 1));
        assert_eq!(rt.capacity(), 10);

        let mut guards = Vec::new();
        for h in handles {
            guards.push(h.await.unwrap().unwrap());
        }
        assert_eq!(rt.in_flight(), 5);
        drop(guards);
        assert!(rt.is_idle());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_consumes_no_slot() {
        let rt = backed(1, &["10.0.0.1:8012"]);
        let g = RevisionThrottler::acquire(&rt).await.unwrap();

        let rt2 = rt.clone();
        let cancelled = tokio::spawn(async move { RevisionThrottler::acquire(&rt2).await });
        let rt3 = rt.clone();
        let survivor = tokio::spawn(async move { RevisionThrottler::acquire(&rt3).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancelled.abort();
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(g);
        // The cancelled head-of-line waiter is skipped; the survivor runs.
        let g2 = survivor.await.unwrap().unwrap();
        assert_eq!(rt.in_flight(), 1);
        drop(g2);
        assert_eq!(rt.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_queue_overflow() {
        let rt = RevisionThrottler::new(&revision(1), "10.1.0.1", true, 2);
        RevisionThrottler::update_endpoints(&rt, &snapshot(&["10.0.0.1:8012"], &["10.1.0.1"], 1));
        let _g = RevisionThrottler::acquire(&rt).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let rt = rt.clone();
            handles.push(tokio::spawn(
                async move { RevisionThrottler::acquire(&rt).await },
            ));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = RevisionThrottler::acquire(&rt).await.unwrap_err();
        assert!(matches!(err, ActivatorError::Overload(_)));
        for h in handles {
            h.abort();
        }
    }

    #[tokio::test]
    async fn test_drain_fails_queued_waiters() {
        let rt = RevisionThrottler::new(&revision(10), "10.1.0.1", true, 100);
        let rt2 = rt.clone();
        let waiter = tokio::spawn(async move { RevisionThrottler::acquire(&rt2).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        RevisionThrottler::drain(&rt);
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, ActivatorError::RevisionGone(_)));

        let err = RevisionThrottler::acquire(&rt).await.unwrap_err();
        assert!(matches!(err, ActivatorError::RevisionGone(_)));
    }

    #[tokio::test]
    async fn test_capacity_shrink_does_not_evict() {
        let rt = backed(1, &["10.0.0.1:8012", "10.0.0.2:8012"]);
        assert_eq!(rt.capacity(), 2);
        let g1 = RevisionThrottler::acquire(&rt).await.unwrap();
        let g2 = RevisionThrottler::acquire(&rt).await.unwrap();

        // One pod leaves; capacity shrinks below in-flight.
        RevisionThrottler::update_endpoints(&rt, &snapshot(&["10.0.0.1:8012"], &["10.1.0.1"], 2));
        assert_eq!(rt.capacity(), 1);
        assert_eq!(rt.in_flight(), 2);

        drop(g1);
        drop(g2);
        assert_eq!(rt.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_change_updates_weights() {
        let rt = backed(1, &["10.0.0.1:8012"]);
        let _g = RevisionThrottler::acquire(&rt).await.unwrap();

        RevisionThrottler::update_revision(&rt, &revision(2));
        assert_eq!(rt.capacity(), 2);

        let g2 = RevisionThrottler::acquire(&rt).await.unwrap();
        assert_eq!(g2.dest(), "10.0.0.1:8012");
    }

    #[tokio::test]
    async fn test_unbounded_revision_admits_without_gating() {
        let rt = backed(0, &["10.0.0.1:8012", "10.0.0.2:8012"]);
        assert_eq!(rt.capacity(), u32::MAX);

        // Still load-spreads round-robin.
        let g1 = RevisionThrottler::acquire(&rt).await.unwrap();
        let g2 = RevisionThrottler::acquire(&rt).await.unwrap();
        assert_ne!(g1.dest(), g2.dest());
    }

    #[tokio::test]
    async fn test_service_mode_targets_private_service() {
        let rt = RevisionThrottler::new(&revision(10), "10.1.0.1", false, 100);
        RevisionThrottler::update_endpoints(&rt, &snapshot(&["10.0.0.1:8012"], &["10.1.0.1"], 1));
        RevisionThrottler::update_sks(
            &rt,
            &SksState {
                private_service: "hello-00001-private.default:80".into(),
                ..SksState::default()
            },
        );

        let g = RevisionThrottler::acquire(&rt).await.unwrap();
        assert_eq!(g.dest(), "hello-00001-private.default:80");
    }

    #[tokio::test]
    async fn test_standby_activator_parks() {
        // Two activators, only one assigned; we are the standby.
        let rt = RevisionThrottler::new(&revision(10), "10.1.0.2", true, 100);
        RevisionThrottler::update_endpoints(
            &rt,
            &snapshot(&["10.0.0.1:8012"], &["10.1.0.1", "10.1.0.2"], 1),
        );
        RevisionThrottler::update_sks(
            &rt,
            &SksState {
                num_activators: 1,
                ..SksState::default()
            },
        );
        assert_eq!(rt.capacity(), 0);
    }

    #[test]
    fn test_throttler_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RevisionThrottler>();
        assert_send_sync::<SlotGuard>();
    }
}
