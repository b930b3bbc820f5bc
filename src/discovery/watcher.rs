//! Endpoint watcher: bridges the event source to the throttler fleet
//!
//! Applies staleness rules, keeps the revision store current for the
//! context handler, and forwards typed updates to the throttler.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::store::RevisionStore;
use super::{DiscoveryEvent, EndpointsSnapshot, EventType};
use crate::revision::RevisionKey;
use crate::throttler::ThrottlerUpdate;

pub struct EndpointWatcher {
    store: Arc<RevisionStore>,
    updates: mpsc::Sender<ThrottlerUpdate>,
    /// Last applied endpoints version per revision; older ones are stale.
    endpoint_versions: HashMap<RevisionKey, u64>,
}

impl EndpointWatcher {
    pub fn new(store: Arc<RevisionStore>, updates: mpsc::Sender<ThrottlerUpdate>) -> Self {
        Self {
            store,
            updates,
            endpoint_versions: HashMap::new(),
        }
    }

    /// Consume discovery events until the channel closes.
    pub async fn run(mut self, mut rx: mpsc::Receiver<DiscoveryEvent>) {
        while let Some(event) = rx.recv().await {
            self.apply(event).await;
        }
        tracing::debug!("Discovery event channel closed");
    }

    /// Apply a single discovery event.
    pub async fn apply(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Revision { event, revision } => {
                match event {
                    EventType::Add | EventType::Update => {
                        self.store.insert(revision.clone());
                    }
                    EventType::Delete => {
                        self.store.remove(&revision.key);
                        self.endpoint_versions.remove(&revision.key);
                    }
                }
                self.forward(ThrottlerUpdate::Revision { event, revision })
                    .await;
            }
            DiscoveryEvent::Endpoints {
                event,
                key,
                snapshot,
            } => {
                if let Some(&last) = self.endpoint_versions.get(&key) {
                    if snapshot.resource_version < last {
                        tracing::debug!(
                            revision = %key,
                            version = snapshot.resource_version,
                            last,
                            "Stale endpoints update ignored"
                        );
                        return;
                    }
                }
                self.endpoint_versions
                    .insert(key.clone(), snapshot.resource_version);

                // A deleted endpoints object reads as an empty snapshot.
                let snapshot = if event == EventType::Delete {
                    EndpointsSnapshot {
                        resource_version: snapshot.resource_version,
                        ..EndpointsSnapshot::default()
                    }
                } else {
                    snapshot
                };
                self.forward(ThrottlerUpdate::Endpoints { key, snapshot })
                    .await;
            }
            DiscoveryEvent::ServerlessService { event, key, sks } => {
                let sks = if event == EventType::Delete {
                    Default::default()
                } else {
                    sks
                };
                self.forward(ThrottlerUpdate::ServerlessService { key, sks })
                    .await;
            }
        }
    }

    async fn forward(&self, update: ThrottlerUpdate) {
        if self.updates.send(update).await.is_err() {
            tracing::warn!("Throttler update channel closed, dropping update");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::SksState;
    use crate::revision::{Protocol, Revision};
    use std::time::Duration;

    fn revision(name: &str) -> Revision {
        Revision {
            key: RevisionKey::new("default", name),
            container_concurrency: 10,
            timeout: Duration::from_secs(300),
            response_start_timeout: Duration::ZERO,
            idle_timeout: Duration::ZERO,
            protocol: Protocol::Http1,
            tls_port_enabled: false,
        }
    }

    fn snapshot(version: u64, pods: &[&str]) -> EndpointsSnapshot {
        EndpointsSnapshot {
            ready_pod_ips: pods.iter().map(|s| s.to_string()).collect(),
            activator_ips: ["10.1.0.1".to_string()].into_iter().collect(),
            resource_version: version,
        }
    }

    fn watcher() -> (
        EndpointWatcher,
        Arc<RevisionStore>,
        mpsc::Receiver<ThrottlerUpdate>,
    ) {
        let store = Arc::new(RevisionStore::new());
        let (tx, rx) = mpsc::channel(16);
        (EndpointWatcher::new(store.clone(), tx), store, rx)
    }

    #[tokio::test]
    async fn test_revision_add_populates_store_and_forwards() {
        let (mut w, store, mut rx) = watcher();
        w.apply(DiscoveryEvent::Revision {
            event: EventType::Add,
            revision: revision("r1"),
        })
        .await;

        assert!(store.get(&RevisionKey::new("default", "r1")).is_some());
        assert!(matches!(
            rx.recv().await.unwrap(),
            ThrottlerUpdate::Revision {
                event: EventType::Add,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_revision_delete_clears_store() {
        let (mut w, store, mut rx) = watcher();
        w.apply(DiscoveryEvent::Revision {
            event: EventType::Add,
            revision: revision("r1"),
        })
        .await;
        w.apply(DiscoveryEvent::Revision {
            event: EventType::Delete,
            revision: revision("r1"),
        })
        .await;

        assert!(store.get(&RevisionKey::new("default", "r1")).is_none());
        rx.recv().await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            ThrottlerUpdate::Revision {
                event: EventType::Delete,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_stale_endpoints_are_ignored() {
        let (mut w, _store, mut rx) = watcher();
        let key = RevisionKey::new("default", "r1");

        w.apply(DiscoveryEvent::Endpoints {
            event: EventType::Update,
            key: key.clone(),
            snapshot: snapshot(5, &["10.0.0.1:8012"]),
        })
        .await;
        w.apply(DiscoveryEvent::Endpoints {
            event: EventType::Update,
            key: key.clone(),
            snapshot: snapshot(3, &["10.0.0.9:8012"]),
        })
        .await;

        let ThrottlerUpdate::Endpoints { snapshot, .. } = rx.recv().await.unwrap() else {
            panic!("expected endpoints update");
        };
        assert_eq!(snapshot.resource_version, 5);
        // The stale version 3 update produced nothing.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_endpoints_delete_reads_as_empty() {
        let (mut w, _store, mut rx) = watcher();
        let key = RevisionKey::new("default", "r1");

        w.apply(DiscoveryEvent::Endpoints {
            event: EventType::Delete,
            key: key.clone(),
            snapshot: snapshot(7, &["10.0.0.1:8012"]),
        })
        .await;

        let ThrottlerUpdate::Endpoints { snapshot, .. } = rx.recv().await.unwrap() else {
            panic!("expected endpoints update");
        };
        assert!(snapshot.ready_pod_ips.is_empty());
        assert!(snapshot.activator_ips.is_empty());
        assert_eq!(snapshot.resource_version, 7);
    }

    #[tokio::test]
    async fn test_version_tracking_resets_on_revision_delete() {
        let (mut w, _store, mut rx) = watcher();
        let key = RevisionKey::new("default", "r1");

        w.apply(DiscoveryEvent::Endpoints {
            event: EventType::Update,
            key: key.clone(),
            snapshot: snapshot(9, &[]),
        })
        .await;
        w.apply(DiscoveryEvent::Revision {
            event: EventType::Delete,
            revision: revision("r1"),
        })
        .await;
        // After a delete, a fresh object restarts version tracking.
        w.apply(DiscoveryEvent::Endpoints {
            event: EventType::Update,
            key: key.clone(),
            snapshot: snapshot(1, &["10.0.0.1:8012"]),
        })
        .await;

        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        let ThrottlerUpdate::Endpoints { snapshot, .. } = rx.recv().await.unwrap() else {
            panic!("expected endpoints update");
        };
        assert_eq!(snapshot.resource_version, 1);
    }

    #[tokio::test]
    async fn test_sks_delete_reads_as_default() {
        let (mut w, _store, mut rx) = watcher();
        w.apply(DiscoveryEvent::ServerlessService {
            event: EventType::Delete,
            key: RevisionKey::new("default", "r1"),
            sks: SksState {
                num_activators: 3,
                private_service: "x".into(),
                ..SksState::default()
            },
        })
        .await;

        let ThrottlerUpdate::ServerlessService { sks, .. } = rx.recv().await.unwrap() else {
            panic!("expected sks update");
        };
        assert_eq!(sks, SksState::default());
    }
}
