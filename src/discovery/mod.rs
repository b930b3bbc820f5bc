//! Topology discovery: revisions, endpoints, and routing state
//!
//! The activator rebuilds its entire state from an event source; nothing
//! is persisted. The source is substitutable behind the [`EventSource`]
//! trait; a file-backed implementation lives in [`file`].

pub mod file;
pub mod store;
pub mod watcher;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::revision::{Revision, RevisionKey};

/// Kind of change delivered by the event source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Add,
    Update,
    Delete,
}

/// Routing mode declared for a revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SksMode {
    /// Requests flow through the activator
    Proxy,
    /// Requests bypass the activator; it stays in path only as a buffer
    Serve,
}

impl Default for SksMode {
    fn default() -> Self {
        Self::Proxy
    }
}

/// Per-revision routing state from the serverless service object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SksState {
    pub mode: SksMode,
    /// Number of activators assigned capacity. 0 means all known.
    pub num_activators: u32,
    /// Service that addresses the revision's pods directly
    pub private_service: String,
    /// Mesh-routed fallback service
    pub public_service: String,
}

impl Default for SksState {
    fn default() -> Self {
        Self {
            mode: SksMode::Proxy,
            num_activators: 0,
            private_service: String::new(),
            public_service: String::new(),
        }
    }
}

/// Point-in-time view of a revision's endpoints
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointsSnapshot {
    /// Ready pod addresses (`host:port`)
    pub ready_pod_ips: BTreeSet<String>,
    /// Addresses of all activator replicas serving this revision
    pub activator_ips: BTreeSet<String>,
    /// Monotone version used to drop stale updates
    pub resource_version: u64,
}

/// A single change notification from the source
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Revision {
        event: EventType,
        revision: Revision,
    },
    Endpoints {
        event: EventType,
        key: RevisionKey,
        snapshot: EndpointsSnapshot,
    },
    ServerlessService {
        event: EventType,
        key: RevisionKey,
        sks: SksState,
    },
}

/// A stream of topology changes. Implementations push events into the
/// channel until it closes or the source fails; callers are expected to
/// rerun failed sources with backoff and keep serving stale snapshots
/// in the meantime.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn run(&self, tx: mpsc::Sender<DiscoveryEvent>) -> Result<()>;
}

/// Drive an event source forever, reconnecting with backoff on failure.
pub async fn run_source(source: impl EventSource, tx: mpsc::Sender<DiscoveryEvent>) {
    let mut backoff = crate::backoff::ExponentialBackoff::new(
        std::time::Duration::from_millis(100),
        std::time::Duration::from_secs(30),
    );
    loop {
        match source.run(tx.clone()).await {
            Ok(()) => return,
            Err(e) => {
                tracing::warn!(error = %e, "Event source failed, reconnecting");
                backoff.wait().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sks_defaults() {
        let sks = SksState::default();
        assert_eq!(sks.mode, SksMode::Proxy);
        assert_eq!(sks.num_activators, 0);
        assert!(sks.private_service.is_empty());
    }

    #[test]
    fn test_sks_mode_serde() {
        let m: SksMode = serde_json::from_str("\"serve\"").unwrap();
        assert_eq!(m, SksMode::Serve);
    }

    #[test]
    fn test_endpoints_snapshot_default_is_empty() {
        let snap = EndpointsSnapshot::default();
        assert!(snap.ready_pod_ips.is_empty());
        assert!(snap.activator_ips.is_empty());
        assert_eq!(snap.resource_version, 0);
    }

    #[test]
    fn test_endpoints_sets_are_sorted() {
        let mut snap = EndpointsSnapshot::default();
        snap.ready_pod_ips.insert("10.0.0.2:8012".into());
        snap.ready_pod_ips.insert("10.0.0.1:8012".into());
        let ips: Vec<_> = snap.ready_pod_ips.iter().cloned().collect();
        assert_eq!(ips, vec!["10.0.0.1:8012", "10.0.0.2:8012"]);
    }
}
