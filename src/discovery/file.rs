//! File-backed event source
//!
//! Watches a TOML topology file describing revisions, their ready pods,
//! the activator set, and routing state. Edits to the file are diffed
//! against the previous snapshot and emitted as Add/Update/Delete
//! events, which makes the activator fully drivable without a cluster
//! API. A parse failure keeps the last known good topology.

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{DiscoveryEvent, EndpointsSnapshot, EventSource, EventType, SksMode, SksState};
use crate::error::{ActivatorError, Result};
use crate::revision::{Protocol, Revision, RevisionKey};

/// Coalesce rapid editor write bursts
const DEBOUNCE: Duration = Duration::from_millis(200);

/// Event source backed by a watched topology file
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RevisionEntry {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub container_concurrency: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub response_start_timeout_secs: u64,
    #[serde(default)]
    pub idle_timeout_secs: u64,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub tls_port_enabled: bool,
    #[serde(default)]
    pub ready_pods: Vec<String>,
    #[serde(default)]
    pub activators: Vec<String>,
    #[serde(default)]
    pub sks: Option<SksEntry>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SksEntry {
    #[serde(default)]
    pub mode: SksMode,
    #[serde(default)]
    pub num_activators: u32,
    #[serde(default)]
    pub private_service: String,
    #[serde(default)]
    pub public_service: String,
}

#[derive(Debug, Default, Deserialize)]
struct TopologyFile {
    #[serde(default)]
    revisions: Vec<RevisionEntry>,
}

fn default_timeout_secs() -> u64 {
    300
}

impl RevisionEntry {
    pub fn key(&self) -> RevisionKey {
        RevisionKey::new(self.namespace.clone(), self.name.clone())
    }

    pub fn revision(&self) -> Revision {
        Revision {
            key: self.key(),
            container_concurrency: self.container_concurrency,
            timeout: Duration::from_secs(self.timeout_secs),
            response_start_timeout: Duration::from_secs(self.response_start_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            protocol: self.protocol,
            tls_port_enabled: self.tls_port_enabled,
        }
    }

    pub fn snapshot(&self, resource_version: u64) -> EndpointsSnapshot {
        EndpointsSnapshot {
            ready_pod_ips: self.ready_pods.iter().cloned().collect(),
            activator_ips: self.activators.iter().cloned().collect(),
            resource_version,
        }
    }

    pub fn sks_state(&self) -> SksState {
        match &self.sks {
            Some(entry) => SksState {
                mode: entry.mode,
                num_activators: entry.num_activators,
                private_service: entry.private_service.clone(),
                public_service: entry.public_service.clone(),
            },
            None => SksState::default(),
        }
    }
}

/// Parse a topology file into entries keyed by revision
pub fn load_topology(path: &Path) -> Result<HashMap<RevisionKey, RevisionEntry>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ActivatorError::Config(format!(
            "Failed to read topology file {}: {}",
            path.display(),
            e
        ))
    })?;
    let file: TopologyFile = toml::from_str(&content).map_err(|e| {
        ActivatorError::Config(format!(
            "Failed to parse topology file {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok(file
        .revisions
        .into_iter()
        .map(|entry| (entry.key(), entry))
        .collect())
}

/// Diff two topology snapshots into discovery events. Every changed
/// entry re-emits revision, endpoints, and routing state; receivers are
/// idempotent so the over-approximation is harmless.
pub fn diff_topology(
    old: &HashMap<RevisionKey, RevisionEntry>,
    new: &HashMap<RevisionKey, RevisionEntry>,
    resource_version: u64,
) -> Vec<DiscoveryEvent> {
    let mut events = Vec::new();

    for (key, entry) in new {
        match old.get(key) {
            None => push_entry(&mut events, EventType::Add, entry, resource_version),
            Some(previous) if previous != entry => {
                push_entry(&mut events, EventType::Update, entry, resource_version)
            }
            Some(_) => {}
        }
    }
    for (key, entry) in old {
        if !new.contains_key(key) {
            events.push(DiscoveryEvent::Revision {
                event: EventType::Delete,
                revision: entry.revision(),
            });
        }
    }

    events
}

fn push_entry(
    events: &mut Vec<DiscoveryEvent>,
    event: EventType,
    entry: &RevisionEntry,
    resource_version: u64,
) {
    events.push(DiscoveryEvent::Revision {
        event,
        revision: entry.revision(),
    });
    events.push(DiscoveryEvent::Endpoints {
        event,
        key: entry.key(),
        snapshot: entry.snapshot(resource_version),
    });
    events.push(DiscoveryEvent::ServerlessService {
        event,
        key: entry.key(),
        sks: entry.sks_state(),
    });
}

#[async_trait]
impl EventSource for FileSource {
    async fn run(&self, tx: mpsc::Sender<DiscoveryEvent>) -> Result<()> {
        let mut version: u64 = 1;
        let mut current = load_topology(&self.path)?;
        for event in diff_topology(&HashMap::new(), &current, version) {
            if tx.send(event).await.is_err() {
                return Ok(());
            }
        }
        tracing::info!(
            topology = %self.path.display(),
            revisions = current.len(),
            "Topology loaded"
        );

        // Filesystem events arrive on a dedicated thread and are bridged
        // into the async loop through a channel.
        let (fs_tx, mut fs_rx) = mpsc::channel::<()>(1);
        let (notify_tx, notify_rx) = std::sync::mpsc::channel();
        let mut watcher: RecommendedWatcher =
            Watcher::new(notify_tx, notify::Config::default())
                .map_err(|e| ActivatorError::Other(format!("Failed to create file watcher: {}", e)))?;
        let watch_path = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        watcher
            .watch(&watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| {
                ActivatorError::Other(format!("Failed to watch {}: {}", watch_path.display(), e))
            })?;
        std::thread::spawn(move || {
            // Keep the watcher alive for the lifetime of the thread.
            let _watcher = watcher;
            while notify_rx.recv().is_ok() {
                if fs_tx.blocking_send(()).is_err() {
                    return;
                }
            }
        });

        loop {
            if fs_rx.recv().await.is_none() {
                return Ok(());
            }
            tokio::time::sleep(DEBOUNCE).await;
            while fs_rx.try_recv().is_ok() {}

            match load_topology(&self.path) {
                Ok(new) => {
                    version += 1;
                    let events = diff_topology(&current, &new, version);
                    if !events.is_empty() {
                        tracing::info!(
                            topology = %self.path.display(),
                            changes = events.len(),
                            "Topology changed"
                        );
                    }
                    current = new;
                    for event in events {
                        if tx.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Topology reload failed, keeping current state");
                }
            }
        }
    }
}
