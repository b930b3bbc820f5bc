//! Revision model shared by the throttler, reporter, and handler chain

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Stable identity of a revision. All cross-component references go
/// through this key rather than through owning pointers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RevisionKey {
    /// Namespace the revision lives in
    pub namespace: String,
    /// Revision name
    pub name: String,
}

impl RevisionKey {
    /// Create a new key
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RevisionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Application protocol spoken by the revision's pods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain HTTP/1.1
    Http1,
    /// HTTP/2 over cleartext (prior knowledge)
    H2c,
}

impl Default for Protocol {
    fn default() -> Self {
        Self::Http1
    }
}

/// A revision as seen by the activator. Immutable per generation;
/// replaced wholesale on source updates.
#[derive(Debug, Clone)]
pub struct Revision {
    /// Stable identity
    pub key: RevisionKey,
    /// Declared max in-flight requests per pod. 0 means unbounded.
    pub container_concurrency: u32,
    /// Overall request timeout. Zero disables the timer.
    pub timeout: Duration,
    /// Bound on time until the first response byte. Zero disables.
    pub response_start_timeout: Duration,
    /// Bound on time between response bytes. Zero disables.
    pub idle_timeout: Duration,
    /// Protocol the pods speak
    pub protocol: Protocol,
    /// Whether the pods expose a TLS port for system-internal traffic
    pub tls_port_enabled: bool,
}

impl Revision {
    /// Whether the revision declared unbounded concurrency
    pub fn unbounded(&self) -> bool {
        self.container_concurrency == 0
    }
}
