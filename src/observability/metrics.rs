//! Activator metrics: lightweight counters and gauges
//!
//! In-process metrics without external dependencies, rendered as
//! Prometheus text on the admin listener or exported as JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;

/// Point-in-time view of all metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Total requests that entered the activation chain
    pub request_count: u64,
    /// Responses by status class (2xx, 3xx, 4xx, 5xx)
    pub status_classes: HashMap<String, u64>,
    /// Requests currently in flight through this activator
    pub in_flight: i64,
    /// Per-revision request counts
    pub revision_requests: HashMap<String, u64>,
}

/// Metrics collector
pub struct ActivatorMetrics {
    request_count: AtomicU64,
    status_2xx: AtomicU64,
    status_3xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
    in_flight: AtomicI64,
    revision_requests: RwLock<HashMap<String, u64>>,
}

impl ActivatorMetrics {
    pub fn new() -> Self {
        Self {
            request_count: AtomicU64::new(0),
            status_2xx: AtomicU64::new(0),
            status_3xx: AtomicU64::new(0),
            status_4xx: AtomicU64::new(0),
            status_5xx: AtomicU64::new(0),
            in_flight: AtomicI64::new(0),
            revision_requests: RwLock::new(HashMap::new()),
        }
    }

    /// Record a request entering the chain for the given revision
    pub fn record_request(&self, revision: &str) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        let mut map = self.revision_requests.write().unwrap();
        *map.entry(revision.to_string()).or_insert(0) += 1;
    }

    /// Record the response status
    pub fn record_status(&self, status: u16) {
        match status / 100 {
            2 => {
                self.status_2xx.fetch_add(1, Ordering::Relaxed);
            }
            3 => {
                self.status_3xx.fetch_add(1, Ordering::Relaxed);
            }
            4 => {
                self.status_4xx.fetch_add(1, Ordering::Relaxed);
            }
            5 => {
                self.status_5xx.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn inc_in_flight(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_in_flight(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Take a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut status_classes = HashMap::new();
        status_classes.insert("2xx".to_string(), self.status_2xx.load(Ordering::Relaxed));
        status_classes.insert("3xx".to_string(), self.status_3xx.load(Ordering::Relaxed));
        status_classes.insert("4xx".to_string(), self.status_4xx.load(Ordering::Relaxed));
        status_classes.insert("5xx".to_string(), self.status_5xx.load(Ordering::Relaxed));

        MetricsSnapshot {
            request_count: self.request_count.load(Ordering::Relaxed),
            status_classes,
            in_flight: self.in_flight.load(Ordering::Relaxed),
            revision_requests: self.revision_requests.read().unwrap().clone(),
        }
    }

    /// Render all metrics in Prometheus text exposition format
    pub fn render_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::new();

        out.push_str("# TYPE activator_request_count counter\n");
        out.push_str(&format!(
            "activator_request_count {}\n",
            snapshot.request_count
        ));

        out.push_str("# TYPE activator_request_concurrency gauge\n");
        out.push_str(&format!(
            "activator_request_concurrency {}\n",
            snapshot.in_flight
        ));

        out.push_str("# TYPE activator_responses counter\n");
        let mut classes: Vec<_> = snapshot.status_classes.iter().collect();
        classes.sort();
        for (class, count) in classes {
            out.push_str(&format!(
                "activator_responses{{class=\"{}\"}} {}\n",
                class, count
            ));
        }

        out.push_str("# TYPE activator_revision_requests counter\n");
        let mut revisions: Vec<_> = snapshot.revision_requests.iter().collect();
        revisions.sort();
        for (revision, count) in revisions {
            out.push_str(&format!(
                "activator_revision_requests{{revision=\"{}\"}} {}\n",
                revision, count
            ));
        }

        out
    }
}

impl Default for ActivatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}
