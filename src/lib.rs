//! # wakegate
//!
//! A request-path activator for serverless revisions. It sits between
//! the ingress and revision pods, buffering requests while revisions
//! scale from zero, throttling forwarding to each revision's declared
//! per-pod concurrency, spreading load across pod IPs and activator
//! replicas, and streaming load reports to the autoscaler over a
//! durable link.
//!
//! ## Architecture
//!
//! ```text
//! Ingress → Listener → Health/Probe filter → Context bind → Metrics
//!         → Concurrency report → Timeouts → Throttler.try_run → Pod
//! ```
//!
//! Topology (revisions, ready pods, activator set, routing state) comes
//! from a pluggable event source; all state is in memory and rebuilt
//! from it on restart.

pub mod backoff;
pub mod config;
pub mod discovery;
pub mod error;
pub mod handler;
pub mod observability;
pub mod proxy;
pub mod reporter;
pub mod revision;
pub mod server;
pub mod sink;
pub mod throttler;

pub use error::{ActivatorError, Result};
pub use revision::{Revision, RevisionKey};
pub use throttler::Throttler;

use std::sync::Arc;

use config::ActivatorConfig;
use discovery::store::RevisionStore;
use handler::{
    ActivationHandler, ContextHandler, HealthHandler, HealthState, HttpHandler, MetricHandler,
    ProbeHandler, ReportHandler, TimeoutHandler,
};
use observability::ActivatorMetrics;
use proxy::Transport;
use reporter::ConcurrencyReporter;

/// Assemble the activation chain, innermost handler first. The last
/// wrapper listed runs first on every request.
#[allow(clippy::too_many_arguments)]
pub fn build_chain(
    store: Arc<RevisionStore>,
    throttler: Arc<Throttler>,
    transport: Arc<Transport>,
    reporter: Arc<ConcurrencyReporter>,
    metrics: Arc<ActivatorMetrics>,
    health: Arc<HealthState>,
    config: &ActivatorConfig,
) -> Arc<dyn HttpHandler> {
    let activation = Arc::new(ActivationHandler::new(
        throttler,
        transport,
        reporter.clone(),
        config,
    ));
    let timeout = Arc::new(TimeoutHandler::new(activation));
    let report = Arc::new(ReportHandler::new(reporter, timeout));
    let metric = Arc::new(MetricHandler::new(metrics, report));
    let context = Arc::new(ContextHandler::new(store, metric));
    let probe = Arc::new(ProbeHandler::new(context));
    Arc::new(HealthHandler::new(health, probe))
}
