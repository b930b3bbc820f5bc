//! Readiness and liveness

use async_trait::async_trait;
use http::{Request, Response, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{text_response, Body, HttpHandler, KUBELET_PROBE_HEADER};
use crate::error::Result;
use crate::sink::DurableSink;

/// Shared health signal: readiness fails as soon as the drain signal
/// fires or the stat sink loses its connection; liveness only reflects
/// that the process still serves HTTP.
pub struct HealthState {
    draining: AtomicBool,
    sink: Arc<DurableSink>,
}

impl HealthState {
    pub fn new(sink: Arc<DurableSink>) -> Arc<Self> {
        Arc::new(Self {
            draining: AtomicBool::new(false),
            sink,
        })
    }

    /// Flip readiness to failing. Called once on SIGTERM.
    pub fn start_draining(&self) {
        if !self.draining.swap(true, Ordering::SeqCst) {
            tracing::info!("Drain signal received, readiness now failing");
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn readiness(&self) -> Result<()> {
        if self.is_draining() {
            return Err(crate::error::ActivatorError::Draining);
        }
        self.sink.status()
    }
}

/// Intercepts kubelet probes ahead of the rest of the chain.
pub struct HealthHandler {
    state: Arc<HealthState>,
    next: Arc<dyn HttpHandler>,
}

impl HealthHandler {
    pub fn new(state: Arc<HealthState>, next: Arc<dyn HttpHandler>) -> Self {
        Self { state, next }
    }

    fn probe_response(&self, kind: &str) -> Response<Body> {
        match kind {
            "ready" => match self.state.readiness() {
                Ok(()) => text_response(StatusCode::OK, "ready"),
                Err(e) => {
                    tracing::debug!(error = %e, "Readiness probe failing");
                    text_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string())
                }
            },
            // Anything else is treated as a liveness probe.
            _ => text_response(StatusCode::OK, "alive"),
        }
    }
}

#[async_trait]
impl HttpHandler for HealthHandler {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let probe = req
            .headers()
            .get(KUBELET_PROBE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        match probe {
            Some(kind) => self.probe_response(&kind),
            None => self.next.handle(req).await,
        }
    }
}
