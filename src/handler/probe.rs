//! Network probe short-circuit

use async_trait::async_trait;
use http::{Request, Response, StatusCode};
use std::sync::Arc;

use super::{text_response, Body, HttpHandler, NETWORK_HASH_HEADER, NETWORK_PROBE_HEADER};

/// Answers ingress and routing-state probes without forwarding, echoing
/// the expected hash so the prober can tell this activator generation
/// apart from a stale one.
pub struct ProbeHandler {
    next: Arc<dyn HttpHandler>,
}

impl ProbeHandler {
    pub fn new(next: Arc<dyn HttpHandler>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl HttpHandler for ProbeHandler {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        if req.headers().contains_key(NETWORK_PROBE_HEADER) {
            let hash = req
                .headers()
                .get(NETWORK_HASH_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            return text_response(StatusCode::OK, hash);
        }
        self.next.handle(req).await
    }
}
