//! Activation: admit through the throttler, then proxy
//!
//! The innermost handler. The request body is buffered so a
//! connection-refused attempt can be replayed against a fresh pod; the
//! response streams through untouched. Upgrade requests take the
//! full-duplex relay path instead.

use async_trait::async_trait;
use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{
    error_response, text_response, upgrade, Body, RequestContext, RevisionHandler,
};
use crate::config::ActivatorConfig;
use crate::proxy::{self, is_hop_by_hop, ProxyRequest, Transport};
use crate::reporter::ConcurrencyReporter;
use crate::throttler::Throttler;

pub struct ActivationHandler {
    throttler: Arc<Throttler>,
    transport: Arc<Transport>,
    reporter: Arc<ConcurrencyReporter>,
    host_override: Option<String>,
    headers_to_remove: Vec<String>,
}

impl ActivationHandler {
    pub fn new(
        throttler: Arc<Throttler>,
        transport: Arc<Transport>,
        reporter: Arc<ConcurrencyReporter>,
        config: &ActivatorConfig,
    ) -> Self {
        Self {
            throttler,
            transport,
            reporter,
            host_override: config.host_override.clone(),
            headers_to_remove: config.headers_to_remove.clone(),
        }
    }
}

#[async_trait]
impl RevisionHandler for ActivationHandler {
    async fn handle(&self, req: Request<Body>, ctx: RequestContext) -> Response<Body> {
        if upgrade::is_upgrade_request(req.headers()) {
            return upgrade::serve_upgrade(req, &ctx, &self.throttler).await;
        }

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::debug!(error = %e, "Failed to read request body");
                return text_response(StatusCode::BAD_REQUEST, "Failed to read request body");
            }
        };

        let request = ProxyRequest::new(
            &parts,
            body,
            &ctx.revision,
            &self.transport,
            self.host_override.clone(),
            &self.headers_to_remove,
        );
        let key = ctx.revision.key.clone();

        let transport = self.transport.clone();
        let reporter = self.reporter.clone();
        let attempt_key = key.clone();
        // Count the request as proxied once, on its first admission.
        let proxied = Arc::new(AtomicBool::new(false));

        let result = self
            .throttler
            .try_run(&key, move |dest| {
                let transport = transport.clone();
                let request = request.clone();
                let reporter = reporter.clone();
                let proxied = proxied.clone();
                let attempt_key = attempt_key.clone();
                async move {
                    if !proxied.swap(true, Ordering::Relaxed) {
                        reporter.report_proxied(&attempt_key);
                    }
                    proxy::forward(&transport, &request, &dest).await
                }
            })
            .await;

        match result {
            Ok(forwarded) => {
                let mut builder = Response::builder().status(forwarded.status);
                for (name, value) in forwarded.headers.iter() {
                    if !is_hop_by_hop(name.as_str()) {
                        builder = builder.header(name, value);
                    }
                }
                builder.body(forwarded.body.boxed_unsync()).unwrap()
            }
            Err(e) => {
                let resp = error_response(&e);
                if resp.status().is_server_error() {
                    tracing::warn!(revision = %key, error = %e, "Activation failed");
                } else {
                    tracing::debug!(revision = %key, error = %e, "Request rejected");
                }
                resp
            }
        }
    }
}
