//! Context binding: resolve the target revision before anything else

use async_trait::async_trait;
use http::{Request, Response, StatusCode};
use std::sync::Arc;

use super::{
    text_response, Body, HttpHandler, RequestContext, RevisionHandler, NAMESPACE_HEADER,
    REVISION_HEADER,
};
use crate::discovery::store::RevisionStore;
use crate::revision::RevisionKey;

/// Looks up the revision named by the ingress headers, falling back to
/// the Host header, and hands the request to the revision-aware chain.
pub struct ContextHandler {
    store: Arc<RevisionStore>,
    next: Arc<dyn RevisionHandler>,
}

impl ContextHandler {
    pub fn new(store: Arc<RevisionStore>, next: Arc<dyn RevisionHandler>) -> Self {
        Self { store, next }
    }
}

#[async_trait]
impl HttpHandler for ContextHandler {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let Some(key) = revision_key_from(&req) else {
            return text_response(
                StatusCode::BAD_REQUEST,
                "Request has no revision identity headers and no resolvable host",
            );
        };
        let Some(revision) = self.store.get(&key) else {
            tracing::debug!(revision = %key, "Request for unknown revision");
            return text_response(
                StatusCode::NOT_FOUND,
                &format!("Revision not found: {}", key),
            );
        };
        self.next
            .handle(req, RequestContext { revision })
            .await
    }
}

/// Revision identity from the ingress headers, or from a
/// `<name>.<namespace>[.<domain>]` host as a fallback.
pub fn revision_key_from(req: &Request<Body>) -> Option<RevisionKey> {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
    };
    if let (Some(namespace), Some(name)) = (header(NAMESPACE_HEADER), header(REVISION_HEADER)) {
        return Some(RevisionKey::new(namespace, name));
    }

    let host = header("host").or_else(|| req.uri().host())?;
    let host = host.split(':').next().unwrap_or(host);
    let mut labels = host.split('.');
    let name = labels.next()?;
    let namespace = labels.next()?;
    if name.is_empty() || namespace.is_empty() {
        return None;
    }
    Some(RevisionKey::new(namespace, name))
}
