//! Concurrency-report chain element

use async_trait::async_trait;
use http::{Request, Response};
use std::sync::Arc;

use super::{Body, GuardedBody, RequestContext, RevisionHandler};
use crate::reporter::ConcurrencyReporter;

/// Marks request entry and exit with the concurrency reporter. The exit
/// mark rides on the response body so a streamed response counts as in
/// flight until its last byte.
pub struct ReportHandler {
    reporter: Arc<ConcurrencyReporter>,
    next: Arc<dyn RevisionHandler>,
}

impl ReportHandler {
    pub fn new(reporter: Arc<ConcurrencyReporter>, next: Arc<dyn RevisionHandler>) -> Self {
        Self { reporter, next }
    }
}

#[async_trait]
impl RevisionHandler for ReportHandler {
    async fn handle(&self, req: Request<Body>, ctx: RequestContext) -> Response<Body> {
        let guard = ConcurrencyReporter::request_in(&self.reporter, &ctx.revision.key);
        let resp = self.next.handle(req, ctx).await;
        GuardedBody::wrap(resp, guard)
    }
}
