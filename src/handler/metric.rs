//! Metric tagging for the meaty part of the chain
//!
//! Sits outside the reporter and timeout handlers so health checks and
//! probes never show up in traffic metrics. The in-flight gauge is tied
//! to response body completion, not header emission.

use async_trait::async_trait;
use http::{Request, Response};
use std::sync::Arc;

use super::{Body, GuardedBody, RequestContext, RevisionHandler};
use crate::observability::ActivatorMetrics;

pub struct MetricHandler {
    metrics: Arc<ActivatorMetrics>,
    next: Arc<dyn RevisionHandler>,
}

impl MetricHandler {
    pub fn new(metrics: Arc<ActivatorMetrics>, next: Arc<dyn RevisionHandler>) -> Self {
        Self { metrics, next }
    }
}

struct InFlightGuard(Arc<ActivatorMetrics>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.dec_in_flight();
    }
}

#[async_trait]
impl RevisionHandler for MetricHandler {
    async fn handle(&self, req: Request<Body>, ctx: RequestContext) -> Response<Body> {
        self.metrics.record_request(&ctx.revision.key.to_string());
        self.metrics.inc_in_flight();
        let guard = InFlightGuard(self.metrics.clone());

        let resp = self.next.handle(req, ctx).await;
        self.metrics.record_status(resp.status().as_u16());
        GuardedBody::wrap(resp, guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::testing::{ctx, request, revision, Always};
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_records_request_and_status() {
        let metrics = Arc::new(ActivatorMetrics::new());
        let handler = MetricHandler::new(metrics.clone(), Arc::new(Always("ok")));

        let resp = handler.handle(request("http://gw/"), ctx(revision(10))).await;
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.request_count, 1);
        assert_eq!(snapshot.status_classes["2xx"], 1);
        assert_eq!(
            snapshot.revision_requests["default/hello-00001"], 1
        );

        // Still in flight until the body is consumed.
        assert_eq!(metrics.in_flight(), 1);
        let _ = resp.into_body().collect().await.unwrap();
        assert_eq!(metrics.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_dropped_response_releases_gauge() {
        let metrics = Arc::new(ActivatorMetrics::new());
        let handler = MetricHandler::new(metrics.clone(), Arc::new(Always("ok")));

        let resp = handler.handle(request("http://gw/"), ctx(revision(10))).await;
        drop(resp);
        assert_eq!(metrics.in_flight(), 0);
    }
}
