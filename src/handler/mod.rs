//! Request handler chain
//!
//! The activation pipeline is composed of small handlers wrapping each
//! other, innermost first: activation (throttle + proxy), timeout
//! enforcement, concurrency reporting, metric tagging, context binding,
//! probe filtering, and health checks. Handlers before the context bind
//! see bare requests; handlers after it receive the resolved revision.

pub mod activation;
pub mod context;
pub mod health;
pub mod metric;
pub mod probe;
pub mod report;
pub mod timeout;
pub mod upgrade;

pub use activation::ActivationHandler;
pub use context::ContextHandler;
pub use health::{HealthHandler, HealthState};
pub use metric::MetricHandler;
pub use probe::ProbeHandler;
pub use report::ReportHandler;
pub use timeout::TimeoutHandler;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body::Frame;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::error::ActivatorError;
use crate::revision::Revision;

/// Ingress header naming the target revision's namespace
pub const NAMESPACE_HEADER: &str = "knative-serving-namespace";
/// Ingress header naming the target revision
pub const REVISION_HEADER: &str = "knative-serving-revision";
/// Marks a network probe that must be answered without forwarding
pub const NETWORK_PROBE_HEADER: &str = "k-network-probe";
/// Hash echoed back to network probes
pub const NETWORK_HASH_HEADER: &str = "k-network-hash";
/// Marks a kubelet readiness or liveness probe
pub const KUBELET_PROBE_HEADER: &str = "k-kubelet-probe";
/// Tells downstream load balancers to honor direct pod addressing
pub const PASSTHROUGH_LB_HEADER: &str = "k-passthrough-lb";

/// Boxed error carried by streaming bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type flowing through the chain
pub type Body = UnsyncBoxBody<Bytes, BoxError>;

/// A handler running before the revision is known
#[async_trait]
pub trait HttpHandler: Send + Sync {
    async fn handle(&self, req: Request<Body>) -> Response<Body>;
}

/// A handler running with the revision resolved
#[async_trait]
pub trait RevisionHandler: Send + Sync {
    async fn handle(&self, req: Request<Body>, ctx: RequestContext) -> Response<Body>;
}

/// Per-request context established by the context handler
#[derive(Clone)]
pub struct RequestContext {
    pub revision: Arc<Revision>,
}

/// A complete body from a byte buffer
pub fn full_body(data: impl Into<Bytes>) -> Body {
    Full::new(data.into()).map_err(|e| match e {}).boxed_unsync()
}

/// An empty body
pub fn empty_body() -> Body {
    full_body(Bytes::new())
}

/// Plain-text response with the given status
pub fn text_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(message.to_string()))
        .unwrap()
}

/// Map an activator error to its response status
pub fn status_for(err: &ActivatorError) -> StatusCode {
    match err {
        ActivatorError::RevisionNotFound(_) => StatusCode::NOT_FOUND,
        ActivatorError::RevisionGone(_)
        | ActivatorError::Draining
        | ActivatorError::Overload(_) => StatusCode::SERVICE_UNAVAILABLE,
        ActivatorError::PodUnavailable(_) | ActivatorError::Http(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Error rendered as a plain-text response
pub fn error_response(err: &ActivatorError) -> Response<Body> {
    text_response(status_for(err), &err.to_string())
}

/// Streaming body fed by a channel; the producer side is pumped by a
/// background task, giving natural backpressure through the channel
/// bound.
#[derive(Debug)]
pub struct ChannelBody {
    rx: mpsc::Receiver<Result<Bytes, BoxError>>,
}

impl ChannelBody {
    pub fn new(rx: mpsc::Receiver<Result<Bytes, BoxError>>) -> Self {
        Self { rx }
    }
}

impl http_body::Body for ChannelBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(bytes))) => Poll::Ready(Some(Ok(Frame::data(bytes)))),
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Body wrapper that keeps a guard alive until the body is fully
/// consumed or dropped. Used to tie request accounting to response
/// completion rather than to header emission.
pub struct GuardedBody<G> {
    inner: Body,
    _guard: G,
}

impl<G: Send + Unpin + 'static> GuardedBody<G> {
    pub fn wrap(resp: Response<Body>, guard: G) -> Response<Body> {
        resp.map(|inner| {
            GuardedBody {
                inner,
                _guard: guard,
            }
            .boxed_unsync()
        })
    }
}

impl<G: Send + Unpin + 'static> http_body::Body for GuardedBody<G> {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&ActivatorError::RevisionNotFound("a/b".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&ActivatorError::Draining),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&ActivatorError::Overload("a/b".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&ActivatorError::RevisionGone("a/b".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&ActivatorError::PodUnavailable("p".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&ActivatorError::Other("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_text_response() {
        let resp = text_response(StatusCode::GATEWAY_TIMEOUT, "activator request timeout");
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            testing::body_string(resp).await,
            "activator request timeout"
        );
    }

    #[tokio::test]
    async fn test_channel_body_streams_and_ends() {
        let (tx, rx) = mpsc::channel(4);
        let body = ChannelBody::new(rx);
        tx.send(Ok(Bytes::from("hello "))).await.unwrap();
        tx.send(Ok(Bytes::from("world"))).await.unwrap();
        drop(tx);

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from("hello world"));
    }

    #[tokio::test]
    async fn test_channel_body_propagates_error() {
        let (tx, rx) = mpsc::channel::<Result<Bytes, BoxError>>(4);
        let body = ChannelBody::new(rx);
        tx.send(Err("stream reset".into())).await.unwrap();
        drop(tx);

        assert!(body.collect().await.is_err());
    }

    #[tokio::test]
    async fn test_guarded_body_drops_guard_after_consumption() {
        struct Flag(Arc<std::sync::atomic::AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let resp = text_response(StatusCode::OK, "ok");
        let resp = GuardedBody::wrap(resp, Flag(dropped.clone()));

        assert!(!dropped.load(std::sync::atomic::Ordering::SeqCst));
        let _ = resp.into_body().collect().await.unwrap();
        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
    }
}
