//! Per-request deadline enforcement
//!
//! Three independent timers per request, each disabled when zero: an
//! overall bound, a bound on time to the first response byte, and an
//! idle bound between response bytes. A timer firing before anything
//! was written yields 504; after that the response is truncated and the
//! connection closed. Timers start when the request enters the handler,
//! not at dial time.

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body::Frame;
use http_body_util::BodyExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant, Sleep};

use super::upgrade::is_upgrade_request;
use super::{text_response, Body, BoxError, RequestContext, RevisionHandler};

const TIMEOUT_BODY: &str = "activator request timeout";

pub struct TimeoutHandler {
    next: Arc<dyn RevisionHandler>,
}

impl TimeoutHandler {
    pub fn new(next: Arc<dyn RevisionHandler>) -> Self {
        Self { next }
    }
}

fn enabled(d: Duration) -> Option<Duration> {
    (!d.is_zero()).then_some(d)
}

#[async_trait]
impl RevisionHandler for TimeoutHandler {
    async fn handle(&self, req: Request<Body>, ctx: RequestContext) -> Response<Body> {
        // Upgraded connections are long-lived by nature; the request
        // deadlines do not apply to them.
        if is_upgrade_request(req.headers()) {
            return self.next.handle(req, ctx).await;
        }

        let overall = enabled(ctx.revision.timeout);
        let response_start = enabled(ctx.revision.response_start_timeout);
        let idle = enabled(ctx.revision.idle_timeout);
        let started = Instant::now();

        // Until the first response byte, the tighter of the overall and
        // response-start bounds applies.
        let header_bound = match (overall, response_start) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let revision = ctx.revision.key.clone();
        let fut = self.next.handle(req, ctx);
        let resp = match header_bound {
            Some(bound) => match tokio::time::timeout(bound, fut).await {
                Ok(resp) => resp,
                Err(_) => {
                    tracing::info!(
                        revision = %revision,
                        bound_ms = bound.as_millis() as u64,
                        "Request timed out before response start"
                    );
                    return text_response(StatusCode::GATEWAY_TIMEOUT, TIMEOUT_BODY);
                }
            },
            None => fut.await,
        };

        let deadline = overall.map(|t| started + t);
        if deadline.is_none() && idle.is_none() {
            return resp;
        }
        resp.map(|inner| TimedBody::new(inner, deadline, idle).boxed_unsync())
    }
}

/// Body wrapper racing the remaining overall deadline and the idle
/// timer against each frame. The idle timer resets on every frame.
pub struct TimedBody {
    inner: Body,
    deadline: Option<Pin<Box<Sleep>>>,
    idle: Option<(Duration, Pin<Box<Sleep>>)>,
}

impl TimedBody {
    fn new(inner: Body, deadline: Option<Instant>, idle: Option<Duration>) -> Self {
        Self {
            inner,
            deadline: deadline.map(|at| Box::pin(sleep_until(at))),
            idle: idle.map(|d| (d, Box::pin(sleep(d)))),
        }
    }
}

impl http_body::Body for TimedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();

        if let Some(deadline) = &mut this.deadline {
            if deadline.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Some(Err("request timeout, response truncated".into())));
            }
        }
        if let Some((_, timer)) = &mut this.idle {
            if timer.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Some(Err("idle timeout, response truncated".into())));
            }
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some((duration, timer)) = &mut this.idle {
                    timer.as_mut().reset(Instant::now() + *duration);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            other => other,
        }
    }
}
