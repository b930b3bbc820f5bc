//! Full-duplex (WebSocket) passthrough
//!
//! Upgrade requests bypass the buffered proxy: the admission slot is
//! acquired up front and held for the lifetime of the relayed
//! connection, the upstream socket is dialed before the 101 goes out,
//! and frames are relayed verbatim in both directions.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use http::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};

use super::{empty_body, error_response, text_response, Body, RequestContext};
use crate::throttler::Throttler;

/// Whether the request asks for a WebSocket upgrade
pub fn is_upgrade_request(headers: &http::HeaderMap) -> bool {
    let wants_upgrade = headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);
    let to_websocket = headers
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    wants_upgrade && to_websocket
}

/// Admit the connection, dial the chosen pod, and hand back the 101.
/// The relay itself runs on a spawned task once hyper completes the
/// client-side upgrade; the slot guard rides along and releases when
/// the relay ends.
pub async fn serve_upgrade(
    req: Request<Body>,
    ctx: &RequestContext,
    throttler: &Arc<Throttler>,
) -> Response<Body> {
    let Some(ws_key) = req
        .headers()
        .get(http::header::SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
    else {
        return text_response(StatusCode::BAD_REQUEST, "Missing Sec-WebSocket-Key");
    };

    let key = ctx.revision.key.clone();
    let guard = match throttler.acquire(&key).await {
        Ok(guard) => guard,
        Err(e) => return error_response(&e),
    };

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("ws://{}{}", guard.dest(), path);
    let upstream = match connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            tracing::warn!(revision = %key, url, error = %e, "WebSocket upstream dial failed");
            return text_response(StatusCode::BAD_GATEWAY, "WebSocket upstream dial failed");
        }
    };

    let accept = derive_accept_key(ws_key.as_bytes());
    let on_upgrade = hyper::upgrade::on(req);
    tokio::spawn(async move {
        // Slot held until the relay finishes.
        let _slot = guard;
        match on_upgrade.await {
            Ok(upgraded) => {
                let io = TokioIo::new(upgraded);
                let client = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
                relay(client, upstream).await;
                tracing::debug!(revision = %key, "WebSocket relay ended");
            }
            Err(e) => {
                tracing::debug!(revision = %key, error = %e, "Client upgrade failed");
            }
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(http::header::CONNECTION, "Upgrade")
        .header(http::header::UPGRADE, "websocket")
        .header(http::header::SEC_WEBSOCKET_ACCEPT, accept)
        .body(empty_body())
        .unwrap()
}

/// Relay frames in both directions until either side closes or errors.
pub async fn relay<C, U>(mut client: C, mut upstream: U)
where
    C: Stream<Item = tokio_tungstenite::tungstenite::Result<Message>>
        + Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
    U: Stream<Item = tokio_tungstenite::tungstenite::Result<Message>>
        + Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    loop {
        tokio::select! {
            msg = client.next() => match msg {
                Some(Ok(msg)) => {
                    let closing = msg.is_close();
                    if upstream.send(msg).await.is_err() || closing {
                        break;
                    }
                }
                _ => {
                    let _ = upstream.close().await;
                    break;
                }
            },
            msg = upstream.next() => match msg {
                Some(Ok(msg)) => {
                    let closing = msg.is_close();
                    if client.send(msg).await.is_err() || closing {
                        break;
                    }
                }
                _ => {
                    let _ = client.close().await;
                    break;
                }
            },
        }
    }
}
