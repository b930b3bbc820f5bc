//! Durable stat sink
//!
//! One logical outbound stream to the autoscaler. A dedicated writer
//! task owns the WebSocket connection, reconnecting with exponential
//! backoff when it drops. Callers enqueue batches into a bounded buffer
//! and never touch the connection; batches that fail mid-write are
//! dropped, which the autoscaler tolerates. Ordering is preserved
//! within a single connection lifetime.

use futures_util::SinkExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::backoff::ExponentialBackoff;
use crate::error::{ActivatorError, Result};
use crate::reporter::stat::{encode_batch, StatMessage};

const RECONNECT_BASE: Duration = Duration::from_millis(100);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// Streaming client that survives disconnects.
pub struct DurableSink {
    tx: Mutex<Option<mpsc::Sender<Vec<StatMessage>>>>,
    status: Arc<Mutex<Option<String>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DurableSink {
    /// Start the writer task against the given `ws://` URL with a
    /// bounded in-process buffer.
    pub fn new(url: impl Into<String>, buffer: usize) -> Arc<Self> {
        let url = url.into();
        let (tx, rx) = mpsc::channel(buffer);
        let status = Arc::new(Mutex::new(Some("not yet connected".to_string())));
        let handle = tokio::spawn(run_writer(url, rx, status.clone()));
        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            status,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Enqueue a batch. Suspends while the buffer is full; errors only
    /// when the sink has been shut down.
    pub async fn send(&self, batch: Vec<StatMessage>) -> Result<()> {
        let tx = self.tx.lock().unwrap().clone();
        match tx {
            Some(tx) => tx
                .send(batch)
                .await
                .map_err(|_| ActivatorError::SinkUnavailable("writer stopped".into())),
            None => Err(ActivatorError::SinkUnavailable("shut down".into())),
        }
    }

    /// `Ok(())` iff the connection is currently open. Drives readiness.
    pub fn status(&self) -> Result<()> {
        match &*self.status.lock().unwrap() {
            None => Ok(()),
            Some(reason) => Err(ActivatorError::SinkUnavailable(reason.clone())),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_ok()
    }

    /// Stop accepting batches, drain pending ones for up to the grace
    /// window, then tear the writer down.
    pub async fn shutdown(&self, grace: Duration) {
        drop(self.tx.lock().unwrap().take());
        let handle = self.handle.lock().unwrap().take();
        if let Some(mut handle) = handle {
            tokio::select! {
                _ = &mut handle => {}
                _ = tokio::time::sleep(grace) => {
                    tracing::warn!("Stat sink did not drain in time, aborting");
                    handle.abort();
                }
            }
        }
        *self.status.lock().unwrap() = Some("shut down".to_string());
    }
}

async fn run_writer(
    url: String,
    mut rx: mpsc::Receiver<Vec<StatMessage>>,
    status: Arc<Mutex<Option<String>>>,
) {
    let mut backoff = ExponentialBackoff::new(RECONNECT_BASE, RECONNECT_CAP);
    'connect: loop {
        let mut ws = loop {
            match connect_async(url.as_str()).await {
                Ok((ws, _)) => break ws,
                Err(e) => {
                    *status.lock().unwrap() = Some(format!("connect failed: {}", e));
                    tracing::debug!(url, error = %e, "Stat sink connect failed, backing off");
                    backoff.wait().await;
                }
            }
        };
        backoff.reset();
        *status.lock().unwrap() = None;
        tracing::info!(url, "Stat sink connected");

        loop {
            let Some(batch) = rx.recv().await else {
                let _ = ws.close(None).await;
                return;
            };
            let frame = match encode_batch(&batch) {
                Ok(buf) => Message::Binary(buf),
                Err(e) => {
                    tracing::warn!(error = %e, "Stat batch failed to encode, dropped");
                    continue;
                }
            };
            if let Err(e) = ws.send(frame).await {
                *status.lock().unwrap() = Some(format!("send failed: {}", e));
                tracing::warn!(error = %e, "Stat sink write failed, reconnecting");
                continue 'connect;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::stat::decode_batch;
    use crate::revision::RevisionKey;
    use futures_util::StreamExt;
    use tokio::net::TcpListener;

    fn message(n: u64) -> StatMessage {
        StatMessage {
            revision: RevisionKey::new("default", "hello-00001"),
            pod_name: "activator-test".into(),
            average_concurrency: 1.0,
            request_count: n as f64,
            proxied_count: 0.0,
            timestamp_millis: n,
        }
    }

    /// Accept loop that forwards every decoded batch into a channel.
    async fn stat_server(
        listener: TcpListener,
        forward: mpsc::UnboundedSender<Vec<StatMessage>>,
        drop_first_connection: bool,
    ) {
        let mut first = true;
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            if drop_first_connection && first {
                first = false;
                let _ = ws.close(None).await;
                continue;
            }
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_binary() {
                    let batch = decode_batch(&msg.into_data()).unwrap();
                    if forward.send(batch).is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn bind() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    #[tokio::test]
    async fn test_connects_and_delivers_in_order() {
        let (listener, url) = bind().await;
        let (fwd_tx, mut fwd_rx) = mpsc::unbounded_channel();
        tokio::spawn(stat_server(listener, fwd_tx, false));

        let sink = DurableSink::new(url, 16);
        for n in 0..5 {
            sink.send(vec![message(n)]).await.unwrap();
        }
        for n in 0..5 {
            let batch = fwd_rx.recv().await.unwrap();
            assert_eq!(batch[0].timestamp_millis, n);
        }
        assert!(sink.status().is_ok());
        sink.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_status_fails_while_unreachable() {
        // Nothing listens here; connects keep failing.
        let sink = DurableSink::new("ws://127.0.0.1:9", 16);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(sink.status().is_err());
        sink.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_reconnects_after_connection_drop() {
        let (listener, url) = bind().await;
        let (fwd_tx, mut fwd_rx) = mpsc::unbounded_channel();
        tokio::spawn(stat_server(listener, fwd_tx, true));

        let sink = DurableSink::new(url, 16);
        // The first connection dies; keep sending until a batch makes it
        // through the second one.
        let mut delivered = None;
        for n in 0..100 {
            sink.send(vec![message(n)]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            if let Ok(batch) = fwd_rx.try_recv() {
                delivered = Some(batch);
                break;
            }
        }
        assert!(delivered.is_some(), "no batch survived the reconnect");
        sink.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_send_after_shutdown_errors() {
        let (listener, url) = bind().await;
        let (fwd_tx, _fwd_rx) = mpsc::unbounded_channel();
        tokio::spawn(stat_server(listener, fwd_tx, false));

        let sink = DurableSink::new(url, 16);
        sink.shutdown(Duration::from_secs(1)).await;
        let err = sink.send(vec![message(1)]).await.unwrap_err();
        assert!(matches!(err, ActivatorError::SinkUnavailable(_)));
        assert!(sink.status().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending() {
        let (listener, url) = bind().await;
        let (fwd_tx, mut fwd_rx) = mpsc::unbounded_channel();
        tokio::spawn(stat_server(listener, fwd_tx, false));

        let sink = DurableSink::new(url, 16);
        sink.send(vec![message(7)]).await.unwrap();
        sink.shutdown(Duration::from_secs(2)).await;

        let batch = fwd_rx.recv().await.unwrap();
        assert_eq!(batch[0].timestamp_millis, 7);
    }
}
