//! Concurrency reporting
//!
//! Observes request entry and exit per revision, integrates in-flight
//! counts into time-weighted averages, and emits stat messages on a
//! fixed window plus immediate edge messages at the 0→1 and 1→0
//! transitions. Messages flow through a bounded channel to the durable
//! sink; a full channel drops the message rather than blocking the
//! request path.

pub mod stat;

pub use stat::StatMessage;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::revision::RevisionKey;
use crate::sink::DurableSink;

struct WindowState {
    current: i32,
    request_count: f64,
    proxied_count: f64,
    /// In-flight count integrated over time since the window started
    accumulator: f64,
    last_change: Instant,
}

impl WindowState {
    fn new(now: Instant) -> Self {
        Self {
            current: 0,
            request_count: 0.0,
            proxied_count: 0.0,
            accumulator: 0.0,
            last_change: now,
        }
    }

    fn integrate(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_change);
        self.accumulator += self.current as f64 * elapsed.as_secs_f64();
        self.last_change = now;
    }
}

/// Per-revision stat aggregation.
pub struct ConcurrencyReporter {
    pod_name: String,
    window: Duration,
    stat_tx: mpsc::Sender<Vec<StatMessage>>,
    revisions: Mutex<HashMap<RevisionKey, WindowState>>,
}

impl ConcurrencyReporter {
    pub fn new(
        pod_name: impl Into<String>,
        window: Duration,
        stat_tx: mpsc::Sender<Vec<StatMessage>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pod_name: pod_name.into(),
            window,
            stat_tx,
            revisions: Mutex::new(HashMap::new()),
        })
    }

    /// Record a request entering the handler. The returned guard records
    /// the exit when dropped, after the response body completes.
    pub fn request_in(this: &Arc<Self>, key: &RevisionKey) -> RequestGuard {
        let edge = {
            let mut map = this.revisions.lock().unwrap();
            let now = Instant::now();
            let state = map
                .entry(key.clone())
                .or_insert_with(|| WindowState::new(now));
            state.integrate(now);
            state.current += 1;
            state.request_count += 1.0;
            if state.current == 1 {
                // Wake-up edge: report the arrival immediately and
                // consume the counters so the tick reports the rest of
                // the window without double counting.
                let request_count = std::mem::take(&mut state.request_count);
                let proxied_count = std::mem::take(&mut state.proxied_count);
                Some(this.message(key, 1.0, request_count, proxied_count))
            } else {
                None
            }
        };
        if let Some(msg) = edge {
            this.emit_edge(msg);
        }
        RequestGuard {
            reporter: this.clone(),
            key: key.clone(),
        }
    }

    /// Record that a request was admitted through the throttler.
    pub fn report_proxied(&self, key: &RevisionKey) {
        let mut map = self.revisions.lock().unwrap();
        if let Some(state) = map.get_mut(key) {
            state.proxied_count += 1.0;
        }
    }

    fn request_out(&self, key: &RevisionKey) {
        let edge = {
            let mut map = self.revisions.lock().unwrap();
            let Some(state) = map.get_mut(key) else {
                return;
            };
            state.integrate(Instant::now());
            state.current = (state.current - 1).max(0);
            if state.current == 0 {
                // Quiescence edge.
                Some(self.message(key, 0.0, 0.0, 0.0))
            } else {
                None
            }
        };
        if let Some(msg) = edge {
            self.emit_edge(msg);
        }
    }

    /// Close the current window: emit one message per revision with
    /// activity, reset counters, and evict entries that went idle.
    pub fn flush(&self, now: Instant) -> Vec<StatMessage> {
        let window_secs = self.window.as_secs_f64();
        let mut out = Vec::new();
        let mut map = self.revisions.lock().unwrap();
        map.retain(|key, state| {
            state.integrate(now);
            let active =
                state.accumulator > 0.0 || state.request_count > 0.0 || state.proxied_count > 0.0;
            if active {
                out.push(StatMessage {
                    revision: key.clone(),
                    pod_name: self.pod_name.clone(),
                    average_concurrency: state.accumulator / window_secs,
                    request_count: state.request_count,
                    proxied_count: state.proxied_count,
                    timestamp_millis: stat::now_millis(),
                });
            }
            state.accumulator = 0.0;
            state.request_count = 0.0;
            state.proxied_count = 0.0;
            state.current > 0 || active
        });
        out
    }

    /// Tick loop: flush every window and push the batch to the sink
    /// channel. Runs until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.window);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            let messages = self.flush(Instant::now());
            if messages.is_empty() {
                continue;
            }
            if self.stat_tx.send(messages).await.is_err() {
                tracing::warn!("Stat channel closed, stopping reporter");
                return;
            }
        }
    }

    fn message(
        &self,
        key: &RevisionKey,
        average_concurrency: f64,
        request_count: f64,
        proxied_count: f64,
    ) -> StatMessage {
        StatMessage {
            revision: key.clone(),
            pod_name: self.pod_name.clone(),
            average_concurrency,
            request_count,
            proxied_count,
            timestamp_millis: stat::now_millis(),
        }
    }

    fn emit_edge(&self, msg: StatMessage) {
        if self.stat_tx.try_send(vec![msg]).is_err() {
            tracing::debug!("Stat channel full, edge message dropped");
        }
    }

    /// Revisions currently tracked (in flight or active this window)
    pub fn tracked_revisions(&self) -> usize {
        self.revisions.lock().unwrap().len()
    }
}

/// RAII exit marker handed out by [`ConcurrencyReporter::request_in`].
pub struct RequestGuard {
    reporter: Arc<ConcurrencyReporter>,
    key: RevisionKey,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.reporter.request_out(&self.key);
    }
}

/// Pump stat batches from the reporter channel into the durable sink.
pub async fn report_stats(sink: Arc<DurableSink>, mut rx: mpsc::Receiver<Vec<StatMessage>>) {
    while let Some(batch) = rx.recv().await {
        if let Err(e) = sink.send(batch).await {
            tracing::debug!(error = %e, "Stat batch dropped");
        }
    }
}
