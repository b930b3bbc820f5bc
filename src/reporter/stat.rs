//! Stat messages and their wire encoding

use serde::{Deserialize, Serialize};

use crate::error::{ActivatorError, Result};
use crate::revision::RevisionKey;

/// One revision's load observation over a reporting window, consumed by
/// the autoscaler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatMessage {
    /// Revision the stats belong to
    pub revision: RevisionKey,
    /// Name of the activator pod that observed the load
    pub pod_name: String,
    /// Time-weighted in-flight request count over the window
    pub average_concurrency: f64,
    /// Requests that arrived during the window
    pub request_count: f64,
    /// Requests admitted through the throttler during the window
    pub proxied_count: f64,
    /// Emit time, milliseconds since the epoch
    pub timestamp_millis: u64,
}

/// Millisecond timestamp for stat messages
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Encode a batch as a length-prefixed JSON record: a big-endian u32
/// byte length followed by the serialized array.
pub fn encode_batch(messages: &[StatMessage]) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(messages)?;
    if payload.len() > u32::MAX as usize {
        return Err(ActivatorError::Other("Stat batch too large".into()));
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a length-prefixed batch produced by [`encode_batch`].
pub fn decode_batch(buf: &[u8]) -> Result<Vec<StatMessage>> {
    if buf.len() < 4 {
        return Err(ActivatorError::Other("Stat record truncated".into()));
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let payload = buf
        .get(4..4 + len)
        .ok_or_else(|| ActivatorError::Other("Stat record truncated".into()))?;
    Ok(serde_json::from_slice(payload)?)
}
