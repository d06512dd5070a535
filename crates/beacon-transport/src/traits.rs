//! Push delivery traits for Beacon.
//!
//! A push sender delivers one pre-encoded payload to one connection and
//! classifies the outcome. The broadcast dispatcher is written against this
//! trait only, so it does not care whether the connection lives in this
//! process or behind a remote push gateway.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// Push connection id, assigned at upgrade time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh connection ID.
    ///
    /// Reconnecting clients always get a new one.
    #[must_use]
    pub fn generate() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::time::{SystemTime, UNIX_EPOCH};

        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, seq))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Failed push outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The connection no longer exists and can never be pushed to again.
    #[error("Connection gone")]
    Gone,

    /// Anything else: timeouts, transient server errors, backpressure.
    #[error("Delivery failed: {0}")]
    Other(String),
}

impl DeliveryError {
    /// Whether this failure proves the connection is dead.
    #[must_use]
    pub fn is_gone(&self) -> bool {
        matches!(self, DeliveryError::Gone)
    }
}

/// Delivers payloads to individual push connections.
#[async_trait]
pub trait PushSender: Send + Sync {
    /// Push one payload to one connection.
    ///
    /// Implementations must not retry; one call is one attempt.
    async fn push(&self, connection_id: &str, payload: Bytes) -> Result<(), DeliveryError>;

    /// Sender name for logs and metrics (e.g. "local", "http").
    fn name(&self) -> &'static str;
}
