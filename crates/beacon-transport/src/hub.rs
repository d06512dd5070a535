//! In-process push delivery to WebSocket sessions.
//!
//! Each live socket attaches a bounded queue to the hub under its
//! connection id. The socket task drains the queue onto the wire. A push
//! to an id with no attached queue, or whose socket task has exited, is
//! reported as [`DeliveryError::Gone`].

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

use crate::traits::{DeliveryError, PushSender};

/// Default per-session queue capacity.
pub const DEFAULT_SESSION_CAPACITY: usize = 256;

/// Routes pushes to sockets owned by this process.
#[derive(Debug)]
pub struct LocalPushHub {
    sessions: DashMap<String, mpsc::Sender<Bytes>>,
    capacity: usize,
}

impl LocalPushHub {
    /// Create a hub with the default session capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SESSION_CAPACITY)
    }

    /// Create a hub with a specific per-session queue capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Attach a session and return the receiving end of its queue.
    ///
    /// Attaching an id that is already attached replaces the old queue.
    pub fn attach(&self, connection_id: impl Into<String>) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let connection_id = connection_id.into();
        debug!(connection = %connection_id, "Session attached");
        self.sessions.insert(connection_id, tx);
        rx
    }

    /// Detach a session.
    ///
    /// Returns `true` if the session was attached.
    pub fn detach(&self, connection_id: &str) -> bool {
        let removed = self.sessions.remove(connection_id).is_some();
        if removed {
            debug!(connection = %connection_id, "Session detached");
        }
        removed
    }

    /// Check if a session is attached.
    #[must_use]
    pub fn is_attached(&self, connection_id: &str) -> bool {
        self.sessions.contains_key(connection_id)
    }

    /// Number of attached sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for LocalPushHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushSender for LocalPushHub {
    async fn push(&self, connection_id: &str, payload: Bytes) -> Result<(), DeliveryError> {
        let sender = match self.sessions.get(connection_id) {
            Some(entry) => entry.value().clone(),
            None => return Err(DeliveryError::Gone),
        };

        match sender.try_send(payload) {
            Ok(()) => {
                trace!(connection = %connection_id, "Queued push");
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(DeliveryError::Other(
                "session queue full".to_string(),
            )),
            Err(TrySendError::Closed(_)) => {
                self.sessions
                    .remove_if(connection_id, |_, tx| tx.is_closed());
                Err(DeliveryError::Gone)
            }
        }
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
