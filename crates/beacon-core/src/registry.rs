//! Connection registry.
//!
//! The registry records which push connections are presumed reachable.
//! Operations on different ids never conflict and there is no locking
//! across operations; a register/deregister race on one id is last writer
//! wins. Snapshots are allowed to be stale: dead entries are pruned by the
//! dispatcher when a push comes back gone.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::RegistryError;

/// How long a registration lives without being refreshed.
pub const REGISTRATION_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// A registered push connection.
///
/// Field names match the persisted schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    /// Primary key.
    pub connection_id: String,
    /// Display identity derived at connect time.
    pub user_id: String,
    /// Registration time (RFC 3339).
    pub connected_at: String,
    /// Absolute expiry, seconds since the epoch.
    pub ttl: i64,
}

impl ConnectionRecord {
    /// Create a record registered at `now` that expires after `ttl`.
    #[must_use]
    pub fn new(
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            connected_at: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            ttl: now.timestamp() + ttl.as_secs() as i64,
        }
    }

    /// Whether the record is past its expiry at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl <= now.timestamp()
    }
}

/// Store of active push connections.
#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    /// Insert or overwrite the record for `connection_id`.
    async fn register(&self, connection_id: &str, user_id: &str) -> Result<(), RegistryError>;

    /// Delete the record for `connection_id`. Absence is success.
    async fn deregister(&self, connection_id: &str) -> Result<(), RegistryError>;

    /// Snapshot of every record. May include connections that have
    /// already closed.
    async fn list_active(&self) -> Result<Vec<ConnectionRecord>, RegistryError>;
}

/// In-memory registry.
#[derive(Debug)]
pub struct MemoryRegistry {
    records: DashMap<String, ConnectionRecord>,
    ttl: Duration,
}

impl MemoryRegistry {
    /// Create an empty registry with the standard two hour TTL.
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(REGISTRATION_TTL)
    }

    /// Create an empty registry with a custom TTL.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            ttl,
        }
    }

    /// Register a connection as of `now`.
    pub fn register_at(&self, connection_id: &str, user_id: &str, now: DateTime<Utc>) {
        let record = ConnectionRecord::new(connection_id, user_id, now, self.ttl);
        debug!(connection = %connection_id, user = %user_id, ttl = record.ttl, "Registered");
        self.records.insert(connection_id.to_string(), record);
    }

    /// Get a single record.
    #[must_use]
    pub fn get(&self, connection_id: &str) -> Option<ConnectionRecord> {
        self.records.get(connection_id).map(|r| r.clone())
    }

    /// Check if a connection is registered.
    #[must_use]
    pub fn contains(&self, connection_id: &str) -> bool {
        self.records.contains_key(connection_id)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove records whose TTL has passed.
    ///
    /// Returns the removed connection IDs.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let candidates: Vec<String> = self
            .records
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        // Re-check on removal: an id may have been re-registered since the scan.
        candidates
            .into_iter()
            .filter(|id| {
                let removed = self
                    .records
                    .remove_if(id, |_, record| record.is_expired(now))
                    .is_some();
                if removed {
                    debug!(connection = %id, "Swept expired registration");
                }
                removed
            })
            .collect()
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionRegistry for MemoryRegistry {
    async fn register(&self, connection_id: &str, user_id: &str) -> Result<(), RegistryError> {
        self.register_at(connection_id, user_id, Utc::now());
        Ok(())
    }

    async fn deregister(&self, connection_id: &str) -> Result<(), RegistryError> {
        if self.records.remove(connection_id).is_some() {
            debug!(connection = %connection_id, "Deregistered");
        }
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<ConnectionRecord>, RegistryError> {
        Ok(self.records.iter().map(|r| r.value().clone()).collect())
    }
}
