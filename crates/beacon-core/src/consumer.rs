//! Batch consumption.
//!
//! A consume cycle validates required settings, decodes the batch in
//! partition order, snapshots the registry and broadcasts. Only a missing
//! setting fails the cycle; decode, registry and delivery errors are logged
//! and the batch still counts as consumed.

use beacon_protocol::DecodedEvent;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{BroadcastDispatcher, BroadcastReport};
use crate::error::ConfigurationError;
use crate::message::{batch_len, decode, RawBatch};
use crate::registry::ConnectionRegistry;

/// Settings that must be present for a cycle to run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequiredSettings {
    /// Where pushes are delivered.
    pub push_endpoint: Option<String>,
    /// Where the connection registry lives.
    pub registry_location: Option<String>,
}

impl RequiredSettings {
    /// Create settings with both values present.
    #[must_use]
    pub fn new(push_endpoint: impl Into<String>, registry_location: impl Into<String>) -> Self {
        Self {
            push_endpoint: Some(push_endpoint.into()),
            registry_location: Some(registry_location.into()),
        }
    }

    /// Check every required setting is present and non-empty.
    ///
    /// # Errors
    ///
    /// Returns the first missing setting.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let present = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.trim().is_empty());

        if !present(&self.push_endpoint) {
            return Err(ConfigurationError::Missing("push_endpoint"));
        }
        if !present(&self.registry_location) {
            return Err(ConfigurationError::Missing("registry_location"));
        }
        Ok(())
    }
}

/// Result of one consume cycle.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Events decoded from the batch, in partition order.
    pub events: Vec<DecodedEvent>,
    /// Records dropped because they could not be decoded.
    pub dropped: usize,
    /// Connections in the registry snapshot.
    pub connections: usize,
    /// Fan-out result.
    pub report: BroadcastReport,
}

/// Consumes broker batches and hands them to the dispatcher.
pub struct BrokerConsumer {
    settings: RequiredSettings,
    registry: Arc<dyn ConnectionRegistry>,
    dispatcher: BroadcastDispatcher,
}

impl BrokerConsumer {
    /// Create a consumer.
    #[must_use]
    pub fn new(
        settings: RequiredSettings,
        registry: Arc<dyn ConnectionRegistry>,
        dispatcher: BroadcastDispatcher,
    ) -> Self {
        Self {
            settings,
            registry,
            dispatcher,
        }
    }

    /// Run one consume cycle over a batch.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] if a required setting is missing. The
    /// caller must not commit the batch in that case.
    pub async fn consume(&self, batch: &RawBatch) -> Result<BatchOutcome, ConfigurationError> {
        self.settings.validate().map_err(|e| {
            error!(error = %e, "Refusing batch");
            e
        })?;

        let start = Instant::now();
        let records = batch_len(batch);
        let events = decode_batch(batch);
        let dropped = records - events.len();

        let mut outcome = BatchOutcome {
            dropped,
            ..BatchOutcome::default()
        };

        if !events.is_empty() {
            match self.registry.list_active().await {
                Ok(connections) => {
                    outcome.connections = connections.len();
                    outcome.report = self.dispatcher.broadcast(&events, &connections).await;
                }
                Err(e) => {
                    warn!(error = %e, "Registry snapshot failed, skipping broadcast");
                }
            }
        }

        info!(
            partitions = batch.len(),
            records,
            events = events.len(),
            dropped,
            connections = outcome.connections,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Batch consumed"
        );

        outcome.events = events;
        Ok(outcome)
    }
}

/// Decode every record in a batch, partition by partition.
///
/// Records that fail to decode are logged and skipped.
#[must_use]
pub fn decode_batch(batch: &RawBatch) -> Vec<DecodedEvent> {
    let mut events = Vec::with_capacity(batch_len(batch));

    for (partition, messages) in batch {
        for message in messages {
            match decode(message) {
                Ok(event) => events.push(event),
                Err(e) => {
                    warn!(
                        partition = %partition,
                        offset = message.offset,
                        error = %e,
                        "Dropping undecodable record"
                    );
                }
            }
        }
        debug!(partition = %partition, records = messages.len(), "Partition decoded");
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{group_by_partition, BrokerMessage};

    fn record(partition: i32, offset: i64, payload: &'static [u8]) -> BrokerMessage {
        BrokerMessage::new("telemetry", partition, offset, 0, payload)
    }

    #[test]
    fn test_settings_validation() {
        assert!(RequiredSettings::new("wss://push", "memory").validate().is_ok());

        assert_eq!(
            RequiredSettings::default().validate(),
            Err(ConfigurationError::Missing("push_endpoint"))
        );

        let settings = RequiredSettings {
            push_endpoint: Some("wss://push".to_string()),
            registry_location: Some("  ".to_string()),
        };
        assert_eq!(
            settings.validate(),
            Err(ConfigurationError::Missing("registry_location"))
        );
    }

    #[test]
    fn test_decode_batch_skips_bad_records() {
        let batch = group_by_partition(vec![
            record(0, 1, br#"{"n":1}"#),
            record(0, 2, b"{oops"),
            record(0, 3, br#"{"n":3}"#),
        ]);

        let offsets: Vec<i64> = decode_batch(&batch).iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![1, 3]);
    }

    #[test]
    fn test_decode_batch_preserves_partition_order() {
        let batch = group_by_partition(vec![
            record(1, 10, br#"{"n":10}"#),
            record(0, 20, br#"{"n":20}"#),
            record(1, 11, br#"{"n":11}"#),
            record(0, 21, br#"{"n":21}"#),
        ]);

        let events = decode_batch(&batch);
        let p0: Vec<i64> = events.iter().filter(|e| e.partition == 0).map(|e| e.offset).collect();
        let p1: Vec<i64> = events.iter().filter(|e| e.partition == 1).map(|e| e.offset).collect();
        assert_eq!(p0, vec![20, 21]);
        assert_eq!(p1, vec![10, 11]);
    }
}
