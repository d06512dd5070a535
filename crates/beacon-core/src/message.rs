//! Broker records and their decoding.

use beacon_protocol::{timestamp_now, DecodedEvent};
use bytes::Bytes;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// A raw record as delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Topic the record was read from.
    pub topic: String,
    /// Partition within the topic.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Broker timestamp in milliseconds since the epoch.
    pub timestamp: i64,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl BrokerMessage {
    /// Create a broker message.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        timestamp: i64,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            timestamp,
            payload: payload.into(),
        }
    }

    /// Key of the partition this record belongs to (`{topic}-{partition}`).
    #[must_use]
    pub fn partition_key(&self) -> String {
        format!("{}-{}", self.topic, self.partition)
    }
}

/// One micro-batch: partition key to records in partition order.
pub type RawBatch = BTreeMap<String, Vec<BrokerMessage>>;

/// Group records into a batch, keeping arrival order within each partition.
#[must_use]
pub fn group_by_partition(messages: impl IntoIterator<Item = BrokerMessage>) -> RawBatch {
    let mut batch = RawBatch::new();
    for message in messages {
        batch
            .entry(message.partition_key())
            .or_default()
            .push(message);
    }
    batch
}

/// Total number of records in a batch.
#[must_use]
pub fn batch_len(batch: &RawBatch) -> usize {
    batch.values().map(Vec::len).sum()
}

/// Why a record could not become an event.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Payload is not valid UTF-8 JSON.
    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload is JSON but not an object.
    #[error("Payload is not a JSON object")]
    NotAnObject,
}

/// Decode a record, stamping it with the current time.
///
/// # Errors
///
/// Returns an error if the payload is not a JSON object.
pub fn decode(message: &BrokerMessage) -> Result<DecodedEvent, DecodeError> {
    decode_at(message, timestamp_now())
}

/// Decode a record with an explicit receive time.
///
/// # Errors
///
/// Returns an error if the payload is not a JSON object.
pub fn decode_at(
    message: &BrokerMessage,
    received_at: impl Into<String>,
) -> Result<DecodedEvent, DecodeError> {
    match serde_json::from_slice::<Value>(&message.payload)? {
        Value::Object(data) => Ok(DecodedEvent::new(
            data,
            received_at,
            message.partition,
            message.offset,
            message.timestamp,
        )),
        _ => Err(DecodeError::NotAnObject),
    }
}
