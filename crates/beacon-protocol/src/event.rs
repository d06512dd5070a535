//! Decoded broker events as they appear on the wire.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Envelope fields appended to every decoded payload.
///
/// A payload key with one of these names is replaced by the envelope value.
pub const ENVELOPE_FIELDS: [&str; 4] = ["receivedAt", "partition", "offset", "timestamp"];

/// A broker record payload parsed as a JSON object, enriched with its
/// broker envelope.
///
/// Serializes flat: the payload's own keys sit next to `receivedAt`,
/// `partition`, `offset` and `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedEvent {
    /// The original payload fields.
    #[serde(flatten)]
    pub data: Map<String, Value>,
    /// Wall-clock time the gateway decoded the record (RFC 3339, UTC).
    pub received_at: String,
    /// Broker partition the record came from.
    pub partition: i32,
    /// Offset of the record within its partition.
    pub offset: i64,
    /// Broker timestamp in milliseconds since the epoch.
    pub timestamp: i64,
}

impl DecodedEvent {
    /// Build an event from a parsed payload and its envelope.
    #[must_use]
    pub fn new(
        mut data: Map<String, Value>,
        received_at: impl Into<String>,
        partition: i32,
        offset: i64,
        timestamp: i64,
    ) -> Self {
        for field in ENVELOPE_FIELDS {
            data.remove(field);
        }

        Self {
            data,
            received_at: received_at.into(),
            partition,
            offset,
            timestamp,
        }
    }

    /// Look up a payload field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}
