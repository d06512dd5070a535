//! Control-plane and broadcast frames.
//!
//! Inbound frames carry an `action` plus arbitrary extra fields. Outbound
//! frames are a closed set tagged by `action`.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::event::DecodedEvent;

/// Message sent back for a `subscribe` request.
pub const SUBSCRIBED_MESSAGE: &str = "Subscribed to telemetry updates";

/// Message sent back for any other request.
pub const ACK_MESSAGE: &str = "Message received";

/// Current wall-clock time as an RFC 3339 string with millisecond precision.
#[must_use]
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Recognized control actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlAction {
    /// Liveness check, answered with `pong`.
    Ping,
    /// Subscription request. Acknowledged only; every connection receives
    /// every broadcast.
    Subscribe,
    /// Anything else.
    Other,
}

impl ControlAction {
    /// Classify a raw action string.
    #[must_use]
    pub fn parse(action: &str) -> Self {
        match action {
            "ping" => ControlAction::Ping,
            "subscribe" => ControlAction::Subscribe,
            _ => ControlAction::Other,
        }
    }
}

/// An inbound control message from a push client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    /// Requested action.
    pub action: String,
    /// Any additional fields the client sent.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ControlRequest {
    /// Create a request with no extra fields.
    #[must_use]
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            extra: Map::new(),
        }
    }

    /// Classify the request's action.
    #[must_use]
    pub fn kind(&self) -> ControlAction {
        ControlAction::parse(&self.action)
    }
}

/// A frame sent from the gateway to a push client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Reply to `ping`.
    Pong {
        /// Time the reply was produced.
        timestamp: String,
    },

    /// Reply to `subscribe`.
    Subscribed {
        /// Human-readable confirmation.
        message: String,
    },

    /// Reply to any other action.
    Ack {
        /// Human-readable confirmation.
        message: String,
    },

    /// One broadcast cycle.
    Telemetry {
        /// Every event decoded in the cycle, in partition order.
        events: Vec<DecodedEvent>,
        /// Time the payload was produced.
        timestamp: String,
    },
}

impl ServerMessage {
    /// Create a Pong frame stamped with the current time.
    #[must_use]
    pub fn pong() -> Self {
        ServerMessage::Pong {
            timestamp: timestamp_now(),
        }
    }

    /// Create a Subscribed frame.
    #[must_use]
    pub fn subscribed() -> Self {
        ServerMessage::Subscribed {
            message: SUBSCRIBED_MESSAGE.to_string(),
        }
    }

    /// Create an Ack frame.
    #[must_use]
    pub fn ack() -> Self {
        ServerMessage::Ack {
            message: ACK_MESSAGE.to_string(),
        }
    }

    /// Create a Telemetry frame stamped with the current time.
    #[must_use]
    pub fn telemetry(events: Vec<DecodedEvent>) -> Self {
        ServerMessage::Telemetry {
            events,
            timestamp: timestamp_now(),
        }
    }

    /// The `action` tag this frame serializes with.
    #[must_use]
    pub fn action(&self) -> &'static str {
        match self {
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::Subscribed { .. } => "subscribed",
            ServerMessage::Ack { .. } => "ack",
            ServerMessage::Telemetry { .. } => "telemetry",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_control_action_parse() {
        assert_eq!(ControlAction::parse("ping"), ControlAction::Ping);
        assert_eq!(ControlAction::parse("subscribe"), ControlAction::Subscribe);
        assert_eq!(ControlAction::parse("unsubscribe"), ControlAction::Other);
        assert_eq!(ControlAction::parse("PING"), ControlAction::Other);
    }

    #[test]
    fn test_control_request_keeps_extra_fields() {
        let req: ControlRequest =
            serde_json::from_value(json!({"action": "subscribe", "topic": "qoe"})).unwrap();
        assert_eq!(req.kind(), ControlAction::Subscribe);
        assert_eq!(req.extra["topic"], "qoe");
    }

    #[test]
    fn test_server_message_shapes() {
        let subscribed = serde_json::to_value(ServerMessage::subscribed()).unwrap();
        assert_eq!(
            subscribed,
            json!({"action": "subscribed", "message": SUBSCRIBED_MESSAGE})
        );

        let ack = serde_json::to_value(ServerMessage::ack()).unwrap();
        assert_eq!(ack, json!({"action": "ack", "message": ACK_MESSAGE}));

        let pong = serde_json::to_value(ServerMessage::pong()).unwrap();
        assert_eq!(pong["action"], "pong");
        assert!(pong["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_action_tag_matches_serialization() {
        for msg in [
            ServerMessage::pong(),
            ServerMessage::subscribed(),
            ServerMessage::ack(),
            ServerMessage::telemetry(Vec::new()),
        ] {
            let value = serde_json::to_value(&msg).unwrap();
            assert_eq!(value["action"], msg.action());
        }
    }
}
