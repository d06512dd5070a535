//! JSON codec for Beacon frames.
//!
//! Frames are plain UTF-8 JSON documents, one per WebSocket text message.
//! There is no length prefix; the transport delimits messages.

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

use crate::event::DecodedEvent;
use crate::frames::{timestamp_now, ControlRequest, ServerMessage};

/// Maximum accepted size of an inbound control frame (32 KiB).
pub const MAX_CONTROL_FRAME_SIZE: usize = 32 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Inbound frame exceeds the control frame limit.
    #[error("Frame size {0} exceeds maximum {MAX_CONTROL_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Borrowing view of a telemetry frame so a cycle's events are serialized
/// without cloning them.
#[derive(Serialize)]
struct TelemetryFrame<'a> {
    action: &'static str,
    events: &'a [DecodedEvent],
    timestamp: String,
}

/// Encode a server frame to bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(message: &ServerMessage) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

/// Encode a telemetry frame for a batch of events, stamped with the current time.
///
/// Produces the same document as encoding [`ServerMessage::Telemetry`].
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_telemetry(events: &[DecodedEvent]) -> Result<Bytes, ProtocolError> {
    let frame = TelemetryFrame {
        action: "telemetry",
        events,
        timestamp: timestamp_now(),
    };
    Ok(Bytes::from(serde_json::to_vec(&frame)?))
}

/// Decode an inbound control frame.
///
/// # Errors
///
/// Returns an error if the frame is too large, is not JSON, or has no
/// string `action` field.
pub fn decode_control(data: &[u8]) -> Result<ControlRequest, ProtocolError> {
    if data.len() > MAX_CONTROL_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }
    Ok(serde_json::from_slice(data)?)
}

/// Decode a frame produced by the gateway.
///
/// Used by clients and tests.
///
/// # Errors
///
/// Returns an error if the data is not a valid server frame.
pub fn decode_server(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
    Ok(serde_json::from_slice(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::ControlAction;
    use serde_json::{json, Map};

    fn event(offset: i64) -> DecodedEvent {
        let mut data = Map::new();
        data.insert("deviceId".to_string(), json!("stb-1"));
        DecodedEvent::new(data, "2025-01-01T00:00:00.000Z", 0, offset, 0)
    }

    #[test]
    fn test_telemetry_matches_server_message() {
        let events = vec![event(1), event(2)];
        let encoded = encode_telemetry(&events).unwrap();

        match decode_server(&encoded).unwrap() {
            ServerMessage::Telemetry {
                events: decoded, ..
            } => assert_eq!(decoded, events),
            other => panic!("Expected Telemetry, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_control() {
        let req = decode_control(br#"{"action":"ping"}"#).unwrap();
        assert_eq!(req.kind(), ControlAction::Ping);
    }

    #[test]
    fn test_decode_control_rejects_garbage() {
        assert!(matches!(
            decode_control(b"not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            decode_control(br#"{"type":"ping"}"#),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_control_frame_too_large() {
        let mut big = br#"{"action":"ping","pad":""#.to_vec();
        big.extend(std::iter::repeat(b'a').take(MAX_CONTROL_FRAME_SIZE));
        big.extend_from_slice(br#""}"#);

        match decode_control(&big) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }
}
