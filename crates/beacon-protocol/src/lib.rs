//! # beacon-protocol
//!
//! Wire protocol definitions for the Beacon broadcast gateway.
//!
//! Everything a push client sees travels as a JSON text frame with an
//! `action` discriminator:
//!
//! - `ping` / `pong` - Liveness check
//! - `subscribe` / `subscribed` - Acknowledged, never filtered
//! - `ack` - Generic acknowledgment for anything else
//! - `telemetry` - One broadcast cycle worth of decoded broker events
//!
//! ## Example
//!
//! ```rust
//! use beacon_protocol::{codec, ServerMessage};
//!
//! let pong = ServerMessage::pong();
//! let encoded = codec::encode(&pong).unwrap();
//! let decoded = codec::decode_server(&encoded).unwrap();
//! assert_eq!(pong, decoded);
//! ```

pub mod codec;
pub mod event;
pub mod frames;

pub use codec::{decode_control, encode, encode_telemetry, ProtocolError};
pub use event::DecodedEvent;
pub use frames::{timestamp_now, ControlAction, ControlRequest, ServerMessage};
