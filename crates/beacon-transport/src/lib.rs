//! # beacon-transport
//!
//! Push delivery layer for the Beacon broadcast gateway.
//!
//! - **LocalPushHub** - Sockets held by this process, one bounded queue each
//! - **HttpPushSender** - A remote connection-management endpoint (feature `http`)
//!
//! Both implement [`PushSender`], which classifies every failed push as
//! either [`DeliveryError::Gone`] or [`DeliveryError::Other`].
//!
//! ```rust,ignore
//! use beacon_transport::{LocalPushHub, PushSender};
//!
//! let hub = LocalPushHub::new();
//! let mut queue = hub.attach("conn_1");
//! hub.push("conn_1", payload).await?;
//! ```

pub mod hub;
pub mod traits;

#[cfg(feature = "http")]
pub mod http;

pub use hub::LocalPushHub;
pub use traits::{ConnectionId, DeliveryError, PushSender};

#[cfg(feature = "http")]
pub use http::HttpPushSender;
