//! # beacon-core
//!
//! Connection registry, batch consumption and broadcast fan-out for the
//! Beacon gateway.
//!
//! - **ConnectionRegistry** - Which push connections are presumed reachable
//! - **BrokerConsumer** - Decodes a broker batch and triggers one broadcast
//! - **BroadcastDispatcher** - Concurrent fan-out that prunes gone connections
//! - **ConnectionLifecycleHandler** - Connect, disconnect and control events
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌────────────────┐     ┌─────────────────────┐
//! │   Broker    │────▶│ BrokerConsumer │────▶│ BroadcastDispatcher │
//! └─────────────┘     └────────────────┘     └─────────────────────┘
//!                             │                   │            │
//!                             ▼ snapshot   prune  ▼            ▼ push
//!                     ┌───────────────────────────────┐  ┌────────────┐
//!                     │      ConnectionRegistry       │  │ PushSender │
//!                     └───────────────────────────────┘  └────────────┘
//!                                     ▲
//!                                     │ register / deregister
//!                          ┌────────────────────────────┐
//!                          │ ConnectionLifecycleHandler │
//!                          └────────────────────────────┘
//! ```

pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod message;
pub mod registry;

pub use consumer::{decode_batch, BatchOutcome, BrokerConsumer, RequiredSettings};
pub use dispatcher::{BroadcastDispatcher, BroadcastReport};
pub use error::{ConfigurationError, RegistryError};
pub use lifecycle::{ConnectionLifecycleHandler, ConnectionState, DisconnectAck, Session};
pub use message::{batch_len, decode, decode_at, group_by_partition, BrokerMessage, DecodeError, RawBatch};
pub use registry::{ConnectionRecord, ConnectionRegistry, MemoryRegistry, REGISTRATION_TTL};
