//! Broker transport modules.
//!
//! - `resp`: RESP2 values and framing.
//! - `conn`: TCP connections, URL parsing, and the transport error type.
//! - `pubsub`: subscribed-connection events and the send/receive seams.
//! - `sentinel`: master discovery and role checks.
//! - `pool`: bounded connection pool with borrow-time validation.

/// Connections, dial options, and broker errors.
pub mod conn;
/// Bounded connection pool.
pub mod pool;
/// Pub/sub event classification and transport seams.
pub mod pubsub;
/// RESP2 wire format.
pub mod resp;
/// Sentinel discovery.
pub mod sentinel;

#[cfg(test)]
pub(crate) mod mock;

pub use conn::{BrokerError, Connection, DialOptions, RedisUrl};
pub use pubsub::{CommandSink, EventSource, PubSubEvent, SubscriptionKind};
