//! Resilient Redis pub/sub subscriber.
//!
//! The crate keeps a single subscription to one channel alive, forwarding
//! every published payload to a [`MessageHandler`]:
//! - `broker`: RESP transport, pub/sub primitives, sentinel discovery, and
//!   the master connection pool.
//! - `config`: inbound settings and their validation.
//! - `subscriber`: session loop and reconnect supervisor.
//! - `retry`: reconnect backoff and timeout utilities.

/// Broker transport, discovery, and pooling.
pub mod broker;
/// Subscriber configuration.
pub mod config;
/// Reconnect backoff and timeout helpers.
pub mod retry;
/// Session loop and reconnect supervisor.
pub mod subscriber;

pub use config::{ConfigError, ConnectionMode, SubscriberConfig};
pub use retry::{next_retry_delay, ReconnectPolicy};
pub use subscriber::{
    MessageHandler, SessionError, Subscriber, SubscriberError, SubscriberStatus,
};
