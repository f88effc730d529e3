//! Resilient channel subscription.
//!
//! - `provider` opens one broker link per session, directly or through
//!   sentinels.
//! - `session` runs a single subscription until it fails or is cancelled.
//! - `supervisor` owns the reconnect loop, attempt counter, and ceiling.

use std::time::Duration;

use tokio::sync::mpsc;

pub mod provider;
pub mod session;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod fake;

pub use provider::{Connector, DirectConnector, SentinelConnector, SentinelScope, SessionLink};
pub use session::{SessionError, SessionSettings};
pub use supervisor::{Subscriber, SubscriberError};

/// Downstream consumer of published payloads.
///
/// Called from the session's receive task, once per message, in receive
/// order. A handler that blocks stalls the subscription.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle_pubsub(&self, payload: Vec<u8>);
}

impl<F> MessageHandler for F
where
    F: Fn(Vec<u8>) + Send + Sync + 'static,
{
    fn handle_pubsub(&self, payload: Vec<u8>) {
        self(payload)
    }
}

/// Lifecycle updates produced by the reconnect loop.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SubscriberStatus {
    /// Subscription confirmed; the attempt counter was reset.
    Subscribed { channel: String },
    /// A session ended; `attempt` is the counter after the increment.
    SessionFailed { attempt: u32, error: String },
    /// Backoff sleep started.
    RetryScheduled { attempt: u32, delay: Duration },
    /// Backoff finished, a new session is starting.
    Reconnecting { attempt: u32 },
    /// Retry ceiling reached; the subscriber is terminated.
    Exhausted { attempts: u32 },
}

/// Optional status sink; sends are dropped when nobody listens.
#[derive(Clone, Debug, Default)]
pub(crate) struct StatusSender(Option<mpsc::UnboundedSender<SubscriberStatus>>);

impl StatusSender {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<SubscriberStatus>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(Some(tx)), rx)
    }

    pub(crate) fn send(&self, status: SubscriberStatus) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(status);
        }
    }
}
