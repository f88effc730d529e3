//! Pub/sub commands and event classification.
//!
//! Once a connection has issued `SUBSCRIBE` every reply it produces is a push
//! frame. [`PubSubEvent::from_value`] turns those frames into typed events;
//! [`EventSource`] and [`CommandSink`] are the two halves a session drives.

use async_trait::async_trait;

use crate::broker::conn::{BrokerError, ConnectionReader, ConnectionWriter};
use crate::broker::resp::Value;

/// Direction of a subscription confirmation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionKind {
    Subscribe,
    Unsubscribe,
}

/// Event received on a subscribed connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PubSubEvent {
    /// Published payload for a subscribed channel.
    Message { channel: String, payload: Vec<u8> },
    /// Confirmation of a `SUBSCRIBE` or `UNSUBSCRIBE`.
    Subscription {
        kind: SubscriptionKind,
        channel: String,
        /// Number of channels the connection is subscribed to afterwards.
        active: i64,
    },
    /// Reply to a liveness `PING`.
    Pong { data: Vec<u8> },
}

impl PubSubEvent {
    /// Classifies a raw reply read from a subscribed connection.
    pub fn from_value(value: Value) -> Result<Self, BrokerError> {
        let items = match value {
            Value::Array(items) => items,
            Value::Simple(status) if status.eq_ignore_ascii_case("PONG") => {
                return Ok(Self::Pong { data: Vec::new() })
            }
            Value::Error(message) => return Err(BrokerError::Server(message)),
            other => {
                return Err(BrokerError::Protocol(format!(
                    "unexpected pub/sub reply: {other:?}"
                )))
            }
        };

        let mut items = items.into_iter();
        let kind = items
            .next()
            .and_then(|kind| kind.as_str().map(str::to_ascii_lowercase))
            .ok_or_else(|| BrokerError::Protocol("pub/sub reply without a kind".to_string()))?;

        match kind.as_str() {
            "message" => {
                let channel = text_item(items.next(), "message channel")?;
                let payload = match items.next() {
                    Some(Value::Bulk(payload)) => payload,
                    Some(Value::Simple(text)) => text.into_bytes(),
                    other => {
                        return Err(BrokerError::Protocol(format!(
                            "message without payload: {other:?}"
                        )))
                    }
                };
                Ok(Self::Message { channel, payload })
            }
            "subscribe" | "unsubscribe" => {
                let subscription_kind = if kind == "subscribe" {
                    SubscriptionKind::Subscribe
                } else {
                    SubscriptionKind::Unsubscribe
                };
                let channel = match items.next() {
                    Some(Value::Nil) | None => String::new(),
                    other => text_item(other, "subscription channel")?,
                };
                let active = match items.next() {
                    Some(Value::Integer(active)) => active,
                    other => {
                        return Err(BrokerError::Protocol(format!(
                            "subscription without channel count: {other:?}"
                        )))
                    }
                };
                Ok(Self::Subscription {
                    kind: subscription_kind,
                    channel,
                    active,
                })
            }
            "pong" => {
                let data = items
                    .next()
                    .and_then(|data| data.as_bytes().map(<[u8]>::to_vec))
                    .unwrap_or_default();
                Ok(Self::Pong { data })
            }
            other => Err(BrokerError::Protocol(format!(
                "unsupported pub/sub event kind {other:?}"
            ))),
        }
    }
}

fn text_item(value: Option<Value>, what: &str) -> Result<String, BrokerError> {
    value
        .as_ref()
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BrokerError::Protocol(format!("missing {what}: {value:?}")))
}

/// Receiving side of a subscribed connection.
#[async_trait]
pub trait EventSource: Send {
    /// Waits for the next event; an error ends the subscription.
    async fn receive(&mut self) -> Result<PubSubEvent, BrokerError>;
}

/// Sending side of a subscribed connection.
///
/// Commands are written and flushed; their confirmations arrive through the
/// paired [`EventSource`].
#[async_trait]
pub trait CommandSink: Send {
    async fn subscribe(&mut self, channel: &str) -> Result<(), BrokerError>;

    /// Unsubscribes from every channel.
    async fn unsubscribe(&mut self) -> Result<(), BrokerError>;

    async fn ping(&mut self, data: &str) -> Result<(), BrokerError>;
}

#[async_trait]
impl EventSource for ConnectionReader {
    async fn receive(&mut self) -> Result<PubSubEvent, BrokerError> {
        let value = self.read_value().await?;
        PubSubEvent::from_value(value)
    }
}

#[async_trait]
impl CommandSink for ConnectionWriter {
    async fn subscribe(&mut self, channel: &str) -> Result<(), BrokerError> {
        self.send(&["SUBSCRIBE", channel]).await
    }

    async fn unsubscribe(&mut self) -> Result<(), BrokerError> {
        self.send(&["UNSUBSCRIBE"]).await
    }

    async fn ping(&mut self, data: &str) -> Result<(), BrokerError> {
        self.send(&["PING", data]).await
    }
}
