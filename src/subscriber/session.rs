//! One subscription attempt, from dial to teardown.
//!
//! A session moves through `connecting`, `subscribing`, `live`, `draining`
//! and `closed`. While live, a spawned receive task owns the event source and
//! the sending half of a oneshot `done` channel; the foreground keeps the
//! command sink and pings on a fixed interval. A session never ends
//! successfully: it either reports why it failed or observes cancellation.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::broker::conn::BrokerError;
use crate::broker::pubsub::{CommandSink, EventSource, PubSubEvent, SubscriptionKind};
use crate::retry::with_timeout;
use crate::subscriber::provider::{Connector, SessionLink};
use crate::subscriber::{MessageHandler, StatusSender, SubscriberStatus};

/// Interval between liveness pings on a live subscription.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(60);
/// Bound on waiting for the subscription confirmation.
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on waiting for the receive task after a failed ping.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a session ended.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect: {0}")]
    Connect(#[source] BrokerError),

    #[error("failed to subscribe: {0}")]
    Subscribe(#[source] BrokerError),

    #[error("subscription receive failed: {0}")]
    Receive(#[source] BrokerError),

    #[error("liveness ping failed: {0}")]
    Ping(#[source] BrokerError),

    /// The receive task went away without reporting, e.g. the handler
    /// panicked.
    #[error("receive task stopped without reporting an error")]
    ReceiveTaskLost,
}

pub(crate) enum SessionOutcome {
    Cancelled,
    Failed(SessionError),
}

/// Per-session tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSettings {
    pub channel: String,
    pub ping_interval: Duration,
    pub subscribe_timeout: Duration,
    pub drain_timeout: Duration,
}

impl SessionSettings {
    /// Default timings for `channel`.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ping_interval: DEFAULT_PING_INTERVAL,
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Aborts the receive task when the session is left on any path.
struct ReceiveTask(JoinHandle<()>);

impl Drop for ReceiveTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs one session. `attempt` is reset to zero once the subscription is
/// confirmed.
pub(crate) async fn run_session<H: MessageHandler>(
    connector: &dyn Connector,
    settings: &SessionSettings,
    handler: &Arc<H>,
    attempt: &mut u32,
    status: &StatusSender,
    cancel: &CancellationToken,
) -> SessionOutcome {
    let channel = settings.channel.as_str();

    debug!(event = "session_connecting", channel);
    let link = tokio::select! {
        _ = cancel.cancelled() => return SessionOutcome::Cancelled,
        result = connector.connect() => match result {
            Ok(link) => link,
            Err(err) => return SessionOutcome::Failed(SessionError::Connect(err)),
        },
    };
    let SessionLink {
        mut source,
        mut sink,
        scope: _scope,
    } = link;

    debug!(event = "session_subscribing", channel);
    let subscribed = tokio::select! {
        _ = cancel.cancelled() => return SessionOutcome::Cancelled,
        result = subscribe(source.as_mut(), sink.as_mut(), settings) => result,
    };
    let early = match subscribed {
        Ok(early) => early,
        Err(err) => {
            error!(
                event = "subscribe_failed",
                channel,
                error = %err,
                "Failed to subscribe to Redis channel"
            );
            return SessionOutcome::Failed(SessionError::Subscribe(err));
        }
    };

    *attempt = 0;
    info!(event = "subscribed", channel, "Subscribed to Redis channel");
    status.send(SubscriberStatus::Subscribed {
        channel: settings.channel.clone(),
    });

    let (done_tx, mut done_rx) = oneshot::channel();
    let _receiver = ReceiveTask(tokio::spawn(receive_loop(
        source,
        early,
        Arc::clone(handler),
        done_tx,
    )));

    let mut ticker = tokio::time::interval_at(
        Instant::now() + settings.ping_interval,
        settings.ping_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(event = "session_live", channel);
    let ping_error = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(event = "session_cancelled", channel);
                return SessionOutcome::Cancelled;
            }
            _ = ticker.tick() => {
                if let Err(err) = sink.ping("").await {
                    break err;
                }
                trace!(event = "ping_sent", channel);
            }
            received = &mut done_rx => {
                let err = match received {
                    Ok(err) => SessionError::Receive(err),
                    Err(_) => SessionError::ReceiveTaskLost,
                };
                debug!(event = "session_closed", channel, error = %err);
                return SessionOutcome::Failed(err);
            }
        }
    };

    warn!(
        event = "session_draining",
        channel,
        error = %ping_error,
        "Redis ping failed, draining subscription"
    );
    let drain = async {
        if let Err(err) = sink.unsubscribe().await {
            debug!(event = "unsubscribe_failed", channel, error = %err);
        }
        done_rx.await
    };
    match with_timeout(settings.drain_timeout, drain).await {
        Ok(Ok(err)) => debug!(event = "session_drained", channel, receive_error = %err),
        Ok(Err(_)) => warn!(event = "receive_task_lost", channel),
        Err(_) => warn!(
            event = "drain_timed_out",
            channel,
            timeout_ms = settings.drain_timeout.as_millis() as u64
        ),
    }

    debug!(event = "session_closed", channel);
    SessionOutcome::Failed(SessionError::Ping(ping_error))
}

/// Subscribes and waits for the confirmation. Payloads that arrive first are
/// returned so the receive task can deliver them.
async fn subscribe(
    source: &mut dyn EventSource,
    sink: &mut dyn CommandSink,
    settings: &SessionSettings,
) -> Result<Vec<Vec<u8>>, BrokerError> {
    sink.subscribe(&settings.channel).await?;
    with_timeout(
        settings.subscribe_timeout,
        await_confirmation(source, &settings.channel),
    )
    .await
    .map_err(|_| BrokerError::Timeout {
        operation: "subscribe",
        timeout: settings.subscribe_timeout,
    })?
}

async fn await_confirmation(
    source: &mut dyn EventSource,
    channel: &str,
) -> Result<Vec<Vec<u8>>, BrokerError> {
    let mut early = Vec::new();
    loop {
        match source.receive().await? {
            PubSubEvent::Subscription {
                kind: SubscriptionKind::Subscribe,
                channel: confirmed,
                ..
            } if confirmed == channel => return Ok(early),
            PubSubEvent::Message { payload, .. } => early.push(payload),
            other => debug!(event = "pre_subscribe_event", channel, ?other),
        }
    }
}

/// Delivers `early` first, then forwards messages until the source fails.
/// The handler only ever runs on this task.
async fn receive_loop<H: MessageHandler>(
    mut source: Box<dyn EventSource>,
    early: Vec<Vec<u8>>,
    handler: Arc<H>,
    done: oneshot::Sender<BrokerError>,
) {
    if !early.is_empty() {
        debug!(event = "early_messages_replayed", count = early.len());
    }
    for payload in early {
        handler.handle_pubsub(payload);
    }
    loop {
        match source.receive().await {
            Ok(PubSubEvent::Message { channel, payload }) => {
                debug!(
                    event = "message_received",
                    channel = %channel,
                    bytes = payload.len()
                );
                handler.handle_pubsub(payload);
            }
            Ok(PubSubEvent::Subscription {
                kind,
                channel,
                active,
            }) => {
                info!(
                    event = "subscription_changed",
                    ?kind,
                    channel = %channel,
                    active
                );
            }
            Ok(PubSubEvent::Pong { .. }) => trace!(event = "pong_received"),
            Err(err) => {
                error!(
                    event = "subscription_error",
                    error = %err,
                    "Redis subscription error"
                );
                let _ = done.send(err);
                return;
            }
        }
    }
}
