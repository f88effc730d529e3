//! In-memory broker links for session and supervisor tests.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::broker::conn::BrokerError;
use crate::broker::pubsub::{CommandSink, EventSource, PubSubEvent, SubscriptionKind};
use crate::subscriber::provider::{Connector, SessionLink};

type EventTx = mpsc::UnboundedSender<Result<PubSubEvent, BrokerError>>;
type EventRx = mpsc::UnboundedReceiver<Result<PubSubEvent, BrokerError>>;

#[derive(Clone, Copy)]
enum Behavior {
    /// Confirms subscriptions and stays up.
    Healthy,
    /// Never confirms the subscription.
    Silent,
    /// Confirms, then reports a dropped connection.
    DropAfterSubscribe,
}

/// Test-side handle on one fake connection.
#[derive(Clone)]
pub(crate) struct FakeRemote {
    events: EventTx,
    commands: Arc<Mutex<Vec<String>>>,
    ping_fails: Arc<AtomicBool>,
    ping_failure_disconnects: Arc<AtomicBool>,
}

impl FakeRemote {
    pub(crate) fn publish(&self, channel: &str, payload: &[u8]) {
        let _ = self.events.send(Ok(PubSubEvent::Message {
            channel: channel.to_string(),
            payload: payload.to_vec(),
        }));
    }

    /// Makes the receive side fail as if the socket was reset.
    pub(crate) fn disconnect(&self) {
        let _ = self.events.send(Err(BrokerError::Closed));
    }

    /// Pings fail and the read side sees the connection drop.
    pub(crate) fn fail_pings(&self) {
        self.ping_failure_disconnects.store(true, Ordering::SeqCst);
        self.ping_fails.store(true, Ordering::SeqCst);
    }

    /// Pings fail while the read side stays blocked.
    pub(crate) fn fail_pings_silently(&self) {
        self.ping_fails.store(true, Ordering::SeqCst);
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .map(|commands| commands.clone())
            .unwrap_or_default()
    }

    pub(crate) fn ping_count(&self) -> usize {
        self.commands()
            .iter()
            .filter(|command| command.starts_with("PING"))
            .count()
    }
}

struct FakeSource {
    events: EventRx,
}

#[async_trait]
impl EventSource for FakeSource {
    async fn receive(&mut self) -> Result<PubSubEvent, BrokerError> {
        match self.events.recv().await {
            Some(event) => event,
            None => Err(BrokerError::Closed),
        }
    }
}

struct FakeSink {
    remote: FakeRemote,
    behavior: Behavior,
}

impl FakeSink {
    fn record(&self, command: String) {
        if let Ok(mut commands) = self.remote.commands.lock() {
            commands.push(command);
        }
    }
}

fn broken_pipe() -> BrokerError {
    BrokerError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "fake socket closed"))
}

#[async_trait]
impl CommandSink for FakeSink {
    async fn subscribe(&mut self, channel: &str) -> Result<(), BrokerError> {
        self.record(format!("SUBSCRIBE {channel}"));
        if matches!(self.behavior, Behavior::Silent) {
            return Ok(());
        }
        let _ = self.remote.events.send(Ok(PubSubEvent::Subscription {
            kind: SubscriptionKind::Subscribe,
            channel: channel.to_string(),
            active: 1,
        }));
        if matches!(self.behavior, Behavior::DropAfterSubscribe) {
            self.remote.disconnect();
        }
        Ok(())
    }

    async fn unsubscribe(&mut self) -> Result<(), BrokerError> {
        self.record("UNSUBSCRIBE".to_string());
        if self.remote.ping_fails.load(Ordering::SeqCst) {
            return Err(broken_pipe());
        }
        Ok(())
    }

    async fn ping(&mut self, data: &str) -> Result<(), BrokerError> {
        self.record(format!("PING {data}").trim_end().to_string());
        if !self.remote.ping_fails.load(Ordering::SeqCst) {
            let _ = self.remote.events.send(Ok(PubSubEvent::Pong {
                data: data.as_bytes().to_vec(),
            }));
            return Ok(());
        }
        if self.remote.ping_failure_disconnects.load(Ordering::SeqCst) {
            self.remote.disconnect();
        }
        Err(broken_pipe())
    }
}

struct FakeLink {
    remote: FakeRemote,
    events: EventRx,
    behavior: Behavior,
}

impl FakeLink {
    fn into_session_link(self) -> SessionLink {
        SessionLink::new(
            Box::new(FakeSource {
                events: self.events,
            }),
            Box::new(FakeSink {
                remote: self.remote,
                behavior: self.behavior,
            }),
        )
    }
}

/// Connector replaying a script of dial outcomes.
///
/// Once the script runs out every dial is refused.
#[derive(Default)]
pub(crate) struct FakeConnector {
    script: Mutex<VecDeque<Option<FakeLink>>>,
    calls: AtomicUsize,
}

impl FakeConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fail_next(&self, dials: usize) {
        if let Ok(mut script) = self.script.lock() {
            script.extend((0..dials).map(|_| None));
        }
    }

    pub(crate) fn accept_next(&self) -> FakeRemote {
        self.push_link(Behavior::Healthy)
    }

    pub(crate) fn accept_next_silent(&self) -> FakeRemote {
        self.push_link(Behavior::Silent)
    }

    pub(crate) fn accept_next_then_drop(&self) -> FakeRemote {
        self.push_link(Behavior::DropAfterSubscribe)
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn push_link(&self, behavior: Behavior) -> FakeRemote {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let remote = FakeRemote {
            events: events_tx,
            commands: Arc::new(Mutex::new(Vec::new())),
            ping_fails: Arc::new(AtomicBool::new(false)),
            ping_failure_disconnects: Arc::new(AtomicBool::new(false)),
        };
        let link = FakeLink {
            remote: remote.clone(),
            events: events_rx,
            behavior,
        };
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Some(link));
        }
        remote
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<SessionLink, BrokerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .flatten();
        match next {
            Some(link) => Ok(link.into_session_link()),
            None => Err(BrokerError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "fake broker refused the dial",
            ))),
        }
    }
}
