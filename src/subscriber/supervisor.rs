//! Reconnect loop around sessions.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::broker::pool::PoolConfig;
use crate::config::{ConfigError, SubscriberConfig};
use crate::retry::ReconnectPolicy;
use crate::subscriber::provider::{connector_for, Connector};
use crate::subscriber::session::{run_session, SessionError, SessionOutcome, SessionSettings};
use crate::subscriber::{MessageHandler, StatusSender, SubscriberStatus};

/// Terminal subscriber errors.
#[derive(Debug, Error)]
pub enum SubscriberError {
    #[error("invalid subscriber configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("giving up after {attempts} consecutive failed sessions: {last_error}")]
    ReconnectAttemptsExceeded {
        attempts: u32,
        #[source]
        last_error: SessionError,
    },

    #[error("subscriber already terminated after exhausting reconnect attempts")]
    Terminated,
}

/// Keeps one channel subscription alive across broker failures.
///
/// Every failed session increments the attempt counter and a confirmed
/// subscription resets it. Once [`ReconnectPolicy::max_attempts`] consecutive
/// failures accumulate the subscriber stops for good.
pub struct Subscriber<H: MessageHandler> {
    config: SubscriberConfig,
    handler: Arc<H>,
    settings: SessionSettings,
    policy: ReconnectPolicy,
    pool_config: PoolConfig,
    connector: Option<Arc<dyn Connector>>,
    status: StatusSender,
    reconnect_attempt: u32,
    terminated: bool,
}

impl<H: MessageHandler> Subscriber<H> {
    /// Creates a subscriber for `config`. Nothing is validated or dialed
    /// until [`Subscriber::run`].
    pub fn new(config: SubscriberConfig, handler: H) -> Self {
        let settings = SessionSettings::new(config.channel.clone());
        Self {
            config,
            handler: Arc::new(handler),
            settings,
            policy: ReconnectPolicy::default(),
            pool_config: PoolConfig::default(),
            connector: None,
            status: StatusSender::default(),
            reconnect_attempt: 0,
            terminated: false,
        }
    }

    /// Interval between liveness pings while subscribed.
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.settings.ping_interval = interval;
        self
    }

    /// Bound on waiting for the subscription confirmation.
    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.settings.subscribe_timeout = timeout;
        self
    }

    /// Bound on waiting for the receive task after a failed ping.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.settings.drain_timeout = timeout;
        self
    }

    /// Retry ceiling and backoff unit.
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Pool limits used for master connections in sentinel mode.
    pub fn with_pool_config(mut self, pool_config: PoolConfig) -> Self {
        self.pool_config = pool_config;
        self
    }

    /// Replaces the connector derived from the configuration.
    ///
    /// The configuration is still validated before the first session.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Returns a receiver for lifecycle updates, replacing any earlier one.
    pub fn status_channel(&mut self) -> mpsc::UnboundedReceiver<SubscriberStatus> {
        let (status, rx) = StatusSender::channel();
        self.status = status;
        rx
    }

    /// Consecutive failed sessions since the last confirmed subscription.
    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt
    }

    /// Whether the retry ceiling was reached. A terminated subscriber never
    /// runs again.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Runs until the retry ceiling is reached or the configuration is
    /// rejected. Never returns `Ok`.
    pub async fn start(&mut self) -> Result<(), SubscriberError> {
        self.run(CancellationToken::new()).await
    }

    /// Like [`Subscriber::start`], but returns `Ok(())` once `cancel` fires.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), SubscriberError> {
        if self.terminated {
            return Err(SubscriberError::Terminated);
        }

        let mode = self.config.validate()?;
        let connector = match &self.connector {
            Some(connector) => Arc::clone(connector),
            None => connector_for(mode, self.pool_config.clone()),
        };

        loop {
            let outcome = run_session(
                connector.as_ref(),
                &self.settings,
                &self.handler,
                &mut self.reconnect_attempt,
                &self.status,
                &cancel,
            )
            .await;

            let err = match outcome {
                SessionOutcome::Cancelled => {
                    info!(event = "subscriber_cancelled", channel = %self.settings.channel);
                    return Ok(());
                }
                SessionOutcome::Failed(err) => err,
            };

            error!(
                event = "redis_connection_failed",
                channel = %self.settings.channel,
                error = %err,
                "Redis connection failed"
            );
            self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
            let attempt = self.reconnect_attempt;
            self.status.send(SubscriberStatus::SessionFailed {
                attempt,
                error: err.to_string(),
            });

            if self.policy.is_exhausted(attempt) {
                self.terminated = true;
                error!(
                    event = "reconnect_attempts_exceeded",
                    attempts = attempt,
                    "Max Redis reconnect attempts reached"
                );
                self.status
                    .send(SubscriberStatus::Exhausted { attempts: attempt });
                return Err(SubscriberError::ReconnectAttemptsExceeded {
                    attempts: attempt,
                    last_error: err,
                });
            }

            let delay = self.policy.delay_for_attempt(attempt);
            info!(
                event = "reconnect_scheduled",
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Next Redis reconnect attempt in {delay:?}"
            );
            self.status
                .send(SubscriberStatus::RetryScheduled { attempt, delay });

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(event = "subscriber_cancelled", channel = %self.settings.channel);
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }

            info!(event = "reconnecting", attempt, "Reconnecting to Redis...");
            self.status.send(SubscriberStatus::Reconnecting { attempt });
        }
    }
}
