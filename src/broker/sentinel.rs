//! Sentinel-based master discovery and role checks.
//!
//! The client keeps its sentinel list ordered by recent success: the sentinel
//! that last answered is asked first next time, and its connection is kept
//! until the client is closed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tracing::{debug, warn};

use crate::broker::conn::{BrokerError, Connection, DialOptions};
use crate::broker::pool::ManageConnection;
use crate::broker::resp::Value;
use crate::retry::with_timeout;

/// Connect and read bound used for every sentinel connection.
pub const SENTINEL_TIMEOUT: Duration = Duration::from_millis(500);

/// Role reported by a writable primary.
pub const MASTER_ROLE: &str = "master";

/// Bound on the `AUTH`/`SELECT` handshake and on each `ROLE` check against a
/// master.
pub const MASTER_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves the current master address through a set of sentinels.
#[derive(Debug)]
pub struct SentinelClient {
    addrs: Mutex<Vec<String>>,
    master_name: String,
    dial_options: DialOptions,
    cached: Mutex<Option<Connection>>,
    closed: AtomicBool,
}

impl SentinelClient {
    /// Creates a client for `master_name` using the given sentinel addresses.
    pub fn new(addrs: Vec<String>, master_name: impl Into<String>) -> Self {
        Self {
            addrs: Mutex::new(addrs),
            master_name: master_name.into(),
            dial_options: DialOptions::default().with_timeout(SENTINEL_TIMEOUT),
            cached: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Sentinel addresses in the order they will be tried.
    pub fn addrs(&self) -> Vec<String> {
        self.addrs
            .lock()
            .map(|addrs| addrs.clone())
            .unwrap_or_default()
    }

    pub fn master_name(&self) -> &str {
        &self.master_name
    }

    /// Asks the sentinels, in order, for the current master address.
    pub async fn master_addr(&self) -> Result<String, BrokerError> {
        if let Some(mut conn) = self.take_cached() {
            match query_master(&mut conn, &self.master_name).await {
                Ok(addr) => {
                    self.store_cached(conn);
                    return Ok(addr);
                }
                Err(err) => {
                    debug!(
                        event = "sentinel_cached_query_failed",
                        sentinel = %conn.peer(),
                        error = %err
                    );
                }
            }
        }

        let mut last_error = "no sentinel addresses configured".to_string();
        for addr in self.addrs() {
            match self.query_sentinel(&addr).await {
                Ok((conn, master)) => {
                    self.promote(&addr);
                    self.store_cached(conn);
                    debug!(
                        event = "sentinel_master_resolved",
                        sentinel = %addr,
                        master = %master,
                        master_name = %self.master_name
                    );
                    return Ok(master);
                }
                Err(err) => {
                    warn!(
                        event = "sentinel_query_failed",
                        sentinel = %addr,
                        master_name = %self.master_name,
                        error = %err
                    );
                    last_error = err.to_string();
                }
            }
        }

        Err(BrokerError::NoSentinelAvailable {
            master_name: self.master_name.clone(),
            last_error,
        })
    }

    /// Drops the cached sentinel connection; later lookups dial fresh and are
    /// not cached.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        drop(self.take_cached());
    }

    async fn query_sentinel(&self, addr: &str) -> Result<(Connection, String), BrokerError> {
        let mut conn = Connection::dial(addr, &self.dial_options).await?;
        let master = query_master(&mut conn, &self.master_name).await?;
        Ok((conn, master))
    }

    fn promote(&self, addr: &str) {
        if let Ok(mut addrs) = self.addrs.lock() {
            if let Some(index) = addrs.iter().position(|candidate| candidate == addr) {
                let promoted = addrs.remove(index);
                addrs.insert(0, promoted);
            }
        }
    }

    fn take_cached(&self) -> Option<Connection> {
        self.cached.lock().ok().and_then(|mut cached| cached.take())
    }

    fn store_cached(&self, conn: Connection) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(mut cached) = self.cached.lock() {
            *cached = Some(conn);
        }
    }
}

/// Pool manager that dials whatever master the sentinels currently report
/// and only hands out connections that still hold the master role.
#[derive(Debug)]
pub struct SentinelMasterManager {
    sentinel: Arc<SentinelClient>,
    options: DialOptions,
    handshake_timeout: Duration,
}

impl SentinelMasterManager {
    /// Manager dialing the master reported by `sentinel`, authenticating
    /// with `password` when set.
    pub fn new(sentinel: Arc<SentinelClient>, password: Option<SecretString>) -> Self {
        Self {
            sentinel,
            options: DialOptions::default().with_password(password),
            handshake_timeout: MASTER_HANDSHAKE_TIMEOUT,
        }
    }

    /// Overrides [`MASTER_HANDSHAKE_TIMEOUT`].
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

#[async_trait]
impl ManageConnection for SentinelMasterManager {
    type Connection = Connection;

    async fn connect(&self) -> Result<Connection, BrokerError> {
        let addr = self.sentinel.master_addr().await?;
        with_timeout(self.handshake_timeout, Connection::dial(&addr, &self.options))
            .await
            .map_err(|_| BrokerError::Timeout {
                operation: "master handshake",
                timeout: self.handshake_timeout,
            })?
    }

    async fn check(&self, conn: &mut Connection) -> Result<(), BrokerError> {
        with_timeout(self.handshake_timeout, check_role(conn, MASTER_ROLE))
            .await
            .map_err(|_| BrokerError::Timeout {
                operation: "role check",
                timeout: self.handshake_timeout,
            })?
    }
}

async fn query_master(conn: &mut Connection, master_name: &str) -> Result<String, BrokerError> {
    let reply = conn
        .command(&["SENTINEL", "get-master-addr-by-name", master_name])
        .await?;
    match reply {
        Value::Array(items) if items.len() == 2 => {
            let host = items[0].as_str();
            let port = items[1].as_str();
            match (host, port) {
                (Some(host), Some(port)) if host.contains(':') => Ok(format!("[{host}]:{port}")),
                (Some(host), Some(port)) => Ok(format!("{host}:{port}")),
                _ => Err(BrokerError::Protocol(format!(
                    "malformed master address reply: {items:?}"
                ))),
            }
        }
        Value::Nil => Err(BrokerError::Protocol(format!(
            "sentinel does not know master {master_name:?}"
        ))),
        other => Err(BrokerError::Protocol(format!(
            "unexpected master address reply: {other:?}"
        ))),
    }
}

/// Returns the replication role reported by `ROLE`.
pub async fn role(conn: &mut Connection) -> Result<String, BrokerError> {
    match conn.command(&["ROLE"]).await? {
        Value::Array(items) => items
            .first()
            .and_then(Value::as_str)
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| BrokerError::Protocol("empty ROLE reply".to_string())),
        other => Err(BrokerError::Protocol(format!(
            "unexpected ROLE reply: {other:?}"
        ))),
    }
}

/// Fails unless the connection reports the `expected` role.
pub async fn check_role(conn: &mut Connection, expected: &str) -> Result<(), BrokerError> {
    let actual = role(conn).await?;
    if actual == expected {
        Ok(())
    } else {
        Err(BrokerError::RoleMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}
