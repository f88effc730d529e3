//! Per-session broker connections.
//!
//! A [`Connector`] produces one [`SessionLink`] per session attempt. Direct
//! mode dials the configured URL; sentinel mode resolves the master through a
//! fresh sentinel client and a role-checked pool, both released with the
//! session.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use tracing::debug;

use crate::broker::conn::{BrokerError, Connection, RedisUrl};
use crate::broker::pool::{Pool, PoolConfig};
use crate::broker::pubsub::{CommandSink, EventSource};
use crate::broker::sentinel::{SentinelClient, SentinelMasterManager};
use crate::config::ConnectionMode;

/// Opens the broker link for one session.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<SessionLink, BrokerError>;
}

/// Exclusive connection resources of one session.
///
/// Dropping the link closes the socket and releases any sentinel resources.
pub struct SessionLink {
    pub(crate) source: Box<dyn EventSource>,
    pub(crate) sink: Box<dyn CommandSink>,
    pub(crate) scope: Option<SentinelScope>,
}

impl SessionLink {
    /// Link over arbitrary halves, with no sentinel scope.
    pub fn new(source: Box<dyn EventSource>, sink: Box<dyn CommandSink>) -> Self {
        Self {
            source,
            sink,
            scope: None,
        }
    }

    /// Splits an established connection into a link.
    pub fn from_connection(conn: Connection) -> Self {
        let (reader, writer) = conn.into_split();
        Self::new(Box::new(reader), Box::new(writer))
    }

    /// Attaches sentinel resources that must live as long as the session.
    pub fn with_scope(mut self, scope: SentinelScope) -> Self {
        self.scope = Some(scope);
        self
    }
}

impl fmt::Debug for SessionLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLink")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Dials a fixed URL.
#[derive(Clone, Debug)]
pub struct DirectConnector {
    url: RedisUrl,
}

impl DirectConnector {
    /// Connector that dials `url` for every session.
    pub fn new(url: RedisUrl) -> Self {
        Self { url }
    }
}

#[async_trait]
impl Connector for DirectConnector {
    async fn connect(&self) -> Result<SessionLink, BrokerError> {
        let conn = Connection::dial_url(&self.url).await?;
        Ok(SessionLink::from_connection(conn))
    }
}

/// Resolves the current master through sentinels for every session.
#[derive(Clone, Debug)]
pub struct SentinelConnector {
    addrs: Vec<String>,
    master_name: String,
    password: Option<SecretString>,
    pool_config: PoolConfig,
}

impl SentinelConnector {
    /// Connector asking `addrs`, in order, for `master_name`. No password and
    /// default pool limits.
    pub fn new(addrs: Vec<String>, master_name: impl Into<String>) -> Self {
        Self {
            addrs,
            master_name: master_name.into(),
            password: None,
            pool_config: PoolConfig::default(),
        }
    }

    /// Password sent with `AUTH` to the master.
    pub fn with_password(mut self, password: Option<SecretString>) -> Self {
        self.password = password;
        self
    }

    /// Limits for the per-session master pool.
    pub fn with_pool_config(mut self, pool_config: PoolConfig) -> Self {
        self.pool_config = pool_config;
        self
    }
}

#[async_trait]
impl Connector for SentinelConnector {
    async fn connect(&self) -> Result<SessionLink, BrokerError> {
        let sentinel = Arc::new(SentinelClient::new(
            self.addrs.clone(),
            self.master_name.clone(),
        ));
        let pool = Pool::new(
            SentinelMasterManager::new(Arc::clone(&sentinel), self.password.clone()),
            self.pool_config.clone(),
        );
        // Released on every path, including a failed borrow.
        let scope = SentinelScope { sentinel, pool };

        let conn = scope.pool.get().await?.detach();
        debug!(
            event = "sentinel_master_connected",
            master = %conn.peer(),
            master_name = %self.master_name
        );
        Ok(SessionLink::from_connection(conn).with_scope(scope))
    }
}

/// Sentinel client and master pool owned by one session.
pub struct SentinelScope {
    sentinel: Arc<SentinelClient>,
    pool: Pool<SentinelMasterManager>,
}

impl fmt::Debug for SentinelScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SentinelScope")
            .field("master_name", &self.sentinel.master_name())
            .field("pool_closed", &self.pool.is_closed())
            .finish()
    }
}

impl Drop for SentinelScope {
    fn drop(&mut self) {
        self.pool.close();
        self.sentinel.close();
    }
}

/// Builds the connector for a validated connection mode.
pub fn connector_for(mode: ConnectionMode, pool_config: PoolConfig) -> Arc<dyn Connector> {
    match mode {
        ConnectionMode::Direct(url) => Arc::new(DirectConnector::new(url)),
        ConnectionMode::Sentinel {
            addrs,
            master_name,
            password,
        } => Arc::new(
            SentinelConnector::new(addrs, master_name)
                .with_password(password)
                .with_pool_config(pool_config),
        ),
    }
}
