//! Bounded connection pool with borrow-time validation.
//!
//! Every connection leaving the pool, whether reused from the idle list or
//! freshly dialed, is passed through [`ManageConnection::check`]. Connections
//! that fail the check are dropped and the pool dials again, up to
//! [`PoolConfig::max_dial_attempts`] fresh dials per borrow.
//!
//! A borrowed connection goes back to the idle list only through
//! [`PooledConnection::release`]; dropping it closes the connection.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::broker::conn::BrokerError;

/// Creates and validates pooled connections.
#[async_trait]
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Opens a new connection.
    async fn connect(&self) -> Result<Self::Connection, BrokerError>;

    /// Validates a connection before it is handed to a caller.
    async fn check(&self, conn: &mut Self::Connection) -> Result<(), BrokerError>;
}

/// Pool sizing and validation limits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Idle connections kept for reuse.
    pub max_idle: usize,
    /// Connections handed out at once; `0` means unbounded.
    pub max_active: usize,
    /// Idle connections older than this are closed instead of reused.
    pub idle_timeout: Option<Duration>,
    /// Wait for a slot when `max_active` is reached instead of failing.
    pub wait: bool,
    /// Fresh dials attempted per borrow when validation keeps failing.
    pub max_dial_attempts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 3,
            max_active: 64,
            idle_timeout: Some(Duration::from_secs(240)),
            wait: true,
            max_dial_attempts: 3,
        }
    }
}

struct IdleConnection<C> {
    conn: C,
    since: Instant,
}

struct PoolInner<M: ManageConnection> {
    manager: M,
    config: PoolConfig,
    idle: Mutex<VecDeque<IdleConnection<M::Connection>>>,
    active: Arc<Semaphore>,
    capacity: usize,
    closed: AtomicBool,
}

impl<M: ManageConnection> PoolInner<M> {
    fn put_back(&self, conn: M::Connection) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.config.max_idle {
                idle.push_front(IdleConnection {
                    conn,
                    since: Instant::now(),
                });
            }
        }
    }

    fn pop_idle(&self) -> Option<M::Connection> {
        let mut idle = self.idle.lock().ok()?;
        while let Some(entry) = idle.pop_front() {
            let expired = self
                .config
                .idle_timeout
                .is_some_and(|timeout| entry.since.elapsed() > timeout);
            if expired {
                debug!(event = "pool_idle_connection_expired");
                continue;
            }
            return Some(entry.conn);
        }
        None
    }
}

/// Shared handle to a connection pool.
pub struct Pool<M: ManageConnection> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ManageConnection> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ManageConnection> Pool<M> {
    /// Empty pool; connections are dialed on demand.
    pub fn new(manager: M, config: PoolConfig) -> Self {
        let capacity = if config.max_active == 0 {
            Semaphore::MAX_PERMITS
        } else {
            config.max_active
        };
        Self {
            inner: Arc::new(PoolInner {
                manager,
                config,
                idle: Mutex::new(VecDeque::new()),
                active: Arc::new(Semaphore::new(capacity)),
                capacity,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Borrows a validated connection.
    ///
    /// Blocks while the pool is at `max_active` when `wait` is set.
    pub async fn get(&self) -> Result<PooledConnection<M>, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::PoolClosed);
        }
        let permit = self.acquire().await?;

        while let Some(mut conn) = self.inner.pop_idle() {
            match self.inner.manager.check(&mut conn).await {
                Ok(()) => return Ok(self.wrap(conn, permit)),
                Err(err) => {
                    debug!(event = "pool_idle_connection_discarded", error = %err);
                }
            }
        }

        let max_attempts = self.inner.config.max_dial_attempts.max(1);
        let mut attempt = 1;
        loop {
            let mut conn = self.inner.manager.connect().await?;
            let err = match self.inner.manager.check(&mut conn).await {
                Ok(()) => return Ok(self.wrap(conn, permit)),
                Err(err) => err,
            };
            warn!(
                event = "pool_borrow_check_failed",
                attempt,
                max_attempts,
                error = %err
            );
            if attempt >= max_attempts {
                return Err(err);
            }
            attempt += 1;
        }
    }

    /// Closes the pool: idle connections are dropped, waiting and future
    /// borrows fail, and released connections are not kept.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.active.close();
        if let Ok(mut idle) = self.inner.idle.lock() {
            idle.clear();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Connections currently waiting in the idle list.
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    /// Connections currently borrowed.
    pub fn active_count(&self) -> usize {
        self.inner.capacity - self.inner.active.available_permits()
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, BrokerError> {
        let active = Arc::clone(&self.inner.active);
        if self.inner.config.wait {
            active
                .acquire_owned()
                .await
                .map_err(|_| BrokerError::PoolClosed)
        } else {
            active.try_acquire_owned().map_err(|err| match err {
                TryAcquireError::Closed => BrokerError::PoolClosed,
                TryAcquireError::NoPermits => BrokerError::PoolExhausted,
            })
        }
    }

    fn wrap(&self, conn: M::Connection, permit: OwnedSemaphorePermit) -> PooledConnection<M> {
        PooledConnection {
            conn,
            lease: Lease {
                pool: Arc::clone(&self.inner),
                _permit: permit,
            },
        }
    }
}

/// Active slot held by a borrowed connection.
struct Lease<M: ManageConnection> {
    pool: Arc<PoolInner<M>>,
    _permit: OwnedSemaphorePermit,
}

/// Borrowed connection holding one active slot until it is released,
/// detached or dropped.
pub struct PooledConnection<M: ManageConnection> {
    conn: M::Connection,
    lease: Lease<M>,
}

impl<M: ManageConnection> PooledConnection<M> {
    /// Returns the connection to the idle list and frees its slot.
    pub fn release(self) {
        let Self { conn, lease } = self;
        lease.pool.put_back(conn);
    }

    /// Takes ownership of the connection so it is never returned to the pool.
    ///
    /// The active slot is released immediately.
    pub fn detach(self) -> M::Connection {
        self.conn
    }
}

impl<M: ManageConnection> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<M: ManageConnection> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}
