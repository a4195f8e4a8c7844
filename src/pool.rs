//! Bounded connection pool on top of `bb8`.
//!
//! Connections are opened lazily up to `max_size`. Callers waiting at capacity are queued
//! by bb8 and served in arrival order until their timeout elapses. A checked-out connection
//! goes back idle only through [`PooledConnection::release`] with `healthy = true`; dropping
//! the guard instead (error path, cancelled future) closes the connection and frees its slot.

use crate::config::PoolConfig;
use crate::error::{AppError, AppResult};
use crate::models::ConnectionTestResult;
use crate::schema_profile::SqlDialect;
use async_trait::async_trait;
use bb8::{ManageConnection, RunError};
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

// Cadence maximale du nettoyage des connexions expirées.
const MAX_REAPER_RATE: Duration = Duration::from_secs(30);

/// Opens and checks connections for a [`Pool`].
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> AppResult<Self::Connection>;

    /// Cheap round-trip used by connection probes and health checks.
    async fn ping(&self, conn: &mut Self::Connection) -> AppResult<()>;

    /// SQL dialect the driver executes; profiles of another dialect are refused.
    fn dialect(&self) -> SqlDialect;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolState {
    pub total_connections: u32,
    pub idle_connections: u32,
    pub active_connections: u32,
    pub max_size: u32,
}

// Connexion suivie par bb8. `broken` reste vrai tant que l'appelant ne l'a pas rendue saine.
pub struct TrackedConnection<C> {
    conn: C,
    broken: bool,
}

struct Shared<M: ConnectionManager> {
    manager: M,
    connect_timeout: Duration,
    ever_connected: AtomicBool,
    // Dernier échec d'ouverture, diffusé aux appelants en attente.
    failures: watch::Sender<Option<AppError>>,
}

/// Adapts a [`ConnectionManager`] to `bb8::ManageConnection`.
pub struct PoolManager<M: ConnectionManager> {
    shared: Arc<Shared<M>>,
}

#[async_trait]
impl<M: ConnectionManager> ManageConnection for PoolManager<M> {
    type Connection = TrackedConnection<M::Connection>;
    type Error = AppError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let shared = &self.shared;
        let result = match tokio::time::timeout(shared.connect_timeout, shared.manager.connect()).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(format!(
                "connection not established within {:?}",
                shared.connect_timeout
            ))),
        };

        match result {
            Ok(conn) => {
                shared.ever_connected.store(true, Ordering::SeqCst);
                debug!("Opened pooled connection");
                Ok(TrackedConnection { conn, broken: false })
            }
            Err(e) => {
                warn!(error = %e, "Failed to open pooled connection");
                shared.failures.send_replace(Some(e.clone()));
                Err(e)
            }
        }
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        self.shared.manager.ping(&mut conn.conn).await
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.broken
    }
}

pub struct Pool<M: ConnectionManager> {
    inner: bb8::Pool<PoolManager<M>>,
    shared: Arc<Shared<M>>,
    max_size: u32,
    acquire_timeout: Duration,
}

impl<M: ConnectionManager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            shared: Arc::clone(&self.shared),
            max_size: self.max_size,
            acquire_timeout: self.acquire_timeout,
        }
    }
}

impl<M: ConnectionManager> Pool<M> {
    /// Builds the pool without opening any connection. Must run inside a tokio runtime.
    pub fn new(manager: M, config: PoolConfig) -> Self {
        let (failures, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            manager,
            connect_timeout: config.connect_timeout(),
            ever_connected: AtomicBool::new(false),
            failures,
        });

        // bb8 refuse les durées nulles : elles équivalent ici à « pas de limite ».
        let idle_timeout = config.idle_timeout().filter(|d| !d.is_zero());
        let max_lifetime = config.max_lifetime().filter(|d| !d.is_zero());
        let reaper_rate = idle_timeout
            .into_iter()
            .chain(max_lifetime)
            .fold(MAX_REAPER_RATE, Duration::min);

        let max_size = config.max_size.max(1);
        let acquire_timeout = config.acquire_timeout().max(Duration::from_millis(1));

        let inner = bb8::Pool::builder()
            .max_size(max_size)
            .min_idle(None)
            .connection_timeout(acquire_timeout)
            .idle_timeout(idle_timeout)
            .max_lifetime(max_lifetime)
            .reaper_rate(reaper_rate)
            .test_on_check_out(false)
            .retry_connection(false)
            .build_unchecked(PoolManager {
                shared: Arc::clone(&shared),
            });

        Self {
            inner,
            shared,
            max_size,
            acquire_timeout,
        }
    }

    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    /// Checks out a connection, waiting at most `timeout` for a free slot.
    ///
    /// A failure to open a new connection ends the wait immediately with that error.
    pub async fn acquire(&self, timeout: Duration) -> AppResult<PooledConnection<M>> {
        // Abonnement avant l'attente : seuls les échecs postérieurs comptent.
        let mut failures = self.shared.failures.subscribe();

        let checkout = async {
            tokio::select! {
                result = self.inner.get_owned() => result.map_err(|e| match e {
                    RunError::User(e) => e,
                    RunError::TimedOut => self.exhausted(timeout),
                }),
                e = next_failure(&mut failures) => Err(e),
            }
        };

        let mut conn = match tokio::time::timeout(timeout, checkout).await {
            Ok(result) => result?,
            Err(_) => return Err(self.exhausted(timeout)),
        };
        conn.broken = true;
        Ok(PooledConnection { conn })
    }

    /// Returns a connection: kept idle when `healthy`, closed otherwise.
    pub fn release(&self, conn: PooledConnection<M>, healthy: bool) {
        conn.release(healthy);
    }

    pub fn state(&self) -> PoolState {
        let state = self.inner.state();
        PoolState {
            total_connections: state.connections,
            idle_connections: state.idle_connections,
            active_connections: state.connections.saturating_sub(state.idle_connections),
            max_size: self.max_size,
        }
    }

    /// True once any connection has been established through this pool.
    pub fn has_connected(&self) -> bool {
        self.shared.ever_connected.load(Ordering::SeqCst)
    }

    fn exhausted(&self, timeout: Duration) -> AppError {
        warn!(
            timeout_ms = timeout.as_millis() as u64,
            max_size = self.max_size,
            "Connection pool exhausted"
        );
        AppError::Timeout(format!(
            "no connection available within {:?} (pool max size {})",
            timeout, self.max_size
        ))
    }
}

// Attend le prochain échec d'ouverture publié après l'abonnement.
async fn next_failure(failures: &mut watch::Receiver<Option<AppError>>) -> AppError {
    loop {
        if failures.changed().await.is_err() {
            return std::future::pending().await;
        }
        if let Some(e) = failures.borrow_and_update().clone() {
            return e;
        }
    }
}

/// A checked-out connection. Holds one pool slot until released or dropped.
pub struct PooledConnection<M: ConnectionManager> {
    conn: bb8::PooledConnection<'static, PoolManager<M>>,
}

impl<M: ConnectionManager> PooledConnection<M> {
    pub fn release(mut self, healthy: bool) {
        if !healthy {
            warn!("Discarding unhealthy connection");
        }
        self.conn.broken = !healthy;
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn.conn
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn.conn
    }
}

/// Opens a short-lived connection outside any pool and runs a no-op round-trip.
/// Failures are reported in the result, never returned as errors.
pub async fn probe<M: ConnectionManager>(manager: &M, timeout: Duration) -> ConnectionTestResult {
    let attempt = async {
        let mut conn = manager.connect().await?;
        manager.ping(&mut conn).await
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(())) => {
            info!("Connection test succeeded");
            ConnectionTestResult::success()
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Connection test failed");
            ConnectionTestResult::failure(e.to_string())
        }
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "Connection test timed out");
            ConnectionTestResult::failure(format!("connection test timed out after {:?}", timeout))
        }
    }
}
