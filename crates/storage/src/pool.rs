//! Bounded pool of long-lived MySQL connections.
//!
//! The pool keeps between `min` and `max` open connections. `acquire` hands
//! out exclusively owned slots: an idle connection is probed with a protocol
//! ping before it is returned, a new connection is opened while below
//! `max`, and otherwise the caller waits, bounded by the acquire deadline,
//! for a slot to come back. Dropping the guard returns the slot; the next
//! acquire (and the periodic health tick) re-validates it, so a caller never
//! observes a dead connection.
//!
//! Two background tasks run per pool: a health tick that probes all idle
//! connections and replenishes up to `min`, and a reap tick that closes
//! connections idle longer than `idle_timeout` while the total stays above
//! `min`.

use std::{
    collections::VecDeque,
    ops::{Deref, DerefMut},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use {
    futures::future::BoxFuture,
    serde::Serialize,
    sqlx::{Connection, Executor, mysql::{MySqlConnectOptions, MySqlConnection}},
    tokio::sync::Notify,
    tracing::{debug, info, warn},
};

use roost_config::DatabaseConfig;

use crate::{
    diagnostics::{DbErrorKind, ErrorMonitor, classify},
    error::StorageError,
};

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub min_connections: usize,
    pub max_connections: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub health_check_interval: Duration,
}

impl From<&DatabaseConfig> for PoolOptions {
    fn from(cfg: &DatabaseConfig) -> Self {
        Self {
            min_connections: cfg.min_connections.min(cfg.pool_size),
            max_connections: cfg.pool_size.max(1),
            acquire_timeout: Duration::from_millis(cfg.acquire_timeout),
            idle_timeout: Duration::from_secs(cfg.idle_timeout),
            health_check_interval: Duration::from_secs(cfg.health_check_interval),
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatistics {
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub acquired: u64,
    pub released: u64,
    pub timeouts: u64,
    pub created: u64,
    pub discarded: u64,
}

struct IdleConn {
    conn: MySqlConnection,
    last_used: Instant,
}

struct PoolState {
    idle: VecDeque<IdleConn>,
    /// Idle + handed-out slots. Never exceeds `max_connections`.
    total: usize,
}

struct PoolShared {
    connect: MySqlConnectOptions,
    limits: PoolOptions,
    state: Mutex<PoolState>,
    available: Notify,
    monitor: ErrorMonitor,
    closed: AtomicBool,
    acquired: AtomicU64,
    released: AtomicU64,
    timeouts: AtomicU64,
    created: AtomicU64,
    discarded: AtomicU64,
}

/// Handle to the pool; cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

/// Exclusively owned pool slot. Dropping it returns the connection to the
/// idle set; slot ownership is transferred, never shared.
pub struct PooledConnection {
    conn: Option<MySqlConnection>,
    shared: Arc<PoolShared>,
}

impl Deref for PooledConnection {
    type Target = MySqlConnection;

    fn deref(&self) -> &Self::Target {
        // Invariant: `conn` is only None after Drop has taken it.
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after drop"),
        }
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after drop"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.released.fetch_add(1, Ordering::Relaxed);
            if self.shared.closed.load(Ordering::Acquire) {
                self.shared.forget_slot();
                return;
            }
            if let Ok(mut state) = self.shared.state.lock() {
                state.idle.push_back(IdleConn {
                    conn,
                    last_used: Instant::now(),
                });
            }
            self.shared.available.notify_one();
        }
    }
}

impl ConnectionPool {
    /// Open a pool against `config`, eagerly establishing `min_connections`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StorageError> {
        let connect = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.name)
            .username(&config.username)
            .password(&config.password);
        let limits = PoolOptions::from(config);

        let shared = Arc::new(PoolShared {
            connect,
            limits: limits.clone(),
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                total: 0,
            }),
            available: Notify::new(),
            monitor: ErrorMonitor::new(),
            closed: AtomicBool::new(false),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            created: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        });

        for _ in 0..limits.min_connections {
            let conn = tokio::time::timeout(limits.acquire_timeout, shared.open_connection())
                .await
                .map_err(|_| StorageError::AcquireTimeout)??;
            if let Ok(mut state) = shared.state.lock() {
                state.total += 1;
                state.idle.push_back(IdleConn {
                    conn,
                    last_used: Instant::now(),
                });
            }
        }
        info!(
            min = limits.min_connections,
            max = limits.max_connections,
            "database pool ready"
        );

        let pool = Self { shared };
        pool.spawn_maintenance();
        Ok(pool)
    }

    /// Acquire a validated connection, waiting up to the configured deadline.
    pub async fn acquire(&self) -> Result<PooledConnection, StorageError> {
        self.acquire_timeout(self.shared.limits.acquire_timeout)
            .await
    }

    /// Acquire with an explicit deadline. Fails with `AcquireTimeout` and
    /// never leaks a slot.
    pub async fn acquire_timeout(
        &self,
        timeout: Duration,
    ) -> Result<PooledConnection, StorageError> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(StorageError::PoolClosed);
            }

            // 1. Reuse an idle slot if its probe passes.
            let idle = self
                .shared
                .state
                .lock()
                .ok()
                .and_then(|mut state| state.idle.pop_front());
            if let Some(idle) = idle {
                let mut conn = idle.conn;
                if conn.ping().await.is_ok() {
                    self.shared.acquired.fetch_add(1, Ordering::Relaxed);
                    return Ok(self.guard(conn));
                }
                debug!("discarding stale pooled connection");
                self.shared.monitor.record(DbErrorKind::Connection);
                self.shared.forget_slot();
                self.shared.discarded.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            // 2. Open a new connection while below the cap. The slot is
            // reserved before connecting so concurrent acquirers cannot
            // overshoot `max`.
            let reserved = self
                .shared
                .state
                .lock()
                .map(|mut state| {
                    if state.total < self.shared.limits.max_connections {
                        state.total += 1;
                        true
                    } else {
                        false
                    }
                })
                .unwrap_or(false);
            if reserved {
                // The connect itself is bounded by the remaining budget; a
                // black-holed backend must not stall past the deadline.
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, self.shared.open_connection()).await {
                    Ok(Ok(conn)) => {
                        self.shared.acquired.fetch_add(1, Ordering::Relaxed);
                        return Ok(self.guard(conn));
                    },
                    Ok(Err(e)) => {
                        self.shared.forget_slot();
                        warn!(error = %e, "failed to open database connection");
                    },
                    Err(_) => {
                        self.shared.forget_slot();
                        self.shared.timeouts.fetch_add(1, Ordering::Relaxed);
                        return Err(StorageError::AcquireTimeout);
                    },
                }
            }

            // 3. Wait for a release, bounded by the remaining budget.
            let now = Instant::now();
            if now >= deadline {
                self.shared.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(StorageError::AcquireTimeout);
            }
            let wait = self.shared.available.notified();
            if tokio::time::timeout(deadline - now, wait).await.is_err() {
                self.shared.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(StorageError::AcquireTimeout);
            }
        }
    }

    /// Run `f` inside a transaction on one pooled connection: `BEGIN`, then
    /// commit when `f` returns ok, roll back otherwise. Nested transactions
    /// are not supported.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send,
        F: for<'c> FnOnce(
                &'c mut MySqlConnection,
            ) -> BoxFuture<'c, Result<T, StorageError>>
            + Send,
    {
        let mut slot = self.acquire().await?;
        (&mut *slot).execute("BEGIN").await?;
        match f(&mut *slot).await {
            Ok(value) => {
                (&mut *slot).execute("COMMIT").await?;
                Ok(value)
            },
            Err(e) => {
                if let Err(rollback) = (&mut *slot).execute("ROLLBACK").await {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(e)
            },
        }
    }

    /// Lifetime backend-error totals by kind.
    pub fn error_totals(&self) -> Vec<(DbErrorKind, u64)> {
        self.shared.monitor.totals()
    }

    /// Whether the circuit for connection-class failures is currently open.
    pub fn connection_circuit_open(&self) -> bool {
        self.shared.monitor.is_open(DbErrorKind::Connection)
    }

    pub fn statistics(&self) -> PoolStatistics {
        let (total, idle) = self
            .shared
            .state
            .lock()
            .map(|s| (s.total, s.idle.len()))
            .unwrap_or((0, 0));
        PoolStatistics {
            total,
            idle,
            in_use: total - idle,
            acquired: self.shared.acquired.load(Ordering::Relaxed),
            released: self.shared.released.load(Ordering::Relaxed),
            timeouts: self.shared.timeouts.load(Ordering::Relaxed),
            created: self.shared.created.load(Ordering::Relaxed),
            discarded: self.shared.discarded.load(Ordering::Relaxed),
        }
    }

    /// Shut the pool down: drop idle connections and fail future acquires.
    /// Outstanding slots are discarded when their guards drop.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let drained: Vec<IdleConn> = self
            .shared
            .state
            .lock()
            .map(|mut state| {
                let drained: Vec<_> = state.idle.drain(..).collect();
                state.total -= drained.len();
                drained
            })
            .unwrap_or_default();
        for idle in drained {
            let _ = idle.conn.close().await;
        }
        self.shared.available.notify_waiters();
        info!("database pool closed");
    }

    fn guard(&self, conn: MySqlConnection) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            shared: Arc::clone(&self.shared),
        }
    }

    fn spawn_maintenance(&self) {
        let weak = Arc::downgrade(&self.shared);
        let health_interval = self.shared.limits.health_check_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(health_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                if shared.closed.load(Ordering::Acquire) {
                    return;
                }
                shared.validate_idle().await;
                shared.replenish().await;
                shared.monitor.reset_window();
            }
        });

        let weak = Arc::downgrade(&self.shared);
        let reap_interval = self.shared.limits.idle_timeout / 2;
        let reap_interval = reap_interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(reap_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                if shared.closed.load(Ordering::Acquire) {
                    return;
                }
                shared.reap_idle().await;
            }
        });
    }
}

impl PoolShared {
    async fn open_connection(&self) -> Result<MySqlConnection, StorageError> {
        match MySqlConnection::connect_with(&self.connect).await {
            Ok(conn) => {
                self.created.fetch_add(1, Ordering::Relaxed);
                Ok(conn)
            },
            Err(e) => {
                self.monitor.record(classify(&e));
                Err(e.into())
            },
        }
    }

    /// Decrement `total` for a slot that is gone for good.
    fn forget_slot(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.total = state.total.saturating_sub(1);
        }
        // A waiter may now be allowed to open a fresh connection.
        self.available.notify_one();
    }

    /// Probe every currently idle connection, discarding failures.
    async fn validate_idle(&self) {
        let snapshot: Vec<IdleConn> = match self.state.lock() {
            Ok(mut state) => state.idle.drain(..).collect(),
            Err(_) => return,
        };
        let mut healthy = Vec::with_capacity(snapshot.len());
        for mut idle in snapshot {
            if idle.conn.ping().await.is_ok() {
                healthy.push(idle);
            } else {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                self.forget_slot();
            }
        }
        if let Ok(mut state) = self.state.lock() {
            for idle in healthy {
                state.idle.push_back(idle);
            }
        }
    }

    /// Open connections until `total` is back at `min_connections`.
    async fn replenish(&self) {
        loop {
            let reserved = self
                .state
                .lock()
                .map(|mut state| {
                    if state.total < self.limits.min_connections {
                        state.total += 1;
                        true
                    } else {
                        false
                    }
                })
                .unwrap_or(false);
            if !reserved {
                return;
            }
            let opened =
                tokio::time::timeout(self.limits.acquire_timeout, self.open_connection()).await;
            match opened.unwrap_or(Err(StorageError::AcquireTimeout)) {
                Ok(conn) => {
                    if let Ok(mut state) = self.state.lock() {
                        state.idle.push_back(IdleConn {
                            conn,
                            last_used: Instant::now(),
                        });
                    }
                    self.available.notify_one();
                },
                Err(e) => {
                    self.forget_slot();
                    warn!(error = %e, "replenish failed");
                    return;
                },
            }
        }
    }

    /// Close connections idle past `idle_timeout`, keeping at least `min`.
    async fn reap_idle(&self) {
        let cutoff = self.limits.idle_timeout;
        let reaped: Vec<IdleConn> = match self.state.lock() {
            Ok(mut state) => {
                let mut reaped = Vec::new();
                while state.total > self.limits.min_connections {
                    match state.idle.front() {
                        Some(idle) if idle.last_used.elapsed() > cutoff => {
                            if let Some(idle) = state.idle.pop_front() {
                                state.total -= 1;
                                reaped.push(idle);
                            }
                        },
                        _ => break,
                    }
                }
                reaped
            },
            Err(_) => return,
        };
        if !reaped.is_empty() {
            debug!(count = reaped.len(), "reaping idle connections");
            for idle in reaped {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                let _ = idle.conn.close().await;
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> DatabaseConfig {
        DatabaseConfig {
            // TEST-NET-1: guaranteed non-routable, connects fail fast or hang
            // until our deadline fires.
            host: "192.0.2.1".into(),
            port: 3306,
            min_connections: 0,
            pool_size: 2,
            acquire_timeout: 200,
            ..DatabaseConfig::default()
        }
    }

    #[test]
    fn options_clamp_min_to_max() {
        let cfg = DatabaseConfig {
            min_connections: 8,
            pool_size: 3,
            ..DatabaseConfig::default()
        };
        let opts = PoolOptions::from(&cfg);
        assert_eq!(opts.min_connections, 3);
        assert_eq!(opts.max_connections, 3);
    }

    #[tokio::test]
    async fn acquire_times_out_against_dead_backend_without_leaking() {
        let pool = ConnectionPool::connect(&unreachable_config()).await.unwrap();

        let started = Instant::now();
        let result = pool.acquire().await;
        assert!(matches!(result, Err(StorageError::AcquireTimeout)));
        assert!(started.elapsed() >= Duration::from_millis(200));

        // The reserved slot was released on connect failure.
        let stats = pool.statistics();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.timeouts, 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn closed_pool_refuses_acquire() {
        let pool = ConnectionPool::connect(&unreachable_config()).await.unwrap();
        pool.close().await;
        assert!(matches!(
            pool.acquire().await,
            Err(StorageError::PoolClosed)
        ));
    }
}
