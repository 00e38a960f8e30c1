//! Async Redis client with automatic reconnection.
//!
//! Wraps a `redis::aio::ConnectionManager`, which transparently re-establishes
//! the connection after transient failures, so callers never hold a broken
//! handle. The handle is `Clone + Send + Sync`; cloning is an Arc clone and
//! each operation clones the manager for the duration of the command.
//!
//! Serves three stores: sessions (`session:{token}`), the verification-code
//! fast path (`verification_code:{email}`), and rate-limit counters
//! (`rl:ip:{ip}`, `rl:email:{email}`).

use {
    redis::{AsyncCommands, ExistenceCheck, SetExpiry, SetOptions, aio::ConnectionManager},
    thiserror::Error,
    tracing::info,
};

use roost_config::RedisConfig;

#[derive(Error, Debug)]
pub enum RedisError {
    #[error("redis unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),
}

pub type Result<T> = std::result::Result<T, RedisError>;

/// Cloneable handle to the Redis backend.
#[derive(Clone)]
pub struct RedisHandle {
    conn: ConnectionManager,
}

impl RedisHandle {
    /// Connect and spin up the reconnecting manager.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let url = config.url();
        info!(host = %config.host, port = config.port, db = config.database, "connecting to redis");
        let client = redis::Client::open(url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        info!("redis connection established");
        Ok(Self { conn })
    }

    /// SET with a TTL in seconds.
    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs).await?;
        Ok(())
    }

    /// SET NX with a TTL; returns `true` when the key was created (i.e. it
    /// did not already exist).
    pub async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let opts = SetOptions::default()
            .conditional_set(ExistenceCheck::NX)
            .with_expiration(SetExpiry::EX(ttl_secs));
        let created: Option<String> = conn.set_options(key, value, opts).await?;
        Ok(created.is_some())
    }

    /// GET; `None` when the key is absent.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    /// DEL; `true` when a key was removed.
    pub async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    /// Remaining TTL in seconds; `None` when the key is absent or has no
    /// expiry.
    pub async fn ttl(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let ttl: i64 = conn.ttl(key).await?;
        Ok((ttl >= 0).then_some(ttl))
    }

    /// All keys matching `pattern`, collected via SCAN. Never KEYS; SCAN
    /// does not block the server on large keyspaces.
    pub async fn scan_match(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut iter = conn.scan_match::<_, String>(pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }
}
