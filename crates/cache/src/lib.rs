//! Two-tier cache with hot-key statistics.
//!
//! L1 is an in-process TTL map; L2 is the `search_cache` table, whose
//! `hit_count` is bumped on both write and read; the read-path increment is
//! what feeds hot-key scoring. Access statistics are mirrored into
//! `hot_data_stats` so the scores survive a restart: a periodic tick reloads
//! the last 24 hours of accesses.

use std::{sync::Arc, time::Duration};

use tracing::{debug, warn};

use roost_storage::{ConnectionPool, StorageError};

pub mod hot;
pub mod l1;

pub use {
    hot::{AccessStat, HotKeyTracker, decay_factor},
    l1::L1Cache,
};

const L1_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const L2_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);
const HOT_RELOAD_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Hot-key type used for cached user lookups.
pub const USER_INFO_TYPE: &str = "user_info";
/// L1 TTL for cached user records.
const USER_INFO_TTL: Duration = Duration::from_secs(300);

pub struct CacheManager {
    l1: L1Cache,
    hot: HotKeyTracker,
    pool: ConnectionPool,
}

impl CacheManager {
    pub fn new(pool: ConnectionPool) -> Arc<Self> {
        Arc::new(Self {
            l1: L1Cache::new(),
            hot: HotKeyTracker::new(),
            pool,
        })
    }

    // ── L1 ───────────────────────────────────────────────────────────────

    pub fn get_l1(&self, key: &str) -> Option<serde_json::Value> {
        self.l1.get(key)
    }

    pub fn set_l1(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        self.l1.set(key, value, ttl);
    }

    pub fn remove_l1(&self, key: &str) -> bool {
        self.l1.remove(key)
    }

    // ── L2 ───────────────────────────────────────────────────────────────

    /// Upsert an L2 row. The write also counts as a hit.
    pub async fn set_l2(
        &self,
        cache_key: &str,
        payload: &serde_json::Value,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(
            "INSERT INTO search_cache (cache_key, payload, hit_count, expires_at)
             VALUES (?, ?, 1, DATE_ADD(NOW(), INTERVAL ? SECOND))
             ON DUPLICATE KEY UPDATE
                 payload = VALUES(payload),
                 hit_count = hit_count + 1,
                 expires_at = VALUES(expires_at)",
        )
        .bind(cache_key)
        .bind(payload.to_string())
        .bind(ttl.as_secs() as i64)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Read a live L2 row, bumping `hit_count` so popularity is tracked on
    /// the read path too.
    pub async fn get_l2(&self, cache_key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        let mut conn = self.pool.acquire().await?;
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT payload FROM search_cache WHERE cache_key = ? AND expires_at > NOW()",
        )
        .bind(cache_key)
        .fetch_optional(&mut *conn)
        .await?;

        let Some((payload,)) = row else {
            return Ok(None);
        };

        sqlx::query("UPDATE search_cache SET hit_count = hit_count + 1 WHERE cache_key = ?")
            .bind(cache_key)
            .execute(&mut *conn)
            .await?;

        Ok(serde_json::from_str(&payload).ok())
    }

    /// Delete expired L2 rows; returns how many went away.
    pub async fn sweep_l2(&self) -> Result<u64, StorageError> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query("DELETE FROM search_cache WHERE expires_at < NOW()")
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    // ── Hot keys ─────────────────────────────────────────────────────────

    /// Record one access in memory and mirror it into `hot_data_stats`.
    pub async fn record_access(&self, kind: &str, key: &str) {
        let now = roost_common::epoch_secs();
        self.hot.record_access(kind, key, now);

        let result: Result<(), StorageError> = async {
            let mut conn = self.pool.acquire().await?;
            sqlx::query(
                "INSERT INTO hot_data_stats (stat_type, stat_key, access_count, last_access_at)
                 VALUES (?, ?, 1, NOW())
                 ON DUPLICATE KEY UPDATE
                     access_count = access_count + 1,
                     last_access_at = NOW()",
            )
            .bind(kind)
            .bind(key)
            .execute(&mut *conn)
            .await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!(kind, key, error = %e, "failed to persist hot-key access");
        }
    }

    pub fn is_hot(&self, kind: &str, key: &str, threshold: f64) -> bool {
        self.hot
            .is_hot(kind, key, threshold, roost_common::epoch_secs())
    }

    pub fn hot_list(&self, kind: &str, limit: usize) -> Vec<(String, f64)> {
        self.hot.hot_list(kind, limit, roost_common::epoch_secs())
    }

    /// Repopulate in-memory scores from the last 24 h of persisted accesses.
    pub async fn reload_hot_stats(&self) -> Result<usize, StorageError> {
        let mut conn = self.pool.acquire().await?;
        let rows: Vec<(String, String, i64, i64)> = sqlx::query_as(
            "SELECT stat_type, stat_key, access_count, UNIX_TIMESTAMP(last_access_at)
             FROM hot_data_stats
             WHERE last_access_at > DATE_SUB(NOW(), INTERVAL 24 HOUR)",
        )
        .fetch_all(&mut *conn)
        .await?;

        let count = rows.len();
        self.hot.replace_all(
            rows.into_iter()
                .map(|(kind, key, access_count, last_access_at)| {
                    (
                        kind,
                        key,
                        AccessStat {
                            access_count: access_count.max(0) as u64,
                            last_access_at,
                        },
                    )
                })
                .collect(),
        );
        debug!(count, "reloaded hot-key statistics");
        Ok(count)
    }

    // ── User-info fast path ──────────────────────────────────────────────

    /// Cache a user's public record under its username.
    pub fn cache_user_info(&self, username: &str, data: serde_json::Value) {
        self.set_l1(&format!("user_info:{username}"), data, USER_INFO_TTL);
    }

    /// Cached user record, with hot-key accounting.
    pub async fn cached_user_info(&self, username: &str) -> Option<serde_json::Value> {
        self.record_access(USER_INFO_TYPE, username).await;
        self.get_l1(&format!("user_info:{username}"))
    }

    pub fn invalidate_user_info(&self, username: &str) {
        self.remove_l1(&format!("user_info:{username}"));
    }

    // ── Maintenance ──────────────────────────────────────────────────────

    /// Spawn the three periodic ticks: L1 sweep (5 min), L2 sweep (30 min),
    /// hot-stat reload (10 min). Tasks end when the manager is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::with_capacity(3);

        let weak = Arc::downgrade(self);
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(L1_SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(manager) = weak.upgrade() else { return };
                let swept = manager.l1.sweep();
                if swept > 0 {
                    debug!(swept, "swept expired L1 entries");
                }
            }
        }));

        let weak = Arc::downgrade(self);
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(L2_SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(manager) = weak.upgrade() else { return };
                match manager.sweep_l2().await {
                    Ok(swept) if swept > 0 => debug!(swept, "swept expired L2 rows"),
                    Ok(_) => {},
                    Err(e) => warn!(error = %e, "L2 sweep failed"),
                }
            }
        }));

        let weak = Arc::downgrade(self);
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(HOT_RELOAD_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(manager) = weak.upgrade() else { return };
                if let Err(e) = manager.reload_hot_stats().await {
                    warn!(error = %e, "hot-stat reload failed");
                }
            }
        }));

        handles
    }
}
