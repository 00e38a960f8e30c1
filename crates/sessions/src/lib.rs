//! Redis-backed session management.
//!
//! Redis is the single source of truth: one key per session
//! (`session:{token}`) whose TTL enforces expiry, with the expiry re-checked
//! on read so a not-yet-collected key never validates. Activity refresh is a
//! sliding window: `touch` re-arms the TTL to the *default* timeout, never
//! the remember-me one, which bounds how far a long-lived session can be
//! extended past its creation policy.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use {
    serde::Serialize,
    thiserror::Error,
    tracing::{debug, info, warn},
};

use {
    roost_config::SharedConfig,
    roost_redis::{RedisError, RedisHandle},
};

pub mod record;

pub use record::SessionInfo;

const SESSION_KEY_PREFIX: &str = "session:";

#[derive(Error, Debug)]
pub enum SessionError {
    /// Creation refused: the user already holds the configured number of
    /// sessions and multi-device support is off.
    #[error("session limit exceeded")]
    LimitExceeded,

    #[error(transparent)]
    Redis(#[from] RedisError),
}

/// Lifetime counters, exposed for observability.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub created: u64,
    pub expired: u64,
    pub destroyed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

pub struct SessionManager {
    redis: RedisHandle,
    config: SharedConfig,
    created: AtomicU64,
    expired: AtomicU64,
    destroyed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

fn session_key(token: &str) -> String {
    format!("{SESSION_KEY_PREFIX}{token}")
}

fn token_from_key(key: &str) -> &str {
    key.strip_prefix(SESSION_KEY_PREFIX).unwrap_or(key)
}

/// Mint an opaque 128-bit session token (URL-safe base64, no padding).
pub fn mint_token() -> String {
    use {base64::Engine, rand::RngCore};

    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

impl SessionManager {
    pub fn new(redis: RedisHandle, config: SharedConfig) -> Arc<Self> {
        Arc::new(Self {
            redis,
            config,
            created: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        })
    }

    /// Create a session and return its token.
    pub async fn create(
        &self,
        user_id: &str,
        device_id: &str,
        client_id: &str,
        ip: &str,
        remember_me: bool,
    ) -> Result<String, SessionError> {
        let session_cfg = self.config.get().security.session.clone();

        if !session_cfg.multi_device_support
            && session_cfg.max_sessions_per_user > 0
            && self.active_sessions(user_id).await?.len() >= session_cfg.max_sessions_per_user
        {
            warn!(user_id, "session limit exceeded");
            return Err(SessionError::LimitExceeded);
        }

        let ttl = if remember_me {
            session_cfg.remember_me_timeout
        } else {
            session_cfg.default_timeout
        };

        let now = roost_common::epoch_secs();
        let info = SessionInfo {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            client_id: client_id.to_string(),
            ip: ip.to_string(),
            created_at: now,
            last_activity: now,
            expires_at: now + ttl as i64,
        };

        let token = mint_token();
        self.redis
            .set_ex(&session_key(&token), &info.to_record(), ttl)
            .await?;
        self.created.fetch_add(1, Ordering::Relaxed);
        info!(user_id, device_id, "session created");
        Ok(token)
    }

    /// Look up a session. Expired-but-present sessions are deleted eagerly
    /// and reported as missing; malformed records count as missing too.
    pub async fn validate(&self, token: &str) -> Result<Option<SessionInfo>, SessionError> {
        if token.is_empty() {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let key = session_key(token);
        let Some(raw) = self.redis.get(&key).await? else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let Some(info) = SessionInfo::parse_record(&raw) else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        if info.is_expired(roost_common::epoch_secs()) {
            self.redis.del(&key).await?;
            self.expired.fetch_add(1, Ordering::Relaxed);
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
            debug!(user_id = %info.user_id, "session expired");
            return Ok(None);
        }

        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(info))
    }

    /// Refresh `last_activity` and, in sliding-window mode, re-arm the TTL to
    /// the default timeout. Returns `false` when the session is gone or
    /// sliding mode is off.
    pub async fn touch(&self, token: &str) -> Result<bool, SessionError> {
        let session_cfg = self.config.get().security.session.clone();
        if token.is_empty() || !session_cfg.sliding_window {
            return Ok(false);
        }

        let key = session_key(token);
        let Some(raw) = self.redis.get(&key).await? else {
            return Ok(false);
        };
        let Some(mut info) = SessionInfo::parse_record(&raw) else {
            return Ok(false);
        };
        let now = roost_common::epoch_secs();
        if info.is_expired(now) {
            return Ok(false);
        }

        info.last_activity = now;
        info.expires_at = now + session_cfg.default_timeout as i64;
        self.redis
            .set_ex(&key, &info.to_record(), session_cfg.default_timeout)
            .await?;
        Ok(true)
    }

    /// Delete a session. Returns `true` when a key existed.
    pub async fn destroy(&self, token: &str) -> Result<bool, SessionError> {
        if token.is_empty() {
            return Ok(false);
        }
        let removed = self.redis.del(&session_key(token)).await?;
        if removed {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    /// Delete every session belonging to `user_id`. Returns the count.
    pub async fn destroy_all(&self, user_id: &str) -> Result<usize, SessionError> {
        let tokens = self.active_sessions(user_id).await?;
        let mut destroyed = 0;
        for token in &tokens {
            if self.destroy(token).await? {
                destroyed += 1;
            }
        }
        info!(user_id, destroyed, "destroyed user sessions");
        Ok(destroyed)
    }

    /// Tokens of all live sessions for `user_id`, found by scanning the
    /// session keyspace.
    pub async fn active_sessions(&self, user_id: &str) -> Result<Vec<String>, SessionError> {
        let now = roost_common::epoch_secs();
        let mut tokens = Vec::new();
        for key in self
            .redis
            .scan_match(&format!("{SESSION_KEY_PREFIX}*"))
            .await?
        {
            let Some(raw) = self.redis.get(&key).await? else {
                continue;
            };
            if let Some(info) = SessionInfo::parse_record(&raw)
                && info.user_id == user_id
                && !info.is_expired(now)
            {
                tokens.push(token_from_key(&key).to_string());
            }
        }
        Ok(tokens)
    }

    /// Destroy sessions whose recorded expiry has passed but whose Redis TTL
    /// has not yet collected them (e.g. after a touch that shrank the
    /// window). Returns the number cleaned.
    pub async fn cleanup_expired(&self) -> Result<usize, SessionError> {
        let now = roost_common::epoch_secs();
        let mut cleaned = 0;
        for key in self
            .redis
            .scan_match(&format!("{SESSION_KEY_PREFIX}*"))
            .await?
        {
            let Some(raw) = self.redis.get(&key).await? else {
                continue;
            };
            match SessionInfo::parse_record(&raw) {
                Some(info) if info.is_expired(now) => {
                    if self.redis.del(&key).await? {
                        self.expired.fetch_add(1, Ordering::Relaxed);
                        cleaned += 1;
                    }
                },
                _ => {},
            }
        }
        if cleaned > 0 {
            info!(cleaned, "cleaned up expired sessions");
        }
        Ok(cleaned)
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            created: self.created.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }

    /// Periodic cleanup loop; runs until the returned handle is aborted.
    pub fn spawn_cleanup(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let interval = manager.config.get().security.session.cleanup_interval;
                tokio::time::sleep(std::time::Duration::from_secs(interval.max(1))).await;
                if let Err(e) = manager.cleanup_expired().await {
                    warn!(error = %e, "session cleanup failed");
                }
            }
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique_and_opaque() {
        let t1 = mint_token();
        let t2 = mint_token();
        assert_ne!(t1, t2);
        // 16 bytes -> 22 base64 chars, no padding, URL-safe alphabet.
        assert_eq!(t1.len(), 22);
        assert!(!t1.contains('='));
        assert!(!t1.contains('+'));
        assert!(!t1.contains('/'));
    }

    #[test]
    fn session_key_roundtrip() {
        let key = session_key("abc123");
        assert_eq!(key, "session:abc123");
        assert_eq!(token_from_key(&key), "abc123");
    }
}
