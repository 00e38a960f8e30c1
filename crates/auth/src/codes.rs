//! One-time email verification codes.
//!
//! Codes are written durably to `verification_codes` and mirrored into Redis
//! under `verification_code:{email}` for the fast path. At most one unused,
//! unexpired code exists per `(email, type)`: issuing a new one invalidates
//! its predecessors. Rate limits (per email and per source IP) ride on
//! Redis `SET NX EX` keys whose TTL doubles as the "try again in N seconds"
//! answer.

use std::{sync::Arc, time::Duration};

use {
    rand::Rng,
    thiserror::Error,
    tracing::{info, warn},
};

use {
    roost_config::SharedConfig,
    roost_redis::{RedisError, RedisHandle},
    roost_storage::{ConnectionPool, StorageError},
};

const FAST_PATH_PREFIX: &str = "verification_code:";
const RL_EMAIL_PREFIX: &str = "rl:email:";
const RL_IP_PREFIX: &str = "rl:ip:";

/// What a verification code authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeType {
    Registration,
    PasswordReset,
    EmailChange,
}

impl CodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registration => "registration",
            Self::PasswordReset => "password_reset",
            Self::EmailChange => "email_change",
        }
    }
}

/// Outcome of a verification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Success,
    InvalidCode,
    ExpiredCode,
    AlreadyUsed,
}

/// Which limit refused an issue request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    Email,
    Ip,
}

#[derive(Error, Debug)]
pub enum IssueError {
    #[error("rate limited, retry in {remaining_seconds}s")]
    RateLimited {
        scope: RateLimitScope,
        remaining_seconds: u64,
    },

    #[error(transparent)]
    Database(#[from] StorageError),

    #[error(transparent)]
    Redis(#[from] RedisError),
}

#[derive(Error, Debug)]
pub enum CodeError {
    #[error(transparent)]
    Database(#[from] StorageError),

    #[error(transparent)]
    Redis(#[from] RedisError),
}

/// A code ready for dispatch.
#[derive(Debug, Clone)]
pub struct IssuedCode {
    pub code: String,
    pub expires_in: Duration,
}

/// Uniformly random 6-digit code.
pub fn generate_code() -> String {
    format!("{:06}", rand::rng().random_range(0..1_000_000))
}

pub struct VerificationCodeManager {
    pool: ConnectionPool,
    redis: RedisHandle,
    config: SharedConfig,
}

impl VerificationCodeManager {
    pub fn new(pool: ConnectionPool, redis: RedisHandle, config: SharedConfig) -> Arc<Self> {
        Arc::new(Self {
            pool,
            redis,
            config,
        })
    }

    /// Issue a fresh code for `(email, code_type)`, enforcing both rate
    /// limits, invalidating older unused codes, and mirroring the code into
    /// the fast path. Returns the code for the mail collaborator.
    pub async fn issue(
        &self,
        email: &str,
        code_type: CodeType,
        ip: &str,
    ) -> Result<IssuedCode, IssueError> {
        let security = self.config.get().security.clone();
        let interval = security.code_send_interval;

        if security.rate_limit_enabled {
            self.check_rate_limit(RateLimitScope::Email, &format!("{RL_EMAIL_PREFIX}{email}"), interval)
                .await?;
            self.check_rate_limit(RateLimitScope::Ip, &format!("{RL_IP_PREFIX}{ip}"), interval)
                .await?;
        }

        self.invalidate_outstanding(email, code_type).await?;

        let code = generate_code();
        let expire_minutes = security.code_expire_minutes.max(1);

        let mut conn = self.pool.acquire().await.map_err(IssueError::Database)?;
        sqlx::query(
            "INSERT INTO verification_codes (email, code, code_type, created_at, expires_at)
             VALUES (?, ?, ?, NOW(), DATE_ADD(NOW(), INTERVAL ? MINUTE))",
        )
        .bind(email)
        .bind(&code)
        .bind(code_type.as_str())
        .bind(expire_minutes as i64)
        .execute(&mut *conn)
        .await
        .map_err(StorageError::from)?;
        drop(conn);

        // Fast path mirror; the durable row is authoritative if this fails.
        if let Err(e) = self
            .redis
            .set_ex(
                &format!("{FAST_PATH_PREFIX}{email}"),
                &code,
                expire_minutes * 60,
            )
            .await
        {
            warn!(email, error = %e, "failed to mirror code into redis");
        }

        info!(email, code_type = code_type.as_str(), "verification code issued");
        Ok(IssuedCode {
            code,
            expires_in: Duration::from_secs(expire_minutes * 60),
        })
    }

    /// Verify a code, consuming it on success. The Redis fast path is tried
    /// first; a mismatch there falls through to the durable store so a code
    /// issued before a Redis restart still verifies.
    pub async fn verify(
        &self,
        email: &str,
        code: &str,
        code_type: CodeType,
    ) -> Result<VerifyOutcome, CodeError> {
        if email.is_empty() || code.is_empty() {
            return Ok(VerifyOutcome::InvalidCode);
        }

        let fast_key = format!("{FAST_PATH_PREFIX}{email}");
        match self.redis.get(&fast_key).await {
            Ok(Some(cached)) if cached == code => {
                self.redis.del(&fast_key).await?;
                // Best effort: mark the durable row used too. Zero rows means
                // the row predates the mirror; the deleted fast-path key
                // already prevents reuse.
                self.mark_used(email, code, code_type).await?;
                return Ok(VerifyOutcome::Success);
            },
            Ok(_) => {},
            Err(e) => warn!(email, error = %e, "redis fast path unavailable, using durable store"),
        }

        self.verify_durable(email, code, code_type).await
    }

    /// Delete rows whose expiry has passed. Returns how many were removed.
    pub async fn cleanup_expired(&self) -> Result<u64, CodeError> {
        let mut conn = self.pool.acquire().await.map_err(CodeError::Database)?;
        let result = sqlx::query("DELETE FROM verification_codes WHERE expires_at < NOW()")
            .execute(&mut *conn)
            .await
            .map_err(StorageError::from)?;
        Ok(result.rows_affected())
    }

    // ── Internals ────────────────────────────────────────────────────────

    async fn check_rate_limit(
        &self,
        scope: RateLimitScope,
        key: &str,
        interval: u64,
    ) -> Result<(), IssueError> {
        if self.redis.set_nx_ex(key, "1", interval).await? {
            return Ok(());
        }
        let remaining_seconds = self
            .redis
            .ttl(key)
            .await?
            .map(|t| t.max(1) as u64)
            .unwrap_or(interval);
        Err(IssueError::RateLimited {
            scope,
            remaining_seconds,
        })
    }

    /// Mark all outstanding unused codes for `(email, type)` as used, so only
    /// the newest code can ever verify.
    async fn invalidate_outstanding(
        &self,
        email: &str,
        code_type: CodeType,
    ) -> Result<(), IssueError> {
        let mut conn = self.pool.acquire().await.map_err(IssueError::Database)?;
        sqlx::query(
            "UPDATE verification_codes
             SET used_at = NOW()
             WHERE email = ? AND code_type = ? AND used_at IS NULL AND expires_at > NOW()",
        )
        .bind(email)
        .bind(code_type.as_str())
        .execute(&mut *conn)
        .await
        .map_err(StorageError::from)?;
        Ok(())
    }

    async fn verify_durable(
        &self,
        email: &str,
        code: &str,
        code_type: CodeType,
    ) -> Result<VerifyOutcome, CodeError> {
        let mut conn = self.pool.acquire().await.map_err(CodeError::Database)?;
        let row: Option<(i64, i64, i64)> = sqlx::query_as(
            "SELECT id, (expires_at > NOW()), (used_at IS NOT NULL)
             FROM verification_codes
             WHERE email = ? AND code = ? AND code_type = ?
             ORDER BY created_at DESC
             LIMIT 1",
        )
        .bind(email)
        .bind(code)
        .bind(code_type.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(StorageError::from)?;

        let Some((id, live, used)) = row else {
            return Ok(VerifyOutcome::InvalidCode);
        };
        if used != 0 {
            return Ok(VerifyOutcome::AlreadyUsed);
        }
        if live == 0 {
            return Ok(VerifyOutcome::ExpiredCode);
        }

        // Single conditional statement: whoever flips used_at wins.
        let updated = sqlx::query(
            "UPDATE verification_codes SET used_at = NOW() WHERE id = ? AND used_at IS NULL",
        )
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(StorageError::from)?;

        if updated.rows_affected() == 1 {
            let _ = self.redis.del(&format!("{FAST_PATH_PREFIX}{email}")).await;
            Ok(VerifyOutcome::Success)
        } else {
            Ok(VerifyOutcome::AlreadyUsed)
        }
    }

    async fn mark_used(
        &self,
        email: &str,
        code: &str,
        code_type: CodeType,
    ) -> Result<(), CodeError> {
        let mut conn = self.pool.acquire().await.map_err(CodeError::Database)?;
        sqlx::query(
            "UPDATE verification_codes
             SET used_at = NOW()
             WHERE email = ? AND code = ? AND code_type = ? AND used_at IS NULL",
        )
        .bind(email)
        .bind(code)
        .bind(code_type.as_str())
        .execute(&mut *conn)
        .await
        .map_err(StorageError::from)?;
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_are_six_digits() {
        for _ in 0..200 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.bytes().all(|b| b.is_ascii_digit()));
        }
    }

    #[test]
    fn code_type_strings_are_stable() {
        assert_eq!(CodeType::Registration.as_str(), "registration");
        assert_eq!(CodeType::PasswordReset.as_str(), "password_reset");
        assert_eq!(CodeType::EmailChange.as_str(), "email_change");
    }
}
