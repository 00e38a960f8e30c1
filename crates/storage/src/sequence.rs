//! Monotonic 9-digit user-id generator.
//!
//! Ids come from a singleton sequence row advanced under a row-level lock
//! (`SELECT ... FOR UPDATE`), so concurrent callers can never observe the
//! same value and the sequence never moves backwards. Exhaustion is fatal to
//! registration only; the rest of the server keeps running.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use {
    futures::FutureExt,
    tokio::sync::broadcast,
    tracing::{error, warn},
};

use crate::{error::StorageError, pool::ConnectionPool};

/// Largest assignable id (nine digits).
pub const MAX_USER_ID: i64 = 999_999_999;
const WARNING_THRESHOLD: i64 = 1000;
const CRITICAL_THRESHOLD: i64 = 100;

/// Edge-triggered sequence health signals.
#[derive(Debug, Clone)]
pub enum SequenceEvent {
    NearExhaustion { remaining: i64 },
    Critical { remaining: i64 },
    Exhausted,
}

/// Zero-pad an id number to the canonical 9-digit form.
pub fn format_user_id(id: i64) -> String {
    format!("{id:09}")
}

/// A valid user id is exactly nine ASCII digits within the sequence range.
pub fn is_valid_user_id(user_id: &str) -> bool {
    user_id.len() == 9
        && user_id.bytes().all(|b| b.is_ascii_digit())
        && user_id.parse::<i64>().is_ok_and(|v| v <= MAX_USER_ID)
}

pub struct UserIdGenerator {
    pool: ConnectionPool,
    warning_emitted: AtomicBool,
    critical_emitted: AtomicBool,
    events: broadcast::Sender<SequenceEvent>,
}

impl UserIdGenerator {
    pub fn new(pool: ConnectionPool) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            pool,
            warning_emitted: AtomicBool::new(false),
            critical_emitted: AtomicBool::new(false),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SequenceEvent> {
        self.events.subscribe()
    }

    /// Create the singleton row when absent.
    pub async fn ensure_initialized(&self) -> Result<(), StorageError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(
            "INSERT INTO user_id_sequence (id, current_id, max_id) VALUES (1, 0, ?)
             ON DUPLICATE KEY UPDATE current_id = current_id",
        )
        .bind(MAX_USER_ID)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Advance the sequence and return the next id, formatted.
    pub async fn next_id(&self) -> Result<String, StorageError> {
        let next = self
            .pool
            .transaction(|conn| {
                async move {
                    let (current_id, max_id): (i64, i64) = sqlx::query_as(
                        "SELECT current_id, max_id FROM user_id_sequence WHERE id = 1 FOR UPDATE",
                    )
                    .fetch_one(&mut *conn)
                    .await?;

                    let next = current_id + 1;
                    if next > max_id {
                        return Err(StorageError::SequenceExhausted);
                    }

                    sqlx::query(
                        "UPDATE user_id_sequence SET current_id = ?, updated_at = NOW() WHERE id = 1",
                    )
                    .bind(next)
                    .execute(&mut *conn)
                    .await?;

                    Ok(next)
                }
                .boxed()
            })
            .await;

        match next {
            Ok(next) => {
                self.check_thresholds(next);
                Ok(format_user_id(next))
            },
            Err(StorageError::SequenceExhausted) => {
                error!("user id sequence exhausted, registration disabled");
                let _ = self.events.send(SequenceEvent::Exhausted);
                Err(StorageError::SequenceExhausted)
            },
            Err(e) => Err(e),
        }
    }

    /// Current position: (current, max, remaining).
    pub async fn sequence_status(&self) -> Result<(i64, i64, i64), StorageError> {
        let mut conn = self.pool.acquire().await?;
        let (current_id, max_id): (i64, i64) =
            sqlx::query_as("SELECT current_id, max_id FROM user_id_sequence WHERE id = 1")
                .fetch_one(&mut *conn)
                .await?;
        Ok((current_id, max_id, max_id - current_id))
    }

    /// Reset the sequence to `start_id` and re-arm the threshold warnings.
    pub async fn reset_sequence(&self, start_id: i64) -> Result<(), StorageError> {
        if !(0..=MAX_USER_ID).contains(&start_id) {
            return Err(StorageError::TransactionAborted(format!(
                "invalid sequence start {start_id}"
            )));
        }
        let mut conn = self.pool.acquire().await?;
        sqlx::query("UPDATE user_id_sequence SET current_id = ?, updated_at = NOW() WHERE id = 1")
            .bind(start_id)
            .execute(&mut *conn)
            .await?;
        warn!(start_id, "user id sequence reset");
        self.warning_emitted.store(false, Ordering::Release);
        self.critical_emitted.store(false, Ordering::Release);
        Ok(())
    }

    /// Emit near-exhaustion signals once per threshold crossing.
    fn check_thresholds(&self, current: i64) {
        let remaining = MAX_USER_ID - current;
        if remaining <= CRITICAL_THRESHOLD {
            if self
                .critical_emitted
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                error!(remaining, "user id sequence critically low");
                let _ = self.events.send(SequenceEvent::Critical { remaining });
            }
        } else if remaining <= WARNING_THRESHOLD
            && self
                .warning_emitted
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            warn!(remaining, "user id sequence running low");
            let _ = self.events.send(SequenceEvent::NearExhaustion { remaining });
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_nine_digits() {
        assert_eq!(format_user_id(1), "000000001");
        assert_eq!(format_user_id(123_456_789), "123456789");
        assert_eq!(format_user_id(999_999_999), "999999999");
    }

    #[test]
    fn validates_user_id_format() {
        assert!(is_valid_user_id("000000001"));
        assert!(is_valid_user_id("999999999"));
        assert!(!is_valid_user_id("00000001"));
        assert!(!is_valid_user_id("0000000001"));
        assert!(!is_valid_user_id("00000000a"));
        assert!(!is_valid_user_id(""));
    }
}
