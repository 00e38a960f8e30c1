//! Time-decayed hot-key scoring.
//!
//! Each `(type, key)` pair accumulates an access count; its score is that
//! count scaled by a decay factor that stays at 1 for the first hour of
//! inactivity and then falls off hyperbolically. Scores are recomputed on
//! read, so a pair that was hot two hours ago ranks below a moderately busy
//! fresh one.

use std::{collections::HashMap, sync::RwLock};

/// Decay for an access `delta_secs` old:
/// 1 within an hour, then `1 / (1 + (delta - 3600) / 3600)`.
pub fn decay_factor(delta_secs: i64) -> f64 {
    if delta_secs <= 3600 {
        1.0
    } else {
        1.0 / (1.0 + (delta_secs - 3600) as f64 / 3600.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AccessStat {
    pub access_count: u64,
    pub last_access_at: i64,
}

impl AccessStat {
    pub fn score(&self, now: i64) -> f64 {
        self.access_count as f64 * decay_factor(now - self.last_access_at)
    }
}

#[derive(Default)]
pub struct HotKeyTracker {
    stats: RwLock<HashMap<(String, String), AccessStat>>,
}

impl HotKeyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_access(&self, kind: &str, key: &str, now: i64) {
        if let Ok(mut stats) = self.stats.write() {
            let entry = stats
                .entry((kind.to_string(), key.to_string()))
                .or_insert(AccessStat {
                    access_count: 0,
                    last_access_at: now,
                });
            entry.access_count += 1;
            entry.last_access_at = now;
        }
    }

    pub fn score(&self, kind: &str, key: &str, now: i64) -> f64 {
        self.stats
            .read()
            .ok()
            .and_then(|stats| {
                stats
                    .get(&(kind.to_string(), key.to_string()))
                    .map(|s| s.score(now))
            })
            .unwrap_or(0.0)
    }

    pub fn is_hot(&self, kind: &str, key: &str, threshold: f64, now: i64) -> bool {
        self.score(kind, key, now) >= threshold
    }

    /// Top `limit` keys of `kind` by score, descending.
    pub fn hot_list(&self, kind: &str, limit: usize, now: i64) -> Vec<(String, f64)> {
        let mut scored: Vec<(String, f64)> = self
            .stats
            .read()
            .map(|stats| {
                stats
                    .iter()
                    .filter(|((k, _), _)| k == kind)
                    .map(|((_, key), stat)| (key.clone(), stat.score(now)))
                    .collect()
            })
            .unwrap_or_default();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        scored
    }

    /// Replace the in-memory stats wholesale (restart repopulation).
    pub fn replace_all(&self, entries: Vec<(String, String, AccessStat)>) {
        if let Ok(mut stats) = self.stats.write() {
            stats.clear();
            for (kind, key, stat) in entries {
                stats.insert((kind, key), stat);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.stats.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decay_is_flat_for_an_hour_then_falls() {
        assert_eq!(decay_factor(0), 1.0);
        assert_eq!(decay_factor(3600), 1.0);
        // One extra hour halves the score.
        assert!((decay_factor(7200) - 0.5).abs() < 1e-9);
        // Two extra hours: a third.
        assert!((decay_factor(10_800) - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn hundred_recent_accesses_clear_threshold_fifty() {
        let tracker = HotKeyTracker::new();
        let now = 1_000_000;
        for _ in 0..100 {
            tracker.record_access("search", "rust", now);
        }
        assert!(tracker.is_hot("search", "rust", 50.0, now));
        // Still hot within the flat hour.
        assert!(tracker.is_hot("search", "rust", 50.0, now + 3600));
        // After two hours of inactivity the score has halved to exactly 50;
        // a bit later it is below threshold.
        assert!(!tracker.is_hot("search", "rust", 50.0, now + 7200 + 3600));
    }

    #[test]
    fn hot_list_ranks_by_score_and_respects_limit() {
        let tracker = HotKeyTracker::new();
        let now = 5_000_000;
        for _ in 0..30 {
            tracker.record_access("search", "busy", now);
        }
        for _ in 0..10 {
            tracker.record_access("search", "quiet", now);
        }
        // Stale but once-popular key.
        tracker.replace_all(vec![
            (
                "search".into(),
                "busy".into(),
                AccessStat {
                    access_count: 30,
                    last_access_at: now,
                },
            ),
            (
                "search".into(),
                "quiet".into(),
                AccessStat {
                    access_count: 10,
                    last_access_at: now,
                },
            ),
            (
                "search".into(),
                "stale".into(),
                AccessStat {
                    access_count: 100,
                    last_access_at: now - 8 * 3600,
                },
            ),
            (
                "user_info".into(),
                "alice".into(),
                AccessStat {
                    access_count: 999,
                    last_access_at: now,
                },
            ),
        ]);

        let list = tracker.hot_list("search", 2, now);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].0, "busy");
        // 100 accesses 8h ago decay to 100/8 = 12.5, beating quiet's 10.
        assert_eq!(list[1].0, "stale");
    }

    #[test]
    fn unknown_key_scores_zero() {
        let tracker = HotKeyTracker::new();
        assert_eq!(tracker.score("search", "nope", 0), 0.0);
        assert!(!tracker.is_hot("search", "nope", 0.1, 0));
    }
}
