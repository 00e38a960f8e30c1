//! In-process TTL cache (the L1 tier).
//!
//! An entry whose deadline has passed is a miss: `get` evicts it lazily, and
//! a periodic sweep clears out anything reads never touch again.

use std::{
    collections::HashMap,
    sync::RwLock,
    time::{Duration, Instant},
};

struct L1Entry {
    value: serde_json::Value,
    expires_at: Instant,
}

#[derive(Default)]
pub struct L1Cache {
    entries: RwLock<HashMap<String, L1Entry>>,
}

impl L1Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let expired = {
            let entries = self.entries.read().ok()?;
            match entries.get(key) {
                None => return None,
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.value.clone());
                },
                Some(_) => true,
            }
        };
        if expired && let Ok(mut entries) = self.entries.write() {
            // Re-check under the write lock; a concurrent set may have
            // refreshed the entry.
            if entries
                .get(key)
                .is_some_and(|e| e.expires_at <= Instant::now())
            {
                entries.remove(key);
            }
        }
        None
    }

    pub fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                key.to_string(),
                L1Entry {
                    value,
                    expires_at: Instant::now() + ttl,
                },
            );
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries
            .write()
            .map(|mut entries| entries.remove(key).is_some())
            .unwrap_or(false)
    }

    /// Drop all expired entries; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        self.entries
            .write()
            .map(|mut entries| {
                let before = entries.len();
                entries.retain(|_, entry| entry.expires_at > now);
                before - entries.len()
            })
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
