//! Shared config handle with debounced file-watch reload.
//!
//! Components hold a [`SharedConfig`] and call [`SharedConfig::get`] at the
//! point of use, so a reload takes effect without restarting anything. The
//! watcher only swaps the value and bumps a generation counter; interested
//! tasks can `subscribe()` for change notifications.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use {
    notify_debouncer_full::{
        DebounceEventResult, Debouncer, RecommendedCache, new_debouncer, notify::RecursiveMode,
    },
    tokio::sync::watch,
    tracing::{info, warn},
};

use crate::{loader::load_config, schema::RoostConfig};

/// Cloneable handle to the live configuration.
#[derive(Clone)]
pub struct SharedConfig {
    current: Arc<RwLock<Arc<RoostConfig>>>,
    generation: watch::Sender<u64>,
}

impl SharedConfig {
    pub fn new(config: RoostConfig) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
            generation,
        }
    }

    /// Snapshot of the current config. Cheap (one Arc clone); do not cache
    /// across await points if you want hot-reloaded values.
    pub fn get(&self) -> Arc<RoostConfig> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            // A poisoned lock can only mean a panic mid-swap; fall back to
            // the value that was being replaced.
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replace the live config and notify subscribers.
    pub fn replace(&self, config: RoostConfig) {
        if let Ok(mut guard) = self.current.write() {
            *guard = Arc::new(config);
        }
        self.generation.send_modify(|g| *g += 1);
    }

    /// Receiver that changes value whenever the config is replaced.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}

/// Watches a config file and reloads it into a [`SharedConfig`] on change.
pub struct ConfigWatcher {
    _debouncer: Debouncer<notify_debouncer_full::notify::RecommendedWatcher, RecommendedCache>,
}

impl ConfigWatcher {
    /// Start watching `path` with a debounce of at least one second.
    ///
    /// The watcher must be kept alive (not dropped) for reloads to continue.
    pub fn start(path: &Path, shared: SharedConfig) -> anyhow::Result<Self> {
        let watched: PathBuf = path.to_path_buf();
        let reload_path = watched.clone();

        let mut debouncer = new_debouncer(
            std::time::Duration::from_secs(1),
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    if !events
                        .iter()
                        .any(|e| e.paths.iter().any(|p| p == &reload_path))
                    {
                        return;
                    }
                    match load_config(&reload_path) {
                        Ok(config) => {
                            info!(path = %reload_path.display(), "config reloaded");
                            shared.replace(config);
                        },
                        Err(e) => {
                            warn!(path = %reload_path.display(), error = %e, "config reload failed, keeping previous");
                        },
                    }
                },
                Err(errors) => {
                    for e in errors {
                        warn!(error = %e, "config watcher error");
                    }
                },
            },
        )?;

        // Watch the parent directory: editors often replace the file inode.
        let watch_dir = watched
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        debouncer.watch(watch_dir, RecursiveMode::NonRecursive)?;
        info!(path = %watched.display(), "config watcher started");

        Ok(Self {
            _debouncer: debouncer,
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_bumps_generation_and_swaps_value() {
        let shared = SharedConfig::new(RoostConfig::default());
        let mut rx = shared.subscribe();
        assert_eq!(*rx.borrow_and_update(), 0);

        let mut next = RoostConfig::default();
        next.server.port = 9999;
        shared.replace(next);

        assert!(rx.has_changed().unwrap());
        assert_eq!(shared.get().server.port, 9999);
    }

    #[tokio::test]
    async fn watcher_reloads_on_file_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roost.toml");
        std::fs::write(&path, "[server]\nport = 1000\n").unwrap();

        let shared = SharedConfig::new(load_config(&path).unwrap());
        let _watcher = ConfigWatcher::start(&path, shared.clone()).unwrap();
        let mut rx = shared.subscribe();

        std::fs::write(&path, "[server]\nport = 2000\n").unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), rx.changed())
            .await
            .expect("reload notification")
            .unwrap();
        assert_eq!(shared.get().server.port, 2000);
    }
}
