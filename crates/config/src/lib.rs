//! Configuration loading, env overrides, and debounced hot reload.
//!
//! Config files: `roost.toml`, `roost.yaml`, or `roost.json`
//! Searched in `./` then `~/.config/roost/`.
//!
//! Environment variables override file values (`ROOST_DB_HOST` →
//! `database.host`, etc.). A change to the file after load is picked up by a
//! debounced watcher and swapped into the shared handle; components read
//! dynamic values through [`SharedConfig`] on use rather than caching them.

pub mod env;
pub mod loader;
pub mod schema;
pub mod watch;

pub use {
    env::apply_env_overrides,
    loader::{config_dir, discover_and_load, find_config_file, load_config},
    schema::{
        DatabaseConfig, LoggingConfig, RedisConfig, RoostConfig, SecurityConfig, ServerConfig,
        SessionConfig, SmtpConfig,
    },
    watch::{ConfigWatcher, SharedConfig},
};
