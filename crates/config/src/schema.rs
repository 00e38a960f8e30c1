//! Config schema types with serde defaults for every key the server reads.

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoostConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub smtp: SmtpConfig,
    pub logging: LoggingConfig,
    pub security: SecurityConfig,
}

/// Listener settings for the TCP acceptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub bind_address: String,
    /// Hard cap on concurrently connected clients.
    pub max_clients: usize,
    /// Heartbeat tick in milliseconds; clients time out at 3x this value.
    pub heartbeat_interval: u64,
    pub use_tls: bool,
    /// Socket read/write deadline in seconds.
    pub io_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".into(),
            max_clients: 1000,
            heartbeat_interval: 30_000,
            use_tls: true,
            io_timeout: 10,
        }
    }
}

/// Backing relational store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub username: String,
    pub password: String,
    /// Upper bound on pooled connections.
    pub pool_size: usize,
    pub min_connections: usize,
    /// Acquire deadline in milliseconds.
    pub acquire_timeout: u64,
    /// Connections idle longer than this many seconds are reaped.
    pub idle_timeout: u64,
    /// Idle-connection validation tick in seconds.
    pub health_check_interval: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3306,
            name: "roost".into(),
            username: "roost".into(),
            password: String::new(),
            pool_size: 10,
            min_connections: 2,
            acquire_timeout: 5_000,
            idle_timeout: 600,
            health_check_interval: 60,
        }
    }
}

/// Session store and fast-path cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub database: u8,
}

impl RedisConfig {
    /// Connection URL in the form `redis://[:password@]host:port/db`.
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.database)
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                self.password, self.host, self.port, self.database
            )
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 6379,
            password: String::new(),
            database: 0,
        }
    }
}

/// Verification-code delivery collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
    /// Send deadline in seconds, independent of socket deadlines.
    pub timeout: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 465,
            username: String::new(),
            password: String::new(),
            use_tls: true,
            timeout: 15,
        }
    }
}

/// Logging sink settings, consumed by the binary's subscriber init.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub console_output: bool,
    pub json_format: bool,
    pub max_file_size: u64,
    pub retention_days: u32,
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            console_output: true,
            json_format: false,
            max_file_size: 50 * 1024 * 1024,
            retention_days: 14,
            directory: "logs".into(),
        }
    }
}

/// Security knobs: sessions, rate limiting, password policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub session: SessionConfig,
    pub rate_limit_enabled: bool,
    pub max_requests_per_minute: u32,
    pub password_min_length: usize,
    /// Minimum interval between verification-code sends, in seconds.
    pub code_send_interval: u64,
    /// Verification-code lifetime in minutes.
    pub code_expire_minutes: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            rate_limit_enabled: true,
            max_requests_per_minute: 60,
            password_min_length: 6,
            code_send_interval: 60,
            code_expire_minutes: 5,
        }
    }
}

/// Session lifetimes and caps. All durations in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub default_timeout: u64,
    pub remember_me_timeout: u64,
    pub activity_update_interval: u64,
    pub max_sessions_per_user: usize,
    pub cleanup_interval: u64,
    pub sliding_window: bool,
    pub multi_device_support: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_timeout: 7 * 24 * 3600,
            remember_me_timeout: 30 * 24 * 3600,
            activity_update_interval: 1800,
            max_sessions_per_user: 5,
            cleanup_interval: 3600,
            sliding_window: true,
            multi_device_support: true,
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RoostConfig::default();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.server.max_clients, 1000);
        assert_eq!(cfg.server.heartbeat_interval, 30_000);
        assert!(cfg.server.use_tls);
        assert_eq!(cfg.database.pool_size, 10);
        assert_eq!(cfg.security.session.default_timeout, 604_800);
        assert_eq!(cfg.security.session.remember_me_timeout, 2_592_000);
        assert_eq!(cfg.security.session.max_sessions_per_user, 5);
        assert!(cfg.security.session.sliding_window);
        assert_eq!(cfg.security.password_min_length, 6);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: RoostConfig = toml::from_str(
            r#"
            [server]
            port = 9000
            use_tls = false

            [database]
            host = "db.internal"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert!(!cfg.server.use_tls);
        assert_eq!(cfg.server.max_clients, 1000);
        assert_eq!(cfg.database.host, "db.internal");
        assert_eq!(cfg.database.port, 3306);
    }

    #[test]
    fn redis_url_with_and_without_password() {
        let mut redis = RedisConfig::default();
        assert_eq!(redis.url(), "redis://127.0.0.1:6379/0");
        redis.password = "hunter2".into();
        redis.database = 3;
        assert_eq!(redis.url(), "redis://:hunter2@127.0.0.1:6379/3");
    }
}
