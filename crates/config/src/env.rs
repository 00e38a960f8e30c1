//! Environment-variable overrides for config keys.
//!
//! Each `ROOST_*` variable maps onto one dotted config key and wins over the
//! file value. Unparseable numeric/boolean values are logged and ignored.

use tracing::warn;

use crate::schema::RoostConfig;

/// Apply all recognized `ROOST_*` overrides from the process environment.
pub fn apply_env_overrides(config: &mut RoostConfig) {
    apply_overrides_from(config, |var| std::env::var(var).ok());
}

/// Apply overrides from an arbitrary lookup (the process env in production,
/// a map in tests).
pub fn apply_overrides_from<F>(config: &mut RoostConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    set_string(&lookup, "ROOST_BIND_ADDRESS", &mut config.server.bind_address);
    set_parsed(&lookup, "ROOST_PORT", &mut config.server.port);
    set_parsed(&lookup, "ROOST_MAX_CLIENTS", &mut config.server.max_clients);
    set_parsed(&lookup, "ROOST_USE_TLS", &mut config.server.use_tls);

    set_string(&lookup, "ROOST_DB_HOST", &mut config.database.host);
    set_parsed(&lookup, "ROOST_DB_PORT", &mut config.database.port);
    set_string(&lookup, "ROOST_DB_NAME", &mut config.database.name);
    set_string(&lookup, "ROOST_DB_USERNAME", &mut config.database.username);
    set_string(&lookup, "ROOST_DB_PASSWORD", &mut config.database.password);
    set_parsed(&lookup, "ROOST_DB_POOL_SIZE", &mut config.database.pool_size);

    set_string(&lookup, "ROOST_REDIS_HOST", &mut config.redis.host);
    set_parsed(&lookup, "ROOST_REDIS_PORT", &mut config.redis.port);
    set_string(&lookup, "ROOST_REDIS_PASSWORD", &mut config.redis.password);
    set_parsed(&lookup, "ROOST_REDIS_DATABASE", &mut config.redis.database);

    set_string(&lookup, "ROOST_SMTP_HOST", &mut config.smtp.host);
    set_parsed(&lookup, "ROOST_SMTP_PORT", &mut config.smtp.port);
    set_string(&lookup, "ROOST_SMTP_USERNAME", &mut config.smtp.username);
    set_string(&lookup, "ROOST_SMTP_PASSWORD", &mut config.smtp.password);
    set_parsed(&lookup, "ROOST_SMTP_USE_TLS", &mut config.smtp.use_tls);

    set_string(&lookup, "ROOST_LOG_LEVEL", &mut config.logging.level);
    set_parsed(&lookup, "ROOST_LOG_JSON", &mut config.logging.json_format);
    set_string(&lookup, "ROOST_LOG_DIRECTORY", &mut config.logging.directory);
}

fn set_string<F>(lookup: &F, var: &str, target: &mut String)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(var)
        && !value.is_empty()
    {
        *target = value;
    }
}

fn set_parsed<F, T: std::str::FromStr>(lookup: &F, var: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(var) else {
        return;
    };
    match value.parse() {
        Ok(parsed) => *target = parsed,
        Err(_) => warn!(var, value, "ignoring unparseable environment override"),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn overrides_win_over_file_values() {
        let mut cfg = RoostConfig::default();
        apply_overrides_from(
            &mut cfg,
            lookup_from(&[
                ("ROOST_DB_HOST", "db.example.com"),
                ("ROOST_PORT", "9100"),
                ("ROOST_USE_TLS", "false"),
                ("ROOST_REDIS_PASSWORD", "s3cret"),
            ]),
        );

        assert_eq!(cfg.database.host, "db.example.com");
        assert_eq!(cfg.server.port, 9100);
        assert!(!cfg.server.use_tls);
        assert_eq!(cfg.redis.password, "s3cret");
    }

    #[test]
    fn unparseable_values_are_ignored() {
        let mut cfg = RoostConfig::default();
        apply_overrides_from(
            &mut cfg,
            lookup_from(&[("ROOST_MAX_CLIENTS", "not-a-number")]),
        );
        assert_eq!(cfg.server.max_clients, 1000);
    }

    #[test]
    fn empty_strings_do_not_clobber() {
        let mut cfg = RoostConfig::default();
        cfg.database.host = "keep-me".into();
        apply_overrides_from(&mut cfg, lookup_from(&[("ROOST_DB_HOST", "")]));
        assert_eq!(cfg.database.host, "keep-me");
    }
}
