//! Shared utilities used across the roost crates: error-context plumbing and
//! epoch-time helpers for the wire protocol's integer timestamps.

pub mod error;

pub use error::FromMessage;

/// Current seconds since the Unix epoch.
pub fn epoch_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Current milliseconds since the Unix epoch.
pub fn epoch_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
