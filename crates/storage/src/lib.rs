//! Relational storage: a bounded MySQL connection pool with health checks and
//! idle reaping, a transaction combinator, the user store, and the user-id
//! sequence generator.

pub mod diagnostics;
pub mod error;
pub mod pool;
pub mod sequence;
pub mod users;

pub use {
    diagnostics::{DbErrorKind, ErrorMonitor, Recovery, classify},
    error::StorageError,
    pool::{ConnectionPool, PoolOptions, PoolStatistics, PooledConnection},
    sequence::{SequenceEvent, UserIdGenerator, format_user_id, is_valid_user_id},
    users::{DuplicateField, NewUser, UserRecord, UserStatus, UserStore, classify_duplicate},
};

pub type Result<T> = std::result::Result<T, StorageError>;
