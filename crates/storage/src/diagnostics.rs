//! Database error classification and circuit breaking.
//!
//! Backend failures are sorted into coarse kinds, each with a recovery
//! strategy and an error budget. When a kind exhausts its budget inside one
//! observation window the circuit for that kind opens, letting callers shed
//! work instead of hammering a failing backend; the window reset closes it
//! again.

use std::sync::{
    Mutex,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use tracing::{error, warn};

/// Coarse classification of a backend failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbErrorKind {
    Connection,
    Timeout,
    Deadlock,
    Constraint,
    Permission,
    Syntax,
    Resource,
    Unknown,
}

/// What a caller should do about a failure of this kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Transient: retry the operation on the same connection.
    Retry,
    /// The connection is suspect: discard it and reconnect.
    Reconnect,
    /// Data-level conflict: surface to the caller, retrying cannot help.
    Surface,
}

const KIND_COUNT: usize = 8;

impl DbErrorKind {
    fn index(self) -> usize {
        match self {
            Self::Connection => 0,
            Self::Timeout => 1,
            Self::Deadlock => 2,
            Self::Constraint => 3,
            Self::Permission => 4,
            Self::Syntax => 5,
            Self::Resource => 6,
            Self::Unknown => 7,
        }
    }

    pub fn recovery(self) -> Recovery {
        match self {
            Self::Connection | Self::Resource => Recovery::Reconnect,
            Self::Timeout | Self::Deadlock => Recovery::Retry,
            Self::Constraint | Self::Permission | Self::Syntax | Self::Unknown => {
                Recovery::Surface
            },
        }
    }

    /// Errors of this kind tolerated per observation window before the
    /// circuit opens.
    pub fn threshold(self) -> u64 {
        match self {
            Self::Connection => 10,
            Self::Timeout => 5,
            Self::Deadlock => 3,
            Self::Constraint => 20,
            Self::Permission => 5,
            Self::Syntax => 10,
            Self::Resource => 8,
            Self::Unknown => 15,
        }
    }

    const ALL: [Self; KIND_COUNT] = [
        Self::Connection,
        Self::Timeout,
        Self::Deadlock,
        Self::Constraint,
        Self::Permission,
        Self::Syntax,
        Self::Resource,
        Self::Unknown,
    ];
}

/// Sort a sqlx error into a [`DbErrorKind`] by shape first, message second.
pub fn classify(err: &sqlx::Error) -> DbErrorKind {
    match err {
        sqlx::Error::PoolTimedOut => return DbErrorKind::Timeout,
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) => return DbErrorKind::Connection,
        sqlx::Error::Database(db) => {
            if let Some(code) = db.code() {
                // MySQL SQLSTATE classes: 23 integrity, 42 syntax/access,
                // 40001 deadlock, 28000 auth.
                if code.starts_with("23") {
                    return DbErrorKind::Constraint;
                }
                if code.as_ref() == "40001" {
                    return DbErrorKind::Deadlock;
                }
                if code.as_ref() == "28000" {
                    return DbErrorKind::Permission;
                }
                if code.starts_with("42") {
                    return DbErrorKind::Syntax;
                }
            }
        },
        _ => {},
    }
    classify_message(&err.to_string())
}

fn classify_message(message: &str) -> DbErrorKind {
    let text = message.to_ascii_lowercase();
    if text.contains("connection") || text.contains("network") {
        DbErrorKind::Connection
    } else if text.contains("timeout") || text.contains("timed out") {
        DbErrorKind::Timeout
    } else if text.contains("deadlock") || text.contains("lock wait") {
        DbErrorKind::Deadlock
    } else if text.contains("constraint")
        || text.contains("duplicate")
        || text.contains("unique")
        || text.contains("foreign key")
    {
        DbErrorKind::Constraint
    } else if text.contains("access denied")
        || text.contains("permission")
        || text.contains("privilege")
    {
        DbErrorKind::Permission
    } else if text.contains("syntax") {
        DbErrorKind::Syntax
    } else if text.contains("memory") || text.contains("disk") || text.contains("space") {
        DbErrorKind::Resource
    } else {
        DbErrorKind::Unknown
    }
}

/// Per-kind error counters with circuit breaking. The owner resets the
/// window periodically (the pool folds this into its health tick).
pub struct ErrorMonitor {
    window_counts: [AtomicU64; KIND_COUNT],
    total_counts: [AtomicU64; KIND_COUNT],
    broken: [AtomicBool; KIND_COUNT],
    // Guards the warn-once-per-trip transition.
    trip_lock: Mutex<()>,
}

impl Default for ErrorMonitor {
    fn default() -> Self {
        Self {
            window_counts: [const { AtomicU64::new(0) }; KIND_COUNT],
            total_counts: [const { AtomicU64::new(0) }; KIND_COUNT],
            broken: [const { AtomicBool::new(false) }; KIND_COUNT],
            trip_lock: Mutex::new(()),
        }
    }
}

impl ErrorMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failure. Returns the recovery strategy for the kind.
    pub fn record(&self, kind: DbErrorKind) -> Recovery {
        let i = kind.index();
        self.total_counts[i].fetch_add(1, Ordering::Relaxed);
        let in_window = self.window_counts[i].fetch_add(1, Ordering::AcqRel) + 1;

        if in_window >= kind.threshold() && !self.broken[i].load(Ordering::Acquire) {
            let _guard = self.trip_lock.lock();
            if !self.broken[i].swap(true, Ordering::AcqRel) {
                error!(?kind, count = in_window, "database circuit opened");
            }
        } else if in_window == kind.threshold() / 2 {
            warn!(?kind, count = in_window, "database errors accumulating");
        }
        kind.recovery()
    }

    pub fn is_open(&self, kind: DbErrorKind) -> bool {
        self.broken[kind.index()].load(Ordering::Acquire)
    }

    /// Close all circuits and start a fresh observation window.
    pub fn reset_window(&self) {
        for kind in DbErrorKind::ALL {
            let i = kind.index();
            self.window_counts[i].store(0, Ordering::Release);
            if self.broken[i].swap(false, Ordering::AcqRel) {
                warn!(?kind, "database circuit closed after window reset");
            }
        }
    }

    /// Lifetime totals per kind, for statistics output.
    pub fn totals(&self) -> Vec<(DbErrorKind, u64)> {
        DbErrorKind::ALL
            .iter()
            .map(|&kind| (kind, self.total_counts[kind.index()].load(Ordering::Relaxed)))
            .collect()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_classification() {
        assert_eq!(
            classify_message("Lost connection to MySQL server"),
            DbErrorKind::Connection
        );
        assert_eq!(
            classify_message("Lock wait timeout exceeded"),
            DbErrorKind::Timeout
        );
        assert_eq!(
            classify_message("Deadlock found when trying to get lock"),
            DbErrorKind::Deadlock
        );
        assert_eq!(
            classify_message("Duplicate entry 'x' for key 'users.username'"),
            DbErrorKind::Constraint
        );
        assert_eq!(
            classify_message("Access denied for user 'roost'"),
            DbErrorKind::Permission
        );
        assert_eq!(classify_message("You have an error in your SQL syntax"), DbErrorKind::Syntax);
        assert_eq!(classify_message("Out of disk space"), DbErrorKind::Resource);
        assert_eq!(classify_message("something odd"), DbErrorKind::Unknown);
    }

    #[test]
    fn recovery_strategies() {
        assert_eq!(DbErrorKind::Connection.recovery(), Recovery::Reconnect);
        assert_eq!(DbErrorKind::Deadlock.recovery(), Recovery::Retry);
        assert_eq!(DbErrorKind::Constraint.recovery(), Recovery::Surface);
    }

    #[test]
    fn circuit_opens_at_threshold_and_closes_on_reset() {
        let monitor = ErrorMonitor::new();
        let kind = DbErrorKind::Deadlock; // threshold 3

        monitor.record(kind);
        monitor.record(kind);
        assert!(!monitor.is_open(kind));
        monitor.record(kind);
        assert!(monitor.is_open(kind));

        // Other kinds are unaffected.
        assert!(!monitor.is_open(DbErrorKind::Connection));

        monitor.reset_window();
        assert!(!monitor.is_open(kind));

        // Totals survive the reset.
        let totals = monitor.totals();
        let deadlocks = totals.iter().find(|(k, _)| *k == kind).unwrap().1;
        assert_eq!(deadlocks, 3);
    }
}
