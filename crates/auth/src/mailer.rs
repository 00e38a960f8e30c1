//! Mail-dispatch seam.
//!
//! The server only needs `send(to, subject, body)`; the actual SMTP transport
//! lives outside this repository. [`LogMailer`] stands in for deployments
//! without one; it records the dispatch instead of sending.

use {async_trait::async_trait, tracing::info};

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()>;
}

/// Logs outbound mail at info level. The body is deliberately not logged in
/// full; verification codes do not belong in log files.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        info!(to, subject, bytes = body.len(), "mail dispatched (log transport)");
        Ok(())
    }
}
