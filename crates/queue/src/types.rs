use serde::Serialize;

/// Delivery priority. Bands are serviced strictly in declaration order, so
/// the derived `Ord` (Critical < High < Normal < Low) is load-bearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    pub fn index(self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

/// Where a message should go. The acceptor resolves users through its
/// `user_id → client` index; client targets address one connection directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    User(String),
    Client(String),
}

/// One queued outbound message. Held in memory only; no durability.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub message_id: String,
    pub target: Target,
    pub payload: serde_json::Value,
    pub priority: Priority,
    /// Epoch milliseconds at enqueue time.
    pub enqueued_at: i64,
    /// Retries performed so far (0 for the first attempt).
    pub retry_count: u32,
}
