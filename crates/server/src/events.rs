//! Typed server events, published on a broadcast channel so observers need no
//! coupling to the components that emit them.

use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum ServerEvent {
    ClientConnected { client_id: String, ip: String },
    ClientDisconnected { client_id: String },
    UserLoggedIn { user_id: String, client_id: String },
    UserLoggedOut { user_id: String, client_id: String },
    ConnectionRejected { ip: String },
    HeartbeatTimeout { client_id: String },
}

/// Shared event bus. Slow subscribers lag and drop, never block the server.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }
}
