//! TCP acceptor: owns the client table, accepts (optionally TLS-wrapped)
//! sockets, enforces the connection cap, runs the heartbeat sweep, and is the
//! delivery sink for the outbound queue.
//!
//! The table holds both indices, `client_id -> handle` and
//! `user_id -> client_id`, behind one mutex. Critical sections only touch the
//! indices; enumerations copy what they need under the lock and do the actual
//! work (sends, closes) outside it.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use {
    async_trait::async_trait,
    futures::SinkExt,
    tokio::{net::TcpListener, sync::mpsc},
    tokio_util::{codec::FramedWrite, sync::CancellationToken},
    tracing::{debug, error, info, warn},
};

use {
    roost_config::SharedConfig,
    roost_protocol::{EnvelopeCodec, actions},
    roost_queue::{Delivery, OutboundMessage, Target},
};

use crate::{
    client::{self, ClientHandle, ClientShared, ClientState, OutboundFrame},
    dispatch::Dispatch,
    events::{EventBus, ServerEvent},
};

// ── Client table ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct Tables {
    by_client: HashMap<String, ClientHandle>,
    by_user: HashMap<String, String>,
}

/// The acceptor-owned client table. Sole owner of client handles; everything
/// else addresses clients by id through this registry.
#[derive(Default)]
pub struct ClientRegistry {
    tables: Mutex<Tables>,
}

impl ClientRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, handle: ClientHandle) {
        if let Ok(mut tables) = self.tables.lock() {
            tables
                .by_client
                .insert(handle.shared.client_id.clone(), handle);
        }
    }

    /// Remove a client and any user binding pointing at it.
    pub fn remove(&self, client_id: &str) -> Option<ClientHandle> {
        let mut tables = self.tables.lock().ok()?;
        let handle = tables.by_client.remove(client_id);
        tables.by_user.retain(|_, bound| bound != client_id);
        handle
    }

    /// Bind `user_id` to a connection after successful authentication. A
    /// previous binding for the same user is replaced.
    pub fn bind_user(&self, user_id: &str, client_id: &str) {
        if let Ok(mut tables) = self.tables.lock() {
            tables
                .by_user
                .insert(user_id.to_string(), client_id.to_string());
        }
    }

    /// Drop a user binding, but only if it still points at `client_id`.
    pub fn unbind_user(&self, user_id: &str, client_id: &str) {
        if let Ok(mut tables) = self.tables.lock()
            && tables.by_user.get(user_id).is_some_and(|c| c == client_id)
        {
            tables.by_user.remove(user_id);
        }
    }

    pub fn get(&self, client_id: &str) -> Option<ClientHandle> {
        self.tables
            .lock()
            .ok()
            .and_then(|tables| tables.by_client.get(client_id).cloned())
    }

    pub fn get_by_user(&self, user_id: &str) -> Option<ClientHandle> {
        let tables = self.tables.lock().ok()?;
        let client_id = tables.by_user.get(user_id)?;
        tables.by_client.get(client_id).cloned()
    }

    pub fn client_count(&self) -> usize {
        self.tables.lock().map(|t| t.by_client.len()).unwrap_or(0)
    }

    pub fn authenticated_count(&self) -> usize {
        self.tables.lock().map(|t| t.by_user.len()).unwrap_or(0)
    }

    /// Snapshot of all handles; taken under the lock, used outside it.
    pub fn all_handles(&self) -> Vec<ClientHandle> {
        self.tables
            .lock()
            .map(|t| t.by_client.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of authenticated handles only.
    pub fn authenticated_handles(&self) -> Vec<ClientHandle> {
        self.tables
            .lock()
            .map(|t| {
                t.by_user
                    .values()
                    .filter_map(|client_id| t.by_client.get(client_id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ── Server ───────────────────────────────────────────────────────────────────

struct RunningServer {
    shutdown: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

pub struct TcpServer {
    config: SharedConfig,
    handler: Arc<dyn Dispatch>,
    registry: Arc<ClientRegistry>,
    events: EventBus,
    tls: Option<tokio_rustls::TlsAcceptor>,
    run: Mutex<Option<RunningServer>>,
    started_at: Mutex<Option<Instant>>,
    local_addr: Mutex<Option<SocketAddr>>,
    total_connections: AtomicU64,
    total_messages: AtomicU64,
}

impl TcpServer {
    pub fn new(
        config: SharedConfig,
        handler: Arc<dyn Dispatch>,
        registry: Arc<ClientRegistry>,
        events: EventBus,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler,
            registry,
            events,
            tls: tls.map(tokio_rustls::TlsAcceptor::from),
            run: Mutex::new(None),
            started_at: Mutex::new(None),
            local_addr: Mutex::new(None),
            total_connections: AtomicU64::new(0),
            total_messages: AtomicU64::new(0),
        })
    }

    /// The bound address while running (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|a| *a)
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    /// Bind and start accepting. Re-binding after `stop` is supported.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        {
            let run = self.run.lock().ok();
            if run.as_ref().is_some_and(|r| r.is_some()) {
                anyhow::bail!("server already running");
            }
        }

        let cfg = self.config.get();
        let addr: SocketAddr = format!("{}:{}", cfg.server.bind_address, cfg.server.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid bind address: {e}"))?;
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let mut tasks = Vec::with_capacity(2);

        let server = Arc::clone(self);
        let accept_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            server.accept_loop(listener, accept_shutdown).await;
        }));

        let server = Arc::clone(self);
        let sweep_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            server.heartbeat_sweep(sweep_shutdown).await;
        }));

        if let Ok(mut started) = self.started_at.lock() {
            *started = Some(Instant::now());
        }
        if let Ok(mut addr) = self.local_addr.lock() {
            *addr = Some(local);
        }
        if let Ok(mut run) = self.run.lock() {
            *run = Some(RunningServer { shutdown, tasks });
        }

        info!(
            addr = %local,
            tls = self.tls.is_some(),
            max_clients = cfg.server.max_clients,
            "server listening"
        );
        Ok(())
    }

    /// Stop accepting and disconnect every client.
    pub async fn stop(&self) {
        let running = self.run.lock().ok().and_then(|mut run| run.take());
        let Some(running) = running else {
            return;
        };
        info!("stopping server");
        running.shutdown.cancel();

        for handle in self.registry.all_handles() {
            handle.close(Some("Server shutting down"));
        }

        for task in running.tasks {
            task.abort();
            let _ = task.await;
        }
        if let Ok(mut started) = self.started_at.lock() {
            *started = None;
        }
        info!("server stopped");
    }

    /// Send `payload` to every authenticated client. Returns how many sends
    /// were queued. Ordering across recipients is not defined.
    pub fn broadcast(&self, payload: &serde_json::Value) -> usize {
        let handles = self.registry.authenticated_handles();
        let mut delivered = 0;
        for handle in handles {
            if handle.send(payload.clone()) {
                delivered += 1;
            }
        }
        self.total_messages
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub fn send_to_user(&self, user_id: &str, payload: serde_json::Value) -> bool {
        match self.registry.get_by_user(user_id) {
            Some(handle) if handle.shared.is_authenticated() => {
                let sent = handle.send(payload);
                if sent {
                    self.total_messages.fetch_add(1, Ordering::Relaxed);
                }
                sent
            },
            _ => {
                debug!(user_id, "cannot deliver, user not connected");
                false
            },
        }
    }

    pub fn disconnect_user(&self, user_id: &str) -> bool {
        match self.registry.get_by_user(user_id) {
            Some(handle) => {
                handle.close(Some("Disconnected by server"));
                true
            },
            None => false,
        }
    }

    pub fn statistics(&self) -> serde_json::Value {
        let cfg = self.config.get();
        let uptime = self
            .started_at
            .lock()
            .ok()
            .and_then(|s| *s)
            .map(|s| s.elapsed().as_secs())
            .unwrap_or(0);
        serde_json::json!({
            "client_count": self.registry.client_count(),
            "authenticated_count": self.registry.authenticated_count(),
            "total_connections": self.total_connections.load(Ordering::Relaxed),
            "total_messages": self.total_messages.load(Ordering::Relaxed),
            "uptime_seconds": uptime,
            "max_clients": cfg.server.max_clients,
            "heartbeat_interval": cfg.server.heartbeat_interval,
            "tls": self.tls.is_some(),
        })
    }

    // ── Accept loop ──────────────────────────────────────────────────────

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => return,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) if is_transient_accept_error(&e) => continue,
                Err(e) => {
                    // Accept errors never take the acceptor down.
                    error!(error = %e, "accept error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                },
            };

            let cfg = self.config.get();
            if self.registry.client_count() >= cfg.server.max_clients {
                warn!(peer = %peer, max = cfg.server.max_clients, "connection rejected, at capacity");
                self.events.publish(ServerEvent::ConnectionRejected {
                    ip: peer.ip().to_string(),
                });
                let max_clients = cfg.server.max_clients;
                tokio::spawn(async move {
                    send_rejection(stream, max_clients).await;
                });
                continue;
            }

            self.total_connections.fetch_add(1, Ordering::Relaxed);
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.launch_client(stream, peer).await;
            });
        }
    }

    /// Register a client and run its connection task, TLS-wrapping first when
    /// configured. Per-client errors end here.
    async fn launch_client(self: Arc<Self>, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let cfg = self.config.get();
        let io_timeout = Duration::from_secs(cfg.server.io_timeout.max(1));

        let client_id = client::generate_client_id();
        let shared = ClientShared::new(client_id.clone(), peer.ip().to_string());
        let (tx, rx) = mpsc::unbounded_channel::<OutboundFrame>();
        self.registry
            .insert(ClientHandle::new(Arc::clone(&shared), tx));
        self.events.publish(ServerEvent::ClientConnected {
            client_id: client_id.clone(),
            ip: peer.ip().to_string(),
        });

        match &self.tls {
            Some(acceptor) => {
                let accepted =
                    tokio::time::timeout(io_timeout, acceptor.accept(stream)).await;
                match accepted {
                    Ok(Ok(tls_stream)) => {
                        client::run_connection(
                            tls_stream,
                            shared,
                            rx,
                            Arc::clone(&self.handler),
                            self.registry(),
                            io_timeout,
                        )
                        .await;
                    },
                    Ok(Err(e)) => {
                        debug!(peer = %peer, error = %e, "TLS handshake failed");
                        shared.set_state(ClientState::Error);
                        self.registry.remove(&client_id);
                    },
                    Err(_) => {
                        debug!(peer = %peer, "TLS handshake timed out");
                        shared.set_state(ClientState::Error);
                        self.registry.remove(&client_id);
                    },
                }
            },
            None => {
                client::run_connection(
                    stream,
                    shared,
                    rx,
                    Arc::clone(&self.handler),
                    self.registry(),
                    io_timeout,
                )
                .await;
            },
        }

        self.events
            .publish(ServerEvent::ClientDisconnected { client_id });
    }

    /// Disconnect clients whose last activity is older than three heartbeat
    /// intervals. The interval is re-read each tick so config reloads apply.
    async fn heartbeat_sweep(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let interval_ms = self.config.get().server.heartbeat_interval.max(1000);
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => {},
            }

            let timeout_ms = interval_ms.saturating_mul(3) as i64;
            let stale: Vec<ClientHandle> = self
                .registry
                .all_handles()
                .into_iter()
                .filter(|handle| handle.shared.idle_ms() > timeout_ms)
                .collect();

            for handle in stale {
                warn!(
                    client_id = %handle.shared.client_id,
                    idle_ms = handle.shared.idle_ms(),
                    "heartbeat timeout"
                );
                self.events.publish(ServerEvent::HeartbeatTimeout {
                    client_id: handle.shared.client_id.clone(),
                });
                handle.close(Some("Heartbeat timeout"));
            }
        }
    }
}

/// Single `connection_rejected` frame, then close.
async fn send_rejection(stream: tokio::net::TcpStream, max_clients: usize) {
    let mut framed = FramedWrite::new(stream, EnvelopeCodec);
    let frame = serde_json::json!({
        "action": actions::CONNECTION_REJECTED,
        "reason": "Server at maximum capacity",
        "max_clients": max_clients,
    });
    if let Err(e) = framed.send(frame).await {
        debug!(error = %e, "failed to send rejection frame");
    }
    let _ = tokio::io::AsyncWriteExt::shutdown(&mut framed.into_inner()).await;
}

fn is_transient_accept_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
    )
}

// ── Queue delivery ───────────────────────────────────────────────────────────

#[async_trait]
impl Delivery for TcpServer {
    async fn deliver(&self, message: &OutboundMessage) -> bool {
        match &message.target {
            Target::User(user_id) => self.send_to_user(user_id, message.payload.clone()),
            Target::Client(client_id) => match self.registry.get(client_id) {
                Some(handle) => {
                    let sent = handle.send(message.payload.clone());
                    if sent {
                        self.total_messages.fetch_add(1, Ordering::Relaxed);
                    }
                    sent
                },
                None => false,
            },
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn handle(client_id: &str) -> (ClientHandle, mpsc::UnboundedReceiver<OutboundFrame>) {
        let shared = ClientShared::new(client_id.into(), "127.0.0.1".into());
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientHandle::new(shared, tx), rx)
    }

    #[test]
    fn registry_indexes_clients_and_users() {
        let registry = ClientRegistry::new();
        let (h1, _rx1) = handle("c1");
        let (h2, _rx2) = handle("c2");
        registry.insert(h1);
        registry.insert(h2);
        assert_eq!(registry.client_count(), 2);

        registry.bind_user("000000001", "c1");
        assert_eq!(registry.authenticated_count(), 1);
        assert_eq!(
            registry.get_by_user("000000001").unwrap().shared.client_id,
            "c1"
        );

        // Rebinding the user to another connection replaces the index entry.
        registry.bind_user("000000001", "c2");
        assert_eq!(
            registry.get_by_user("000000001").unwrap().shared.client_id,
            "c2"
        );

        // Removing a client clears bindings that point at it.
        registry.remove("c2");
        assert!(registry.get_by_user("000000001").is_none());
        assert_eq!(registry.client_count(), 1);
    }

    #[test]
    fn unbind_only_matches_own_connection() {
        let registry = ClientRegistry::new();
        let (h1, _rx1) = handle("c1");
        registry.insert(h1);
        registry.bind_user("u1", "c1");

        // A stale unbind from another connection must not clear the binding.
        registry.unbind_user("u1", "c9");
        assert!(registry.get_by_user("u1").is_some());

        registry.unbind_user("u1", "c1");
        assert!(registry.get_by_user("u1").is_none());
    }

    #[test]
    fn snapshots_are_taken_not_borrowed() {
        let registry = ClientRegistry::new();
        let (h1, _rx1) = handle("c1");
        registry.insert(h1);
        let handles = registry.all_handles();
        // Mutating the registry while holding the snapshot is fine.
        registry.remove("c1");
        assert_eq!(handles.len(), 1);
    }
}
