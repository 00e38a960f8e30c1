//! Per-connection state and the connection task.
//!
//! The acceptor owns each client through a [`ClientHandle`] in its table; the
//! connection task owns the socket. They communicate over an unbounded
//! channel of outbound frames, so anything holding a handle can send without
//! touching the socket, and the write loop is the single place that does I/O.
//!
//! Lifecycle:
//!
//! ```text
//! Initialized ── start ──▶ Connected
//! Connected ── auth ok ──▶ Authenticated
//! Connected ── auth fail ──▶ Connected
//! Connected | Authenticated ── peer close | error | heartbeat timeout ──▶ Disconnected
//! any ── fatal ──▶ Error ──▶ Disconnected
//! ```

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicI64, AtomicU64, Ordering},
};

use {
    futures::{SinkExt, StreamExt},
    tokio::{
        io::{AsyncRead, AsyncWrite},
        sync::mpsc,
    },
    tokio_util::{
        codec::{FramedRead, FramedWrite},
        sync::CancellationToken,
    },
    tracing::{debug, info, warn},
};

use roost_protocol::{DEDUPE_MAX_ENTRIES, DecodedFrame, Envelope, EnvelopeCodec, actions};

use crate::{
    acceptor::ClientRegistry,
    dedup::RecentRequests,
    dispatch::{AuthEffect, Dispatch},
};

static CLIENT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// `client_{epoch_ms}_{counter}`, unique per accept for the process life.
pub fn generate_client_id() -> String {
    format!(
        "client_{}_{}",
        roost_common::epoch_millis(),
        CLIENT_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Initialized,
    Connected,
    Authenticating,
    Authenticated,
    Disconnected,
    Error,
}

/// Frame headed for the write loop.
#[derive(Debug)]
pub enum OutboundFrame {
    Message(serde_json::Value),
    /// Flush and close the socket.
    Close,
}

/// State shared between the acceptor's table and the connection task.
pub struct ClientShared {
    pub client_id: String,
    pub peer_ip: String,
    state: Mutex<ClientState>,
    user_id: Mutex<Option<String>>,
    pub connected_at: std::time::Instant,
    last_activity_ms: AtomicI64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    /// Cancelled to force the connection down (server-initiated disconnect).
    pub closing: CancellationToken,
}

impl ClientShared {
    pub fn new(client_id: String, peer_ip: String) -> Arc<Self> {
        Arc::new(Self {
            client_id,
            peer_ip,
            state: Mutex::new(ClientState::Initialized),
            user_id: Mutex::new(None),
            connected_at: std::time::Instant::now(),
            last_activity_ms: AtomicI64::new(roost_common::epoch_millis()),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            closing: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> ClientState {
        self.state.lock().map(|s| *s).unwrap_or(ClientState::Error)
    }

    pub fn set_state(&self, state: ClientState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ClientState::Authenticated
    }

    pub fn user_id(&self) -> Option<String> {
        self.user_id.lock().ok().and_then(|u| u.clone())
    }

    pub fn set_user_id(&self, user_id: Option<String>) {
        if let Ok(mut guard) = self.user_id.lock() {
            *guard = user_id;
        }
    }

    pub fn touch(&self) {
        self.last_activity_ms
            .store(roost_common::epoch_millis(), Ordering::Release);
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity_ms.load(Ordering::Acquire)
    }

    /// Milliseconds since the last inbound activity.
    pub fn idle_ms(&self) -> i64 {
        roost_common::epoch_millis() - self.last_activity_ms()
    }

    pub fn info(&self) -> serde_json::Value {
        serde_json::json!({
            "client_id": self.client_id,
            "user_id": self.user_id(),
            "peer_ip": self.peer_ip,
            "state": format!("{:?}", self.state()),
            "connected_secs": self.connected_at.elapsed().as_secs(),
            "idle_ms": self.idle_ms(),
            "messages_sent": self.messages_sent.load(Ordering::Relaxed),
            "messages_received": self.messages_received.load(Ordering::Relaxed),
        })
    }
}

/// The acceptor-side capability for one client: shared state plus a sender
/// into its write loop.
#[derive(Clone)]
pub struct ClientHandle {
    pub shared: Arc<ClientShared>,
    sender: mpsc::UnboundedSender<OutboundFrame>,
}

impl ClientHandle {
    pub fn new(shared: Arc<ClientShared>, sender: mpsc::UnboundedSender<OutboundFrame>) -> Self {
        Self { shared, sender }
    }

    /// Queue a message for the write loop. `false` when the connection is
    /// already gone.
    pub fn send(&self, message: serde_json::Value) -> bool {
        self.sender.send(OutboundFrame::Message(message)).is_ok()
    }

    /// Disconnect, optionally announcing a reason first.
    pub fn close(&self, reason: Option<&str>) {
        if let Some(reason) = reason {
            let _ = self.sender.send(OutboundFrame::Message(serde_json::json!({
                "action": actions::DISCONNECT,
                "reason": reason,
                "timestamp": roost_common::epoch_secs(),
            })));
        }
        let _ = self.sender.send(OutboundFrame::Close);
        self.shared.closing.cancel();
    }
}

/// Drive one connection through its full lifecycle: read loop here, write
/// loop as a sibling task, cleanup on the way out. Transport and dispatch
/// errors never propagate past this function.
pub async fn run_connection<S>(
    stream: S,
    shared: Arc<ClientShared>,
    rx: mpsc::UnboundedReceiver<OutboundFrame>,
    handler: Arc<dyn Dispatch>,
    registry: Arc<ClientRegistry>,
    io_timeout: std::time::Duration,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut framed_read = FramedRead::new(read_half, EnvelopeCodec);

    let write_shared = Arc::clone(&shared);
    let mut write_task = tokio::spawn(run_write_loop(
        FramedWrite::new(write_half, EnvelopeCodec),
        rx,
        write_shared,
        io_timeout,
    ));

    shared.set_state(ClientState::Connected);
    info!(client_id = %shared.client_id, ip = %shared.peer_ip, "client connected");

    let mut dedup = RecentRequests::new(DEDUPE_MAX_ENTRIES);

    loop {
        let frame = tokio::select! {
            _ = shared.closing.cancelled() => break,
            frame = framed_read.next() => frame,
        };

        match frame {
            None => break, // peer closed
            Some(Err(e)) => {
                warn!(client_id = %shared.client_id, error = %e, "framing violation");
                shared.set_state(ClientState::Error);
                if let Some(handle) = registry.get(&shared.client_id) {
                    handle.close(Some("Protocol violation"));
                }
                break;
            },
            Some(Ok(DecodedFrame::Malformed { reason })) => {
                shared.touch();
                let reply = serde_json::json!({
                    "action": actions::ERROR,
                    "success": false,
                    "error": reason,
                    "timestamp": roost_common::epoch_secs(),
                });
                if let Some(handle) = registry.get(&shared.client_id) {
                    handle.send(reply);
                }
            },
            Some(Ok(DecodedFrame::Envelope(envelope))) => {
                shared.touch();
                shared.messages_received.fetch_add(1, Ordering::Relaxed);
                process_envelope(&shared, &envelope, &mut dedup, &handler, &registry).await;
            },
        }
    }

    // ── Cleanup ──────────────────────────────────────────────────────────

    shared.set_state(ClientState::Disconnected);
    // Dropping the registry entry drops the last sender; the write loop
    // drains any queued frames (e.g. a disconnect notice) and exits. The
    // timeout is a backstop against a peer that stops reading.
    registry.remove(&shared.client_id);
    shared.closing.cancel();
    if tokio::time::timeout(std::time::Duration::from_secs(1), &mut write_task)
        .await
        .is_err()
    {
        write_task.abort();
    }
    info!(
        client_id = %shared.client_id,
        duration_secs = shared.connected_at.elapsed().as_secs(),
        "client disconnected"
    );
}

async fn run_write_loop<W>(
    mut framed: FramedWrite<W, EnvelopeCodec>,
    mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
    shared: Arc<ClientShared>,
    io_timeout: std::time::Duration,
) where
    W: AsyncWrite + Send + Unpin,
{
    while let Some(frame) = rx.recv().await {
        match frame {
            OutboundFrame::Message(message) => {
                let sent = tokio::time::timeout(io_timeout, framed.send(message)).await;
                match sent {
                    Ok(Ok(())) => {
                        shared.messages_sent.fetch_add(1, Ordering::Relaxed);
                    },
                    Ok(Err(e)) => {
                        debug!(client_id = %shared.client_id, error = %e, "write failed");
                        break;
                    },
                    Err(_) => {
                        debug!(client_id = %shared.client_id, "write deadline exceeded");
                        break;
                    },
                }
            },
            OutboundFrame::Close => break,
        }
    }
    // Sends flush eagerly, so a plain socket shutdown is a clean close.
    let _ = tokio::io::AsyncWriteExt::shutdown(&mut framed.into_inner()).await;
    // Take the read loop down with us; a connection that cannot write is dead.
    shared.closing.cancel();
}

/// Apply the state-machine dispatch table to one envelope.
async fn process_envelope(
    shared: &Arc<ClientShared>,
    envelope: &Envelope,
    dedup: &mut RecentRequests,
    handler: &Arc<dyn Dispatch>,
    registry: &Arc<ClientRegistry>,
) {
    let action = envelope.action.as_str();

    // Heartbeats refresh activity and answer immediately; they bypass both
    // duplicate suppression and authentication.
    if action == actions::HEARTBEAT {
        send_to(registry, &shared.client_id, heartbeat_response());
        return;
    }

    if let Some(request_id) = envelope.request_id.as_deref()
        && !dedup.insert(request_id)
    {
        debug!(client_id = %shared.client_id, request_id, "dropping duplicate request");
        return;
    }

    let state = shared.state();
    let pre_auth_action = actions::PRE_AUTH.contains(&action);

    let allowed = match state {
        ClientState::Connected | ClientState::Authenticating => pre_auth_action,
        ClientState::Authenticated => true,
        _ => false,
    };
    if !allowed {
        let reply = serde_json::json!({
            "action": actions::ERROR,
            "request_id": envelope.request_id,
            "success": false,
            "error": "Authentication required",
            "timestamp": roost_common::epoch_secs(),
        });
        send_to(registry, &shared.client_id, reply);
        return;
    }

    let authenticating =
        pre_auth_action && matches!(state, ClientState::Connected | ClientState::Authenticating);
    if authenticating {
        shared.set_state(ClientState::Authenticating);
    }

    let outcome = handler
        .handle(envelope, &shared.client_id, &shared.peer_ip)
        .await;

    match outcome.effect {
        Some(AuthEffect::LoggedIn { user_id }) => {
            shared.set_user_id(Some(user_id.clone()));
            shared.set_state(ClientState::Authenticated);
            registry.bind_user(&user_id, &shared.client_id);
        },
        Some(AuthEffect::LoggedOut) => {
            if let Some(user_id) = shared.user_id() {
                registry.unbind_user(&user_id, &shared.client_id);
            }
            shared.set_user_id(None);
            shared.set_state(ClientState::Connected);
        },
        None => {
            if authenticating {
                // Auth attempt did not end in a login; back to Connected.
                shared.set_state(if shared.user_id().is_some() {
                    ClientState::Authenticated
                } else {
                    ClientState::Connected
                });
            }
        },
    }

    send_to(registry, &shared.client_id, outcome.reply);
}

fn send_to(registry: &Arc<ClientRegistry>, client_id: &str, message: serde_json::Value) {
    if let Some(handle) = registry.get(client_id) {
        if !handle.send(message) {
            debug!(client_id, "reply dropped, connection closing");
        }
    }
}

fn heartbeat_response() -> serde_json::Value {
    serde_json::json!({
        "action": actions::HEARTBEAT_RESPONSE,
        "timestamp": roost_common::epoch_secs(),
        "server_time": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_unique() {
        let a = generate_client_id();
        let b = generate_client_id();
        assert_ne!(a, b);
        assert!(a.starts_with("client_"));
    }

    #[test]
    fn state_transitions() {
        let shared = ClientShared::new("client_1_1".into(), "127.0.0.1".into());
        assert_eq!(shared.state(), ClientState::Initialized);
        shared.set_state(ClientState::Connected);
        assert!(!shared.is_authenticated());
        shared.set_state(ClientState::Authenticated);
        assert!(shared.is_authenticated());
    }

    #[test]
    fn touch_refreshes_activity() {
        let shared = ClientShared::new("client_1_2".into(), "127.0.0.1".into());
        let before = shared.last_activity_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        shared.touch();
        assert!(shared.last_activity_ms() >= before);
        assert!(shared.idle_ms() < 1000);
    }

    #[test]
    fn heartbeat_response_shape() {
        let reply = heartbeat_response();
        assert_eq!(reply["action"], "heartbeat_response");
        assert!(reply["timestamp"].is_i64());
        let server_time = reply["server_time"].as_str().unwrap();
        assert!(server_time.ends_with('Z'));
        assert!(server_time.contains('T'));
    }
}
