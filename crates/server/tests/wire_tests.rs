//! End-to-end wire tests: a real TCP listener, real framing, and a stub
//! dispatcher standing in for the database-backed services.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    },
};

use {
    roost_config::{RoostConfig, SharedConfig},
    roost_protocol::{Envelope, reply_err, reply_ok},
    roost_queue::{Delivery, MessageQueue, Priority, QueueConfig, Target},
    roost_server::{
        AuthEffect, ClientRegistry, Dispatch, HandlerOutcome, TcpServer, events::EventBus,
    },
};

// ── Stub dispatcher ─────────────────────────────────────────────────────────

struct StubDispatch;

#[async_trait]
impl Dispatch for StubDispatch {
    async fn handle(&self, env: &Envelope, _client_id: &str, _ip: &str) -> HandlerOutcome {
        let request_id = env.request_id.as_deref();
        match env.action.as_str() {
            "login" => {
                let username = env.str_field("username").unwrap_or("u1").to_string();
                if env.str_field("password") == Some("letmein") {
                    let mut reply = reply_ok("login", request_id);
                    reply.insert("session_token".into(), "stub-token".into());
                    HandlerOutcome {
                        reply: serde_json::Value::Object(reply),
                        effect: Some(AuthEffect::LoggedIn { user_id: username }),
                    }
                } else {
                    HandlerOutcome {
                        reply: serde_json::Value::Object(reply_err(
                            "login",
                            request_id,
                            "AuthenticationFailed",
                            "Invalid username or password",
                        )),
                        effect: None,
                    }
                }
            },
            "logout" => HandlerOutcome {
                reply: serde_json::Value::Object(reply_ok("logout", request_id)),
                effect: Some(AuthEffect::LoggedOut),
            },
            "check_username" => {
                let mut reply = reply_ok("check_username", request_id);
                reply.insert("available".into(), true.into());
                HandlerOutcome {
                    reply: serde_json::Value::Object(reply),
                    effect: None,
                }
            },
            other => HandlerOutcome {
                reply: serde_json::Value::Object(reply_err(
                    other,
                    request_id,
                    "UnknownAction",
                    "Unknown action",
                )),
                effect: None,
            },
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

async fn start_server(max_clients: usize, heartbeat_ms: u64) -> (Arc<TcpServer>, SocketAddr) {
    let mut cfg = RoostConfig::default();
    cfg.server.port = 0;
    cfg.server.bind_address = "127.0.0.1".into();
    cfg.server.use_tls = false;
    cfg.server.max_clients = max_clients;
    cfg.server.heartbeat_interval = heartbeat_ms;

    let server = TcpServer::new(
        SharedConfig::new(cfg),
        Arc::new(StubDispatch),
        ClientRegistry::new(),
        EventBus::new(),
        None,
    );
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

fn frame_bytes(value: &serde_json::Value) -> Vec<u8> {
    let payload = serde_json::to_vec(value).unwrap();
    let mut out = (payload.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(&payload);
    out
}

async fn write_frame(stream: &mut TcpStream, value: &serde_json::Value) {
    stream.write_all(&frame_bytes(value)).await.unwrap();
    stream.flush().await.unwrap();
}

async fn try_read_frame(stream: &mut TcpStream) -> Option<serde_json::Value> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.ok()?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.ok()?;
    serde_json::from_slice(&payload).ok()
}

async fn read_frame(stream: &mut TcpStream) -> serde_json::Value {
    tokio::time::timeout(Duration::from_secs(5), try_read_frame(stream))
        .await
        .expect("read timed out")
        .expect("connection closed")
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn heartbeat_roundtrip() {
    let (server, addr) = start_server(10, 30_000).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    write_frame(&mut stream, &serde_json::json!({"action": "heartbeat"})).await;
    let reply = read_frame(&mut stream).await;

    assert_eq!(reply["action"], "heartbeat_response");
    assert!(reply["timestamp"].is_i64());
    assert!(reply["server_time"].as_str().unwrap().ends_with('Z'));
    server.stop().await;
}

#[tokio::test]
async fn two_frames_dispatch_in_order_for_every_split() {
    let (server, addr) = start_server(200, 30_000).await;

    let mut stream_bytes = frame_bytes(&serde_json::json!({
        "action": "check_username", "request_id": "r1", "username": "alice"
    }));
    stream_bytes.extend(frame_bytes(&serde_json::json!({
        "action": "check_username", "request_id": "r2", "username": "bob"
    })));

    for split in 0..=stream_bytes.len() {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&stream_bytes[..split]).await.unwrap();
        stream.flush().await.unwrap();
        // A scheduling gap so the two chunks arrive as separate reads.
        tokio::time::sleep(Duration::from_millis(2)).await;
        stream.write_all(&stream_bytes[split..]).await.unwrap();
        stream.flush().await.unwrap();

        let first = read_frame(&mut stream).await;
        let second = read_frame(&mut stream).await;
        assert_eq!(first["request_id"], "r1", "split at byte {split}");
        assert_eq!(second["request_id"], "r2", "split at byte {split}");
    }
    server.stop().await;
}

#[tokio::test]
async fn oversize_length_closes_with_protocol_violation() {
    let (server, addr) = start_server(10, 30_000).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream
        .write_all(&(70_000u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(b"junk").await.unwrap();
    stream.flush().await.unwrap();

    // The server announces the violation, then the connection dies.
    let mut saw_violation = false;
    while let Ok(Some(frame)) =
        tokio::time::timeout(Duration::from_secs(5), try_read_frame(&mut stream)).await
    {
        if frame["action"] == "disconnect" {
            assert_eq!(frame["reason"], "Protocol violation");
            saw_violation = true;
        }
    }
    assert!(saw_violation);
    server.stop().await;
}

#[tokio::test]
async fn zero_length_header_is_skipped() {
    let (server, addr) = start_server(10, 30_000).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream.write_all(&0u32.to_be_bytes()).await.unwrap();
    write_frame(&mut stream, &serde_json::json!({"action": "heartbeat"})).await;

    let reply = read_frame(&mut stream).await;
    assert_eq!(reply["action"], "heartbeat_response");
    server.stop().await;
}

#[tokio::test]
async fn malformed_json_gets_error_reply_and_connection_survives() {
    let (server, addr) = start_server(10, 30_000).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let garbage = b"{definitely not json";
    stream
        .write_all(&(garbage.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(garbage).await.unwrap();
    stream.flush().await.unwrap();

    let reply = read_frame(&mut stream).await;
    assert_eq!(reply["action"], "error");
    assert_eq!(reply["success"], false);

    // Still alive.
    write_frame(&mut stream, &serde_json::json!({"action": "heartbeat"})).await;
    assert_eq!(read_frame(&mut stream).await["action"], "heartbeat_response");
    server.stop().await;
}

#[tokio::test]
async fn connection_rejected_at_capacity() {
    let (server, addr) = start_server(1, 30_000).await;

    // Fill the only slot and make sure it is registered.
    let mut first = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut first, &serde_json::json!({"action": "heartbeat"})).await;
    read_frame(&mut first).await;

    let mut second = TcpStream::connect(addr).await.unwrap();
    let frame = read_frame(&mut second).await;
    assert_eq!(frame["action"], "connection_rejected");
    assert_eq!(frame["max_clients"], 1);
    assert!(frame["reason"].is_string());
    // And then the socket closes.
    assert!(try_read_frame(&mut second).await.is_none());
    server.stop().await;
}

#[tokio::test]
async fn duplicate_request_id_is_dropped_silently() {
    let (server, addr) = start_server(10, 30_000).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let request = serde_json::json!({
        "action": "check_username", "request_id": "dup-1", "username": "alice"
    });
    write_frame(&mut stream, &request).await;
    assert_eq!(read_frame(&mut stream).await["request_id"], "dup-1");

    // The retry is swallowed: no reply within the grace window.
    write_frame(&mut stream, &request).await;
    let silent =
        tokio::time::timeout(Duration::from_millis(300), try_read_frame(&mut stream)).await;
    assert!(silent.is_err());

    // A fresh id goes through.
    write_frame(
        &mut stream,
        &serde_json::json!({
            "action": "check_username", "request_id": "dup-2", "username": "alice"
        }),
    )
    .await;
    assert_eq!(read_frame(&mut stream).await["request_id"], "dup-2");
    server.stop().await;
}

#[tokio::test]
async fn application_actions_require_authentication() {
    let (server, addr) = start_server(10, 30_000).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    write_frame(
        &mut stream,
        &serde_json::json!({"action": "post_message", "request_id": "p1"}),
    )
    .await;
    let reply = read_frame(&mut stream).await;
    assert_eq!(reply["action"], "error");
    assert_eq!(reply["success"], false);
    assert_eq!(reply["error"], "Authentication required");
    server.stop().await;
}

#[tokio::test]
async fn login_binds_user_and_enables_targeted_delivery() {
    let (server, addr) = start_server(10, 30_000).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    write_frame(
        &mut stream,
        &serde_json::json!({
            "action": "login", "request_id": "l1",
            "username": "alice", "password": "letmein"
        }),
    )
    .await;
    let reply = read_frame(&mut stream).await;
    assert_eq!(reply["success"], true);
    assert_eq!(reply["session_token"], "stub-token");

    // Direct server push to the now-bound user.
    let pushed = server.send_to_user("alice", serde_json::json!({"action": "poke", "n": 1}));
    assert!(pushed);
    let frame = read_frame(&mut stream).await;
    assert_eq!(frame["action"], "poke");

    // Post-login, an application action is dispatched instead of rejected.
    write_frame(
        &mut stream,
        &serde_json::json!({"action": "post_message", "request_id": "p2"}),
    )
    .await;
    let reply = read_frame(&mut stream).await;
    assert_eq!(reply["code"], "UnknownAction");

    // Broadcast reaches the authenticated client.
    let count = server.broadcast(&serde_json::json!({"action": "announcement"}));
    assert_eq!(count, 1);
    assert_eq!(read_frame(&mut stream).await["action"], "announcement");

    server.stop().await;
}

#[tokio::test]
async fn queue_delivers_through_the_acceptor() {
    let (server, addr) = start_server(10, 30_000).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    write_frame(
        &mut stream,
        &serde_json::json!({
            "action": "login", "request_id": "l1",
            "username": "bob", "password": "letmein"
        }),
    )
    .await;
    assert_eq!(read_frame(&mut stream).await["success"], true);

    let queue = MessageQueue::new(QueueConfig {
        worker_count: 1,
        poll_interval: Duration::from_millis(10),
        retry_interval: Duration::from_millis(20),
        shutdown_grace: Duration::from_millis(500),
        ..QueueConfig::default()
    });
    let handles = queue.start(server.clone() as Arc<dyn Delivery>);

    queue
        .enqueue(
            Target::User("bob".into()),
            serde_json::json!({"action": "queued_hello"}),
            Priority::High,
        )
        .unwrap();

    let frame = read_frame(&mut stream).await;
    assert_eq!(frame["action"], "queued_hello");

    queue.shutdown().await;
    for handle in handles {
        handle.await.unwrap();
    }
    server.stop().await;
}

#[tokio::test]
async fn logout_returns_connection_to_unauthenticated_state() {
    let (server, addr) = start_server(10, 30_000).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    write_frame(
        &mut stream,
        &serde_json::json!({
            "action": "login", "request_id": "l1",
            "username": "carol", "password": "letmein"
        }),
    )
    .await;
    assert_eq!(read_frame(&mut stream).await["success"], true);

    write_frame(
        &mut stream,
        &serde_json::json!({"action": "logout", "request_id": "lo1"}),
    )
    .await;
    assert_eq!(read_frame(&mut stream).await["success"], true);

    // Back to Connected: application actions are rejected again, and the
    // user binding is gone.
    write_frame(
        &mut stream,
        &serde_json::json!({"action": "post_message", "request_id": "p3"}),
    )
    .await;
    assert_eq!(read_frame(&mut stream).await["error"], "Authentication required");
    assert!(!server.send_to_user("carol", serde_json::json!({"action": "poke"})));

    server.stop().await;
}

#[tokio::test]
async fn failed_login_leaves_connection_usable() {
    let (server, addr) = start_server(10, 30_000).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    write_frame(
        &mut stream,
        &serde_json::json!({
            "action": "login", "request_id": "l1",
            "username": "mallory", "password": "wrong"
        }),
    )
    .await;
    let reply = read_frame(&mut stream).await;
    assert_eq!(reply["success"], false);
    assert_eq!(reply["code"], "AuthenticationFailed");

    // Auth failure drops back to Connected, where pre-auth actions work.
    write_frame(
        &mut stream,
        &serde_json::json!({"action": "check_username", "request_id": "c1", "username": "x"}),
    )
    .await;
    assert_eq!(read_frame(&mut stream).await["request_id"], "c1");
    server.stop().await;
}

#[tokio::test]
async fn idle_client_is_disconnected_by_heartbeat_sweep() {
    let (server, addr) = start_server(10, 1000).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // Establish, then go silent. Timeout is 3x the 1 s interval.
    write_frame(&mut stream, &serde_json::json!({"action": "heartbeat"})).await;
    read_frame(&mut stream).await;

    let mut saw_timeout = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_secs(6), try_read_frame(&mut stream)).await {
            Ok(Some(frame)) => {
                if frame["action"] == "disconnect" && frame["reason"] == "Heartbeat timeout" {
                    saw_timeout = true;
                }
            },
            Ok(None) => break, // closed
            Err(_) => break,
        }
    }
    assert!(saw_timeout);
    server.stop().await;
}

#[tokio::test]
async fn server_rebinds_after_stop() {
    let (server, addr) = start_server(10, 30_000).await;
    server.stop().await;

    // Old address refuses or resets; a fresh start binds a new port.
    server.start().await.unwrap();
    let new_addr = server.local_addr().unwrap();
    let mut stream = TcpStream::connect(new_addr).await.unwrap();
    write_frame(&mut stream, &serde_json::json!({"action": "heartbeat"})).await;
    assert_eq!(read_frame(&mut stream).await["action"], "heartbeat_response");
    let _ = addr;
    server.stop().await;
}
