//! The concurrent server runtime: TLS-capable TCP acceptor, per-connection
//! client handlers, the protocol dispatcher, and the composition root that
//! wires every component together and manages their lifecycles.

pub mod acceptor;
pub mod client;
pub mod dedup;
pub mod dispatch;
pub mod events;
pub mod manager;

pub use {
    acceptor::{ClientRegistry, TcpServer},
    client::{ClientHandle, ClientShared, ClientState},
    dispatch::{AuthEffect, Dispatch, HandlerOutcome, ProtocolHandler},
    events::ServerEvent,
    manager::ServerManager,
};
