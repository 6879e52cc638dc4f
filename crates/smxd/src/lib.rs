//! smx daemon - session multiplexer and broadcast server.
//!
//! This crate implements the daemon that owns interactive subprocess
//! sessions and relays their output to every connected client:
//! - `config` - environment-driven daemon configuration
//! - `session` - one managed subprocess with its buffered output
//! - `registry` - the registry actor owning all session state
//! - `relay` - the periodic output flush tick
//! - `server` - TCP listener, per-client connections, observation broadcast
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         smxd daemon                          │
//! │                                                              │
//! │  ┌──────────────────┐  commands  ┌─────────────────────────┐ │
//! │  │   DaemonServer   │───────────▶│      RegistryActor      │ │
//! │  │   (TCP accept)   │            │  (sessions + active id) │ │
//! │  └────────┬─────────┘            └───────────┬─────────────┘ │
//! │           │ per client                       │ observations  │
//! │           ▼                                  ▼               │
//! │  ┌──────────────────┐            ┌─────────────────────────┐ │
//! │  │ConnectionHandler │            │    broadcast::Sender    │ │
//! │  │  (read + route)  │            │     (to all clients)    │ │
//! │  └──────────────────┘            └─────────────────────────┘ │
//! │                                              ▲               │
//! │  ┌──────────────────┐  flush tick            │               │
//! │  │   relay ticker   │───────▶ actor drains pending output    │
//! │  └──────────────────┘                                        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each session additionally owns a read-loop task (its output stream) and
//! an exit-watcher task (its child handle); terminations come back to the
//! registry actor through the same command channel as everything else.
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod config;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
