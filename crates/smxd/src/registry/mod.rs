//! Session registry using the actor pattern.
//!
//! The registry is the single owner of all session state: the id → session
//! map, creation order, and the active-session pointer. It receives
//! commands via a tokio mpsc channel and publishes observation strings via
//! a broadcast channel.
//!
//! ```text
//! ┌──────────────────┐      ┌─────────────────┐      ┌──────────────────┐
//! │ ConnectionHandler│─────▶│  RegistryActor  │─────▶│ broadcast channel│
//! └──────────────────┘      └─────────────────┘      └──────────────────┘
//!         │                         ▲                         │
//!         │   RegistryCommand       │ SessionExited           │ observations
//!         │   (mpsc channel)        │ (exit watchers)         ▼
//!         ▼                         │                   all connected
//!    create/switch/list      session tasks                clients
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use tokio::sync::{broadcast, mpsc};

mod actor;
mod commands;
mod handle;

pub use actor::RegistryActor;
pub use commands::{RegistryCommand, RegistryError};
pub use handle::RegistryHandle;

use crate::config::DaemonConfig;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 100;
const OBSERVATION_BUFFER: usize = 256;

/// Spawn the registry actor and return a handle for interaction.
///
/// This function:
/// 1. Creates the command and observation channels
/// 2. Spawns the `RegistryActor` on a tokio task
/// 3. Returns a `RegistryHandle` for client use
///
/// The output relay ticker is a separate component; see
/// [`crate::relay::spawn_relay_task`].
pub fn spawn_registry(config: DaemonConfig) -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (obs_tx, _) = broadcast::channel(OBSERVATION_BUFFER);

    let actor = RegistryActor::new(cmd_rx, cmd_tx.clone(), config, obs_tx.clone());
    tokio::spawn(actor.run());

    RegistryHandle::new(cmd_tx, obs_tx)
}
