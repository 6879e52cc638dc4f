//! Client interface for interacting with the RegistryActor.
//!
//! The `RegistryHandle` is a cheap-to-clone wrapper around the actor's
//! command channel plus the observation broadcast channel. Connection tasks
//! use it to route commands, the relay uses it to trigger flushes, and the
//! server subscribes through it to fan observations out to clients.

use tokio::sync::{broadcast, mpsc, oneshot};

use smx_core::SessionId;

use crate::session::SessionHandle;

use super::commands::{RegistryCommand, RegistryError};

/// Handle for interacting with the registry actor.
///
/// ```ignore
/// let registry = spawn_registry(config);
///
/// let id = registry.create(None, None, vec![]).await?;
/// registry.switch_to(id).await?;
///
/// let mut observations = registry.subscribe();
/// while let Ok(message) = observations.recv().await {
///     // forward to clients
/// }
/// ```
#[derive(Clone)]
pub struct RegistryHandle {
    /// Command sender to the actor.
    sender: mpsc::Sender<RegistryCommand>,

    /// Observation broadcaster.
    observations: broadcast::Sender<String>,
}

impl RegistryHandle {
    pub fn new(
        sender: mpsc::Sender<RegistryCommand>,
        observations: broadcast::Sender<String>,
    ) -> Self {
        Self {
            sender,
            observations,
        }
    }

    /// Creates a session and makes it active.
    ///
    /// # Errors
    ///
    /// - `RegistryError::DuplicateId` if the supplied id is taken
    /// - `RegistryError::RegistryFull` at capacity
    /// - `RegistryError::Spawn` if the subprocess cannot start
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn create(
        &self,
        id: Option<SessionId>,
        binary_path: Option<String>,
        binary_args: Vec<String>,
    ) -> Result<SessionId, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Create {
                id,
                binary_path,
                binary_args,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Makes the named session active.
    ///
    /// # Errors
    ///
    /// - `RegistryError::NotFound` if the id is unknown (active unchanged)
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn switch_to(&self, id: SessionId) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::SwitchTo { id, respond_to: tx })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Returns the active session id, or `None` when nothing is active or
    /// the actor is gone.
    pub async fn active(&self) -> Option<SessionId> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Active { respond_to: tx })
            .await
            .ok()?;

        rx.await.ok()?
    }

    /// Returns all session ids in creation order; empty when none exist or
    /// the actor is gone.
    pub async fn list(&self) -> Vec<SessionId> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::List { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    /// Fetches a handle for the named session.
    pub async fn get(&self, id: SessionId) -> Option<SessionHandle> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Get { id, respond_to: tx })
            .await
            .ok()?;

        rx.await.ok()?
    }

    /// Fetches a handle for the active session.
    pub async fn get_active(&self) -> Option<SessionHandle> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::GetActive { respond_to: tx })
            .await
            .ok()?;

        rx.await.ok()?
    }

    /// Terminates the named session (or the active one).
    ///
    /// # Errors
    ///
    /// - `RegistryError::NotFound` if the id is unknown
    /// - `RegistryError::NoActiveSession` if no id was given and nothing is
    ///   active
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn close(&self, id: Option<SessionId>) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Close { id, respond_to: tx })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Triggers a flush of all pending session output.
    ///
    /// Fire-and-forget; returns `false` when the actor is gone so the relay
    /// ticker knows to stop.
    pub async fn flush(&self) -> bool {
        self.sender.send(RegistryCommand::Flush).await.is_ok()
    }

    /// Subscribes to the observation stream.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.observations.subscribe()
    }

    /// Publishes one observation to all connected clients.
    ///
    /// Used by the dispatcher for command results that do not originate in
    /// the actor (query replies, view contents, "no sessions open").
    pub fn publish(&self, message: String) {
        // No subscribers yet is fine - nobody is connected.
        let _ = self.observations.send(message);
    }

    /// Checks whether the actor is still accepting commands.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}
