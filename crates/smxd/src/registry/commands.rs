//! Registry actor commands and errors.
//!
//! Message types for communicating with the `RegistryActor`. Request/response
//! commands carry a oneshot channel; fire-and-forget commands (the relay
//! flush, exit reports from session watchers) carry none.

use thiserror::Error;
use tokio::sync::oneshot;

use smx_core::SessionId;

use crate::session::{SessionExit, SessionHandle};

/// Commands sent to the registry actor.
///
/// ```ignore
/// let (tx, rx) = oneshot::channel();
/// registry_tx.send(RegistryCommand::SwitchTo {
///     id,
///     respond_to: tx,
/// }).await?;
/// rx.await??;
/// ```
#[derive(Debug)]
pub enum RegistryCommand {
    /// Create a session and make it active.
    ///
    /// # Errors
    /// - `RegistryError::DuplicateId` if the supplied id is taken
    /// - `RegistryError::RegistryFull` at capacity
    /// - `RegistryError::Spawn` if the subprocess cannot start
    Create {
        /// Caller-supplied id; generated when absent.
        id: Option<SessionId>,
        /// Binary to run; the configured default shell when absent.
        binary_path: Option<String>,
        binary_args: Vec<String>,
        respond_to: oneshot::Sender<Result<SessionId, RegistryError>>,
    },

    /// Make the named session active.
    ///
    /// # Errors
    /// - `RegistryError::NotFound` if the id is unknown (active unchanged)
    SwitchTo {
        id: SessionId,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Report the active session id, if any.
    Active {
        respond_to: oneshot::Sender<Option<SessionId>>,
    },

    /// Report all session ids in creation order.
    List {
        respond_to: oneshot::Sender<Vec<SessionId>>,
    },

    /// Fetch a handle for the named session.
    Get {
        id: SessionId,
        respond_to: oneshot::Sender<Option<SessionHandle>>,
    },

    /// Fetch a handle for the active session.
    GetActive {
        respond_to: oneshot::Sender<Option<SessionHandle>>,
    },

    /// Terminate the named session's subprocess (the active one when no id
    /// is given). Removal happens later, through the exit path.
    ///
    /// # Errors
    /// - `RegistryError::NotFound` if the id is unknown
    /// - `RegistryError::NoActiveSession` if no id was given and nothing is
    ///   active
    Close {
        id: Option<SessionId>,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Flush every session's pending output into broadcast observations.
    ///
    /// Fire-and-forget, sent by the relay ticker.
    Flush,

    /// A session's subprocess has exited (sent by its exit watcher).
    SessionExited {
        session_id: SessionId,
        exit: SessionExit,
    },
}

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// A session with this id already exists.
    #[error("session already exists: {0}")]
    DuplicateId(SessionId),

    /// The requested session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session subprocess could not be started.
    #[error("failed to spawn session: {0}")]
    Spawn(String),

    /// The registry has reached its configured capacity.
    #[error("registry is full (max: {max} sessions)")]
    RegistryFull { max: usize },

    /// A command needed the active session but none is set.
    #[error("no active session")]
    NoActiveSession,

    /// The response channel was closed before a response arrived.
    ///
    /// This typically indicates the actor was shut down.
    #[error("registry channel closed")]
    ChannelClosed,
}
