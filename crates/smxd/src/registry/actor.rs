//! Registry actor - owns all session state and processes commands.
//!
//! The actor is the single owner of the session map and the active-session
//! pointer. Commands arrive on an mpsc channel and are processed
//! sequentially, so create/switch/remove/flush never race. Session I/O never
//! happens here: callers receive cloned session handles and do their own
//! writing and view waiting, so a slow subprocess or a pending view request
//! cannot stall the registry.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel send failures are logged but don't panic

use std::collections::HashMap;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use smx_core::SessionId;
use smx_protocol::observation;

use crate::config::DaemonConfig;
use crate::session::{spawn_session, SessionExit, SessionHandle};

use super::commands::{RegistryCommand, RegistryError};

/// The registry actor.
///
/// # Ownership
///
/// The actor owns:
/// - `sessions`: id → session handle
/// - `order`: creation order, for deterministic listing
/// - `active_id`: the session unqualified commands target
///
/// # Thread Safety
///
/// The actor runs in a single task and processes commands sequentially.
/// All state mutations happen within that task.
pub struct RegistryActor {
    /// Command receiver.
    receiver: mpsc::Receiver<RegistryCommand>,

    /// Sender side of the same channel, handed to each session's exit
    /// watcher so terminations come back through the serialized path.
    sender: mpsc::Sender<RegistryCommand>,

    config: DaemonConfig,

    /// Primary session storage.
    sessions: HashMap<SessionId, SessionHandle>,

    /// Creation order of the ids in `sessions`.
    order: Vec<SessionId>,

    /// The session unqualified commands target. Cleared, never reassigned,
    /// when the active session exits.
    active_id: Option<SessionId>,

    /// Observation publisher; the server broadcasts these to every client.
    observations: broadcast::Sender<String>,
}

impl RegistryActor {
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        sender: mpsc::Sender<RegistryCommand>,
        config: DaemonConfig,
        observations: broadcast::Sender<String>,
    ) -> Self {
        Self {
            receiver,
            sender,
            config,
            sessions: HashMap::new(),
            order: Vec::new(),
            active_id: None,
            observations,
        }
    }

    /// Runs the actor event loop.
    ///
    /// Processes commands until the channel closes. This is the main entry
    /// point - call it in a spawned task.
    pub async fn run(mut self) {
        info!("registry actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(sessions = self.sessions.len(), "registry actor stopped");
    }

    /// Dispatches a command to the appropriate handler.
    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Create {
                id,
                binary_path,
                binary_args,
                respond_to,
            } => {
                let result = self.handle_create(id, binary_path, binary_args);
                // Ignore send errors - the client may have dropped the receiver.
                let _ = respond_to.send(result);
            }
            RegistryCommand::SwitchTo { id, respond_to } => {
                let result = self.handle_switch_to(id);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Active { respond_to } => {
                let _ = respond_to.send(self.active_id.clone());
            }
            RegistryCommand::List { respond_to } => {
                let _ = respond_to.send(self.order.clone());
            }
            RegistryCommand::Get { id, respond_to } => {
                let _ = respond_to.send(self.sessions.get(&id).cloned());
            }
            RegistryCommand::GetActive { respond_to } => {
                let handle = self
                    .active_id
                    .as_ref()
                    .and_then(|id| self.sessions.get(id))
                    .cloned();
                let _ = respond_to.send(handle);
            }
            RegistryCommand::Close { id, respond_to } => {
                let result = self.handle_close(id);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Flush => self.handle_flush(),
            RegistryCommand::SessionExited { session_id, exit } => {
                self.handle_session_exited(session_id, exit);
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    /// Handles session creation.
    ///
    /// The new session becomes active unconditionally, switching away from
    /// whatever was active before. On any failure nothing is inserted.
    fn handle_create(
        &mut self,
        id: Option<SessionId>,
        binary_path: Option<String>,
        binary_args: Vec<String>,
    ) -> Result<SessionId, RegistryError> {
        let id = id.unwrap_or_else(SessionId::generate);

        if self.sessions.contains_key(&id) {
            debug!(session_id = %id, "rejecting duplicate session id");
            return Err(RegistryError::DuplicateId(id));
        }

        if self.sessions.len() >= self.config.max_sessions {
            warn!(
                session_id = %id,
                current = self.sessions.len(),
                max = self.config.max_sessions,
                "registry is full, rejecting session"
            );
            return Err(RegistryError::RegistryFull {
                max: self.config.max_sessions,
            });
        }

        let binary_path = binary_path.unwrap_or_else(|| self.config.default_shell.clone());

        let handle = spawn_session(
            id.clone(),
            &binary_path,
            &binary_args,
            &self.config,
            self.sender.clone(),
        )
        .map_err(|e| RegistryError::Spawn(e.to_string()))?;

        self.sessions.insert(id.clone(), handle);
        self.order.push(id.clone());
        self.active_id = Some(id.clone());

        info!(
            session_id = %id,
            total_sessions = self.sessions.len(),
            "session registered and made active"
        );

        // Announced here, not by the dispatcher, so the creation observation
        // always precedes the exit observation of a short-lived session.
        let _ = self.observations.send(observation::session_created(&id));

        Ok(id)
    }

    /// Handles an explicit switch of the active session.
    ///
    /// On `NotFound` the active session is left unchanged.
    fn handle_switch_to(&mut self, id: SessionId) -> Result<(), RegistryError> {
        if !self.sessions.contains_key(&id) {
            debug!(session_id = %id, "switch to unknown session");
            return Err(RegistryError::NotFound(id));
        }

        self.active_id = Some(id.clone());
        info!(session_id = %id, "active session switched");
        let _ = self.observations.send(observation::session_switched(&id));
        Ok(())
    }

    /// Handles an explicit close. The subprocess is killed here; removal and
    /// the exit observation arrive later through the exit path.
    fn handle_close(&mut self, id: Option<SessionId>) -> Result<(), RegistryError> {
        let id = match id.or_else(|| self.active_id.clone()) {
            Some(id) => id,
            None => return Err(RegistryError::NoActiveSession),
        };

        match self.sessions.get(&id) {
            Some(handle) => {
                info!(session_id = %id, "closing session");
                handle.close();
                Ok(())
            }
            None => Err(RegistryError::NotFound(id)),
        }
    }

    /// Handles a relay flush: every session with pending output gets one
    /// coalesced observation, in creation order. Sessions with nothing
    /// pending stay silent.
    fn handle_flush(&mut self) {
        let mut flushed = 0usize;

        for id in &self.order {
            let Some(handle) = self.sessions.get(id) else {
                continue;
            };
            if let Some(output) = handle.take_pending() {
                let _ = self.observations.send(observation::session_output(id, &output));
                flushed += 1;
            }
        }

        if flushed > 0 {
            debug!(sessions = flushed, "flushed pending output");
        }
    }

    /// Handles a subprocess exit reported by a session's watcher.
    ///
    /// Removes the session, clears the active pointer if it pointed here
    /// (operators must switch explicitly - nothing is auto-promoted), ships
    /// any output the relay had not flushed yet, and announces the exit
    /// exactly once.
    fn handle_session_exited(&mut self, session_id: SessionId, exit: SessionExit) {
        let Some(handle) = self.sessions.remove(&session_id) else {
            debug!(session_id = %session_id, "exit report for unknown session ignored");
            return;
        };
        self.order.retain(|id| id != &session_id);

        if self.active_id.as_ref() == Some(&session_id) {
            self.active_id = None;
        }

        if let Some(output) = handle.take_pending() {
            let _ = self
                .observations
                .send(observation::session_output(&session_id, &output));
        }
        let _ = self
            .observations
            .send(observation::session_exited(&session_id, exit.code, exit.signal));

        info!(
            session_id = %session_id,
            code = ?exit.code,
            signal = ?exit.signal,
            remaining_sessions = self.sessions.len(),
            "session removed"
        );
    }

    // ========================================================================
    // Accessors (for testing)
    // ========================================================================

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn create_actor() -> (RegistryActor, broadcast::Receiver<String>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (obs_tx, obs_rx) = broadcast::channel(64);
        let config = DaemonConfig::from_env()
            .with_default_shell("/bin/cat")
            .with_max_sessions(8);
        let actor = RegistryActor::new(cmd_rx, cmd_tx, config, obs_tx);
        (actor, obs_rx)
    }

    fn create_session(actor: &mut RegistryActor, id: &str) -> SessionId {
        actor
            .handle_create(Some(SessionId::new(id)), None, vec![])
            .unwrap_or_else(|e| panic!("create {id} failed: {e}"))
    }

    #[tokio::test]
    async fn test_create_registers_and_activates() {
        let (mut actor, _obs) = create_actor();

        let id = create_session(&mut actor, "first");
        assert_eq!(id.as_str(), "first");
        assert_eq!(actor.session_count(), 1);
        assert_eq!(actor.active_id, Some(SessionId::new("first")));
    }

    #[tokio::test]
    async fn test_create_generates_id_when_absent() {
        let (mut actor, _obs) = create_actor();

        let id = actor.handle_create(None, None, vec![]).unwrap();
        assert!(!id.as_str().is_empty());
        assert!(actor.sessions.contains_key(&id));
    }

    #[tokio::test]
    async fn test_create_always_steals_active() {
        let (mut actor, _obs) = create_actor();

        create_session(&mut actor, "one");
        create_session(&mut actor, "two");
        assert_eq!(actor.active_id, Some(SessionId::new("two")));

        actor.handle_switch_to(SessionId::new("one")).unwrap();
        assert_eq!(actor.active_id, Some(SessionId::new("one")));

        create_session(&mut actor, "three");
        assert_eq!(actor.active_id, Some(SessionId::new("three")));
    }

    #[tokio::test]
    async fn test_create_duplicate_fails() {
        let (mut actor, _obs) = create_actor();

        create_session(&mut actor, "twin");
        let result = actor.handle_create(Some(SessionId::new("twin")), None, vec![]);
        assert!(matches!(result, Err(RegistryError::DuplicateId(_))));
        assert_eq!(actor.session_count(), 1);
    }

    #[tokio::test]
    async fn test_create_spawn_failure_inserts_nothing() {
        let (mut actor, _obs) = create_actor();

        let result = actor.handle_create(
            Some(SessionId::new("broken")),
            Some("/definitely/not/a/binary".to_string()),
            vec![],
        );
        assert!(matches!(result, Err(RegistryError::Spawn(_))));
        assert_eq!(actor.session_count(), 0);
        assert_eq!(actor.active_id, None);
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (obs_tx, _obs_rx) = broadcast::channel(64);
        let config = DaemonConfig::from_env()
            .with_default_shell("/bin/cat")
            .with_max_sessions(2);
        let mut actor = RegistryActor::new(cmd_rx, cmd_tx, config, obs_tx);

        create_session(&mut actor, "a");
        create_session(&mut actor, "b");

        let result = actor.handle_create(Some(SessionId::new("c")), None, vec![]);
        assert!(matches!(
            result,
            Err(RegistryError::RegistryFull { max: 2 })
        ));
        assert_eq!(actor.session_count(), 2);
    }

    #[tokio::test]
    async fn test_switch_to_unknown_leaves_active_unchanged() {
        let (mut actor, _obs) = create_actor();

        create_session(&mut actor, "home");
        let result = actor.handle_switch_to(SessionId::new("ghost"));
        assert!(matches!(result, Err(RegistryError::NotFound(_))));
        assert_eq!(actor.active_id, Some(SessionId::new("home")));
    }

    #[tokio::test]
    async fn test_list_preserves_creation_order() {
        let (mut actor, _obs) = create_actor();

        create_session(&mut actor, "first");
        create_session(&mut actor, "second");
        create_session(&mut actor, "third");

        assert_eq!(
            actor.order,
            vec![
                SessionId::new("first"),
                SessionId::new("second"),
                SessionId::new("third"),
            ]
        );
    }

    #[tokio::test]
    async fn test_create_announces_itself() {
        let (mut actor, mut obs) = create_actor();

        create_session(&mut actor, "fresh");
        let message = obs.try_recv().unwrap();
        assert_eq!(
            message,
            "observation: created new session 'fresh' and made it active"
        );
    }

    #[tokio::test]
    async fn test_switch_announces_itself() {
        let (mut actor, mut obs) = create_actor();

        create_session(&mut actor, "a");
        create_session(&mut actor, "b");
        let _ = obs.try_recv();
        let _ = obs.try_recv();

        actor.handle_switch_to(SessionId::new("a")).unwrap();
        let message = obs.try_recv().unwrap();
        assert_eq!(message, "observation: switched to session 'a'");
    }

    #[tokio::test]
    async fn test_exit_clears_active_and_announces_once() {
        let (mut actor, mut obs) = create_actor();

        let id = create_session(&mut actor, "doomed");
        // Drain the creation announcement.
        let _ = obs.try_recv();

        actor.handle_session_exited(
            id.clone(),
            SessionExit {
                code: Some(0),
                signal: None,
            },
        );

        assert_eq!(actor.session_count(), 0);
        assert_eq!(actor.active_id, None);
        assert!(!actor.order.contains(&id));

        let message = obs.try_recv().unwrap();
        assert_eq!(message, "observation: session 'doomed' exited with code 0");
        assert!(obs.try_recv().is_err(), "exit must be announced exactly once");
    }

    #[tokio::test]
    async fn test_exit_of_inactive_session_keeps_active() {
        let (mut actor, _obs) = create_actor();

        let first = create_session(&mut actor, "first");
        create_session(&mut actor, "second");

        actor.handle_session_exited(
            first,
            SessionExit {
                code: Some(0),
                signal: None,
            },
        );

        assert_eq!(actor.active_id, Some(SessionId::new("second")));
        assert_eq!(actor.order, vec![SessionId::new("second")]);
    }

    #[tokio::test]
    async fn test_exit_flushes_leftover_output_first() {
        let (mut actor, mut obs) = create_actor();

        let id = create_session(&mut actor, "chatty");
        let _ = obs.try_recv();

        if let Some(handle) = actor.sessions.get(&id) {
            handle.push_fragment("last words\n".to_string());
        }

        actor.handle_session_exited(
            id,
            SessionExit {
                code: Some(1),
                signal: None,
            },
        );

        let first = obs.try_recv().unwrap();
        assert_eq!(
            first,
            "observation: new output in session 'chatty':\nlast words\n"
        );
        let second = obs.try_recv().unwrap();
        assert_eq!(second, "observation: session 'chatty' exited with code 1");
    }

    #[tokio::test]
    async fn test_flush_publishes_one_observation_per_dirty_session() {
        let (mut actor, mut obs) = create_actor();

        let noisy = create_session(&mut actor, "noisy");
        create_session(&mut actor, "quiet");
        let _ = obs.try_recv();
        let _ = obs.try_recv();

        if let Some(handle) = actor.sessions.get(&noisy) {
            handle.push_fragment("one ".to_string());
            handle.push_fragment("two ".to_string());
            handle.push_fragment("three".to_string());
        }

        actor.handle_flush();

        let message = obs.try_recv().unwrap();
        assert_eq!(
            message,
            "observation: new output in session 'noisy':\none two three"
        );
        // The quiet session stays silent, and a second flush with no new
        // fragments emits nothing (leading edge suppressed).
        assert!(obs.try_recv().is_err());

        actor.handle_flush();
        assert!(obs.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_unknown_session() {
        let (mut actor, _obs) = create_actor();

        let result = actor.handle_close(Some(SessionId::new("ghost")));
        assert!(matches!(result, Err(RegistryError::NotFound(_))));

        let result = actor.handle_close(None);
        assert!(matches!(result, Err(RegistryError::NoActiveSession)));
    }

    #[tokio::test]
    async fn test_handle_command_roundtrip() {
        let (mut actor, _obs) = create_actor();

        let (tx, rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Create {
            id: Some(SessionId::new("via-command")),
            binary_path: None,
            binary_args: vec![],
            respond_to: tx,
        });
        let created = rx.await.unwrap().unwrap();
        assert_eq!(created.as_str(), "via-command");

        let (tx, rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Active { respond_to: tx });
        assert_eq!(rx.await.unwrap(), Some(SessionId::new("via-command")));

        let (tx, rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::List { respond_to: tx });
        assert_eq!(rx.await.unwrap(), vec![SessionId::new("via-command")]);

        let (tx, rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::GetActive { respond_to: tx });
        let handle = rx.await.unwrap();
        assert!(handle.is_some());
    }
}
