//! Per-client connection handling and command dispatch.
//!
//! Each client gets a read loop that parses newline-delimited command
//! envelopes and routes them. Observations are never written here - the
//! broadcaster owns all outbound traffic - so the handler's jobs are
//! parsing, routing, and the session I/O that must not run inside the
//! registry actor (input writes, view requests and their timeouts).
//!
//! Malformed messages are logged and skipped; they never close the
//! connection or reach the registry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use smx_core::DomainError;
use smx_protocol::{observation, Command};

use crate::registry::{RegistryError, RegistryHandle};

/// Shared writer for one client socket.
pub type ClientWriter = Arc<Mutex<BufWriter<OwnedWriteHalf>>>;

/// All connected clients, keyed by connection number.
pub type ClientsMap = Arc<RwLock<HashMap<u64, ClientWriter>>>;

/// Maximum inbound line size (1 MB).
const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Connection handler for a single client.
pub struct ConnectionHandler {
    /// Buffered reader for incoming command lines.
    reader: BufReader<OwnedReadHalf>,

    /// Handle to the session registry.
    registry: RegistryHandle,

    /// Connection number, for log correlation.
    connection_number: u64,
}

impl ConnectionHandler {
    pub fn new(reader: OwnedReadHalf, registry: RegistryHandle, connection_number: u64) -> Self {
        Self {
            reader: BufReader::new(reader),
            registry,
            connection_number,
        }
    }

    /// Runs the read loop until EOF or an unrecoverable I/O error.
    pub async fn run(mut self) {
        loop {
            let mut line = String::new();

            match self.reader.read_line(&mut line).await {
                Ok(0) => {
                    debug!(connection = self.connection_number, "client sent EOF");
                    break;
                }
                Ok(_) => {
                    if line.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            connection = self.connection_number,
                            size = line.len(),
                            "oversized message ignored"
                        );
                        continue;
                    }

                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    match Command::parse(trimmed) {
                        Ok(command) => self.dispatch(command).await,
                        Err(e) => {
                            warn!(
                                connection = self.connection_number,
                                error = %e,
                                "malformed message ignored"
                            );
                        }
                    }
                }
                Err(e) => {
                    debug!(
                        connection = self.connection_number,
                        error = %e,
                        "connection closed"
                    );
                    break;
                }
            }
        }
    }

    /// Routes one parsed command.
    ///
    /// Failures surface as observations, never as closed connections.
    async fn dispatch(&self, command: Command) {
        match command {
            Command::NewSession {
                id,
                binary_path,
                binary_args,
            } => match self.registry.create(id, binary_path, binary_args).await {
                // The registry announces successful creation itself.
                Ok(id) => debug!(connection = self.connection_number, session_id = %id, "session created"),
                Err(RegistryError::DuplicateId(id)) => {
                    self.registry.publish(observation::duplicate_session(&id));
                }
                Err(e) => self.registry.publish(observation::creation_failed(&e.to_string())),
            },

            Command::RunCommand { text } => {
                // Commands get their newline; raw input does not.
                self.write_to_active(format!("{text}\n")).await;
            }

            Command::Input { text } => {
                self.write_to_active(text).await;
            }

            Command::SwitchToSession { id } => match self.registry.switch_to(id).await {
                // The registry announces the switch itself.
                Ok(()) => {}
                Err(RegistryError::NotFound(id)) => {
                    self.registry.publish(observation::session_not_found(&id));
                }
                Err(e) => warn!(connection = self.connection_number, error = %e, "switch failed"),
            },

            Command::WhichSessionActive => {
                let message = match self.registry.active().await {
                    Some(id) => observation::active_session(&id),
                    None => observation::no_active_session(),
                };
                self.registry.publish(message);
            }

            Command::ListSessions => {
                let ids = self.registry.list().await;
                self.registry.publish(observation::session_list(&ids));
            }

            Command::LookAtActiveSession => self.look_at_active().await,

            Command::Resize { cols, rows } => match self.registry.get_active().await {
                Some(session) => session.resize(cols, rows).await,
                None => self.registry.publish(observation::no_sessions_open()),
            },

            Command::CloseSession { id } => match self.registry.close(id).await {
                Ok(()) => {}
                Err(RegistryError::NotFound(id)) => {
                    self.registry.publish(observation::session_not_found(&id));
                }
                Err(RegistryError::NoActiveSession) => {
                    self.registry.publish(observation::no_sessions_open());
                }
                Err(e) => warn!(connection = self.connection_number, error = %e, "close failed"),
            },
        }
    }

    /// Writes to the active session, or reports that none is open.
    async fn write_to_active(&self, text: String) {
        match self.registry.get_active().await {
            Some(session) => session.write(&text).await,
            None => self.registry.publish(observation::no_sessions_open()),
        }
    }

    /// Fetches the active session's contents or rendered view.
    ///
    /// The view wait (up to the configured timeout) runs in this client's
    /// task; other connections and the registry keep moving.
    async fn look_at_active(&self) {
        let Some(session) = self.registry.get_active().await else {
            self.registry.publish(observation::no_sessions_open());
            return;
        };

        match session.look().await {
            Ok(contents) => {
                self.registry
                    .publish(observation::session_contents(session.id(), &contents));
            }
            Err(DomainError::ViewTimeout {
                session_id,
                timeout_ms,
            }) => {
                warn!(session_id = %session_id, timeout_ms, "view request timed out");
                self.registry
                    .publish(observation::view_timed_out(&session_id, timeout_ms));
            }
            Err(e) => {
                warn!(connection = self.connection_number, error = %e, "look failed");
            }
        }
    }
}
