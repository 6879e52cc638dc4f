//! TCP server and broadcast hub for the smx daemon.
//!
//! The server:
//! - Listens on a TCP socket for client connections
//! - Spawns a `ConnectionHandler` for each client
//! - Broadcasts every observation to every connected client
//! - Supports graceful shutdown via `CancellationToken`
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   DaemonServer  │
//! │                 │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│  RegistryHandle │
//! │   (per client)  │     │                 │
//! └─────────────────┘     └────────┬────────┘
//!                                  │ observations
//!                                  ▼
//!                         ┌─────────────────┐
//!                         │   all clients   │
//!                         └─────────────────┘
//! ```
//!
//! Connecting is subscribing: there is no handshake, every client receives
//! every observation from the moment it is accepted.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Server errors are logged and allow continued operation

mod connection;

pub use connection::{ClientWriter, ClientsMap, ConnectionHandler};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::registry::RegistryHandle;

/// Write timeout per client; a client stuck longer than this is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP server for the smx daemon.
///
/// Manages client connections and observation broadcasting.
pub struct DaemonServer {
    /// Bound listener.
    listener: TcpListener,

    /// Handle to the session registry.
    registry: RegistryHandle,

    /// Cancellation token for graceful shutdown.
    cancel_token: CancellationToken,

    /// Connection counter for client identities.
    connection_counter: AtomicU64,

    /// Currently connected clients.
    clients: ClientsMap,
}

impl DaemonServer {
    /// Binds the listener.
    ///
    /// Failure here is fatal to daemon startup - there is no daemon without
    /// a socket.
    pub async fn bind(
        addr: &str,
        registry: RegistryHandle,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_string(),
                error: e.to_string(),
            })?;

        Ok(Self {
            listener,
            registry,
            cancel_token,
            connection_counter: AtomicU64::new(0),
            clients: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Returns the bound address (useful when binding port 0 in tests).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Runs the server.
    ///
    /// Accepts connections until the cancellation token fires. Does not
    /// return until shutdown.
    pub async fn run(&self) {
        info!(addr = ?self.local_addr(), "daemon server listening");

        self.spawn_observation_broadcaster();

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("server shutdown requested");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let connection = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            debug!(connection, peer = %peer, "client connected");
                            self.handle_connection(stream, connection).await;
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                            // Keep accepting other connections.
                        }
                    }
                }
            }
        }

        self.cleanup().await;
    }

    /// Registers the client and spawns its handler task.
    ///
    /// Registration happens here, before the handler runs, so a client never
    /// misses an observation caused by its own first command.
    async fn handle_connection(&self, stream: TcpStream, connection_number: u64) {
        let (reader, writer) = stream.into_split();
        let writer: ClientWriter = Arc::new(Mutex::new(BufWriter::new(writer)));

        self.clients
            .write()
            .await
            .insert(connection_number, Arc::clone(&writer));

        let registry = self.registry.clone();
        let clients = Arc::clone(&self.clients);

        tokio::spawn(async move {
            let handler = ConnectionHandler::new(reader, registry, connection_number);
            handler.run().await;

            if clients.write().await.remove(&connection_number).is_some() {
                debug!(connection = connection_number, "client disconnected");
            }
        });
    }

    /// Spawns the observation broadcaster task.
    ///
    /// Receives observations from the registry channel and writes them to
    /// every connected client.
    fn spawn_observation_broadcaster(&self) {
        let mut observations = self.registry.subscribe();
        let clients = Arc::clone(&self.clients);
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("observation broadcaster shutting down");
                        break;
                    }

                    result = observations.recv() => {
                        match result {
                            Ok(message) => broadcast_to_clients(&clients, &message).await,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "observation broadcaster lagged, skipped messages");
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                debug!("observation channel closed");
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    /// Returns the number of connected clients.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Performs cleanup on shutdown.
    async fn cleanup(&self) {
        self.clients.write().await.clear();
        info!("server cleanup complete");
    }
}

/// Writes one observation to every connected client.
///
/// Each observation goes out as one JSON-encoded string per line, so
/// multi-line bodies stay within a single frame. A failed or timed-out
/// write drops that client only; delivery to the others is unaffected.
async fn broadcast_to_clients(clients: &ClientsMap, message: &str) {
    let frame = match serde_json::to_string(message) {
        Ok(frame) => frame,
        Err(e) => {
            error!(error = %e, "failed to encode observation");
            return;
        }
    };

    // Snapshot under the read lock, write outside it.
    let snapshot: Vec<(u64, ClientWriter)> = clients
        .read()
        .await
        .iter()
        .map(|(connection, writer)| (*connection, Arc::clone(writer)))
        .collect();

    let mut failed = Vec::new();

    for (connection, writer) in snapshot {
        let mut writer = writer.lock().await;
        let send_result = timeout(WRITE_TIMEOUT, async {
            writer.write_all(frame.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        })
        .await;

        match send_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(connection, error = %e, "dropping client after write failure");
                failed.push(connection);
            }
            Err(_) => {
                debug!(connection, "dropping client after write timeout");
                failed.push(connection);
            }
        }
    }

    if !failed.is_empty() {
        let mut clients = clients.write().await;
        for connection in failed {
            clients.remove(&connection);
        }
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {error}")]
    Bind { addr: String, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::registry::spawn_registry;

    #[test]
    fn test_server_error_display() {
        let err = ServerError::Bind {
            addr: "127.0.0.1:7791".to_string(),
            error: "address in use".to_string(),
        };
        assert!(err.to_string().contains("127.0.0.1:7791"));
        assert!(err.to_string().contains("address in use"));
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let registry = spawn_registry(DaemonConfig::from_env());
        let server = DaemonServer::bind("127.0.0.1:0", registry, CancellationToken::new())
            .await
            .unwrap();

        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal_error() {
        let registry = spawn_registry(DaemonConfig::from_env());
        let result =
            DaemonServer::bind("256.256.256.256:1", registry, CancellationToken::new()).await;
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }
}
