//! Full-stack integration tests: a real listener on an ephemeral port, real
//! subprocesses, multiple concurrent clients.
//!
//! Every test drives the daemon exactly the way a remote client would:
//! newline-delimited JSON command envelopes in, JSON-encoded observation
//! strings out.

use std::io::Write as _;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use smx_core::SessionMode;
use smxd::config::DaemonConfig;
use smxd::registry::spawn_registry;
use smxd::relay::spawn_relay_task;
use smxd::server::DaemonServer;

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

fn test_config() -> DaemonConfig {
    DaemonConfig::from_env()
        .with_default_shell("/bin/cat")
        .with_flush_interval(Duration::from_millis(500))
        .with_max_sessions(8)
}

async fn start_daemon(config: DaemonConfig) -> (SocketAddr, CancellationToken) {
    let cancel = CancellationToken::new();
    let registry = spawn_registry(config.clone());
    spawn_relay_task(registry.clone(), config.flush_interval, cancel.clone());

    let server = DaemonServer::bind("127.0.0.1:0", registry, cancel.clone())
        .await
        .expect("bind ephemeral port");
    let addr = server.local_addr().expect("local addr");
    tokio::spawn(async move { server.run().await });

    (addr, cancel)
}

struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.expect("send");
        self.writer.write_all(b"\n").await.expect("send newline");
    }

    /// Receives one observation frame (a JSON-encoded string per line).
    async fn recv(&mut self) -> String {
        let mut line = String::new();
        let read = timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for an observation")
            .expect("read observation");
        assert_ne!(read, 0, "server closed the connection");
        serde_json::from_str(line.trim()).expect("observation frame is a JSON string")
    }

    /// Receives until a message contains `needle`; returns it along with
    /// every message skipped on the way.
    async fn recv_until(&mut self, needle: &str) -> (String, Vec<String>) {
        let mut skipped = Vec::new();
        loop {
            let message = self.recv().await;
            if message.contains(needle) {
                return (message, skipped);
            }
            skipped.push(message);
        }
    }

    /// Confirms this client is registered with the broadcast hub by asking
    /// for the (empty) session list and waiting for the reply. Only valid
    /// before any sessions exist.
    async fn barrier(&mut self) {
        self.send(r#"{"type":"listSessions"}"#).await;
        self.recv_until("no sessions open").await;
    }
}

/// Writes an executable helper script that never answers view requests.
#[cfg(unix)]
fn mute_helper() -> (tempfile::TempDir, String) {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("mute-vt");
    let mut file = std::fs::File::create(&path).expect("create helper");
    file.write_all(b"#!/bin/sh\nexec sleep 600\n")
        .expect("write helper");
    drop(file);
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");

    let path = path.to_string_lossy().into_owned();
    (dir, path)
}

#[tokio::test]
async fn coalesced_output_reaches_all_clients_exactly_once() {
    let (addr, _cancel) = start_daemon(test_config()).await;

    let mut alice = TestClient::connect(addr).await;
    alice.barrier().await;
    let mut bob = TestClient::connect(addr).await;
    bob.barrier().await;
    // Bob's barrier reply also went to Alice; drain it.
    alice.recv_until("no sessions open").await;

    alice
        .send(r#"{"type":"newSession","payload":{"id":"cat1","binaryPath":"/bin/cat"}}"#)
        .await;
    alice
        .recv_until("created new session 'cat1' and made it active")
        .await;
    bob.recv_until("created new session 'cat1'").await;

    // Five fragments inside one tick interval.
    alice
        .send(r#"{"type":"input","payload":{"text":"f1\nf2\nf3\nf4\nf5\n"}}"#)
        .await;

    for client in [&mut alice, &mut bob] {
        let (message, skipped) = client.recv_until("new output in session 'cat1'").await;
        let mut last = 0;
        for marker in ["f1", "f2", "f3", "f4", "f5"] {
            let position = message[last..]
                .find(marker)
                .unwrap_or_else(|| panic!("{marker} missing or out of order in {message:?}"));
            last += position;
        }
        assert!(
            skipped.iter().all(|m| !m.contains("new output")),
            "duplicate output observation: {skipped:?}"
        );
    }

    // Exactly once: nothing else flushes for that input.
    alice.send(r#"{"type":"whichSessionActive"}"#).await;
    let (_, skipped) = alice.recv_until("active session is 'cat1'").await;
    assert!(
        skipped.iter().all(|m| !m.contains("new output")),
        "output was delivered twice: {skipped:?}"
    );
}

#[tokio::test]
async fn session_id_round_trip() {
    let (addr, _cancel) = start_daemon(test_config()).await;
    let mut client = TestClient::connect(addr).await;
    client.barrier().await;

    client
        .send(r#"{"type":"newSession","payload":{"id":"round-1"}}"#)
        .await;
    client.recv_until("created new session 'round-1'").await;

    client.send(r#"{"type":"whichSessionActive"}"#).await;
    let (message, _) = client.recv_until("active session").await;
    assert_eq!(message, "observation: active session is 'round-1'");

    client.send(r#"{"type":"listSessions"}"#).await;
    let (message, _) = client.recv_until("open sessions").await;
    assert_eq!(message, "observation: open sessions: round-1");
    assert_eq!(message.matches("round-1").count(), 1);
}

#[tokio::test]
async fn switch_to_missing_session_leaves_active_unchanged() {
    let (addr, _cancel) = start_daemon(test_config()).await;
    let mut client = TestClient::connect(addr).await;
    client.barrier().await;

    client
        .send(r#"{"type":"newSession","payload":{"id":"home"}}"#)
        .await;
    client.recv_until("created new session 'home'").await;

    client
        .send(r#"{"type":"switchToSession","payload":{"id":"ghost"}}"#)
        .await;
    let (message, _) = client.recv_until("ghost").await;
    assert_eq!(message, "observation: session 'ghost' not found");

    client.send(r#"{"type":"whichSessionActive"}"#).await;
    let (message, _) = client.recv_until("active session").await;
    assert_eq!(message, "observation: active session is 'home'");
}

#[tokio::test]
async fn exit_of_active_session_clears_it() {
    let (addr, _cancel) = start_daemon(test_config()).await;
    let mut client = TestClient::connect(addr).await;
    client.barrier().await;

    client
        .send(
            r#"{"type":"newSession","payload":{"id":"brief","binaryPath":"/bin/sh","binaryArgs":["-c","exit 0"]}}"#,
        )
        .await;
    client.recv_until("created new session 'brief'").await;

    let (message, _) = client.recv_until("exited").await;
    assert_eq!(message, "observation: session 'brief' exited with code 0");

    client
        .send(r#"{"type":"runCommand","payload":{"text":"echo hello"}}"#)
        .await;
    let (message, _) = client.recv_until("no sessions").await;
    assert_eq!(message, "observation: no sessions open");
}

#[tokio::test]
async fn creating_a_session_always_activates_it() {
    let (addr, _cancel) = start_daemon(test_config()).await;
    let mut client = TestClient::connect(addr).await;
    client.barrier().await;

    for id in ["one", "two"] {
        client
            .send(&format!(
                r#"{{"type":"newSession","payload":{{"id":"{id}"}}}}"#
            ))
            .await;
        client
            .recv_until(&format!("created new session '{id}'"))
            .await;
    }

    client
        .send(r#"{"type":"switchToSession","payload":{"id":"one"}}"#)
        .await;
    client.recv_until("switched to session 'one'").await;

    client
        .send(r#"{"type":"newSession","payload":{"id":"three"}}"#)
        .await;
    client.recv_until("created new session 'three'").await;

    client.send(r#"{"type":"whichSessionActive"}"#).await;
    let (message, _) = client.recv_until("active session").await;
    assert_eq!(message, "observation: active session is 'three'");
}

#[tokio::test]
async fn look_at_active_session_spans_flushed_history() {
    let (addr, _cancel) = start_daemon(test_config()).await;
    let mut client = TestClient::connect(addr).await;
    client.barrier().await;

    client
        .send(r#"{"type":"newSession","payload":{"id":"memory"}}"#)
        .await;
    client.recv_until("created new session 'memory'").await;

    client
        .send(r#"{"type":"input","payload":{"text":"remember me\n"}}"#)
        .await;
    // Wait until the relay has flushed it into history.
    client.recv_until("new output in session 'memory'").await;

    client.send(r#"{"type":"lookAtActiveSession"}"#).await;
    let (message, _) = client.recv_until("contents of session 'memory'").await;
    assert!(
        message.contains("remember me"),
        "history lost after flush: {message:?}"
    );
}

#[tokio::test]
async fn dead_client_does_not_block_the_rest() {
    let (addr, _cancel) = start_daemon(test_config()).await;

    let mut alice = TestClient::connect(addr).await;
    alice.barrier().await;
    let mut bob = TestClient::connect(addr).await;
    bob.barrier().await;
    alice.recv_until("no sessions open").await;

    alice
        .send(r#"{"type":"newSession","payload":{"id":"survivor"}}"#)
        .await;
    alice.recv_until("created new session 'survivor'").await;
    bob.recv_until("created new session 'survivor'").await;

    // Bob dies without saying goodbye.
    drop(bob);

    alice
        .send(r#"{"type":"input","payload":{"text":"still here\n"}}"#)
        .await;
    let (message, _) = alice.recv_until("new output in session 'survivor'").await;
    assert!(message.contains("still here"));
}

#[cfg(unix)]
#[tokio::test]
async fn rendered_view_timeout_does_not_block_other_commands() {
    let (_dir, helper) = mute_helper();
    let config = test_config()
        .with_mode(SessionMode::Rendered)
        .with_helper_bin(helper)
        .with_view_timeout(Duration::from_millis(1500));
    let (addr, _cancel) = start_daemon(config).await;

    let mut alice = TestClient::connect(addr).await;
    alice.barrier().await;
    let mut bob = TestClient::connect(addr).await;
    bob.barrier().await;
    alice.recv_until("no sessions open").await;

    alice
        .send(r#"{"type":"newSession","payload":{"id":"render","binaryPath":"/bin/sh"}}"#)
        .await;
    alice.recv_until("created new session 'render'").await;
    bob.recv_until("created new session 'render'").await;

    // Alice's view request will hang until the timeout; Bob keeps working.
    alice.send(r#"{"type":"lookAtActiveSession"}"#).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    bob.send(r#"{"type":"listSessions"}"#).await;

    // On Alice's stream the list reply must land before the view timeout,
    // proving the pending view blocked nobody.
    let (message, skipped) = alice
        .recv_until("did not return a view within 1500 ms")
        .await;
    assert_eq!(
        message,
        "observation: session 'render' did not return a view within 1500 ms"
    );
    assert!(
        skipped.iter().any(|m| m.contains("open sessions: render")),
        "list reply was blocked behind the view wait: {skipped:?}"
    );
}

#[tokio::test]
async fn close_session_tears_down_through_exit_path() {
    let (addr, _cancel) = start_daemon(test_config()).await;
    let mut client = TestClient::connect(addr).await;
    client.barrier().await;

    client
        .send(r#"{"type":"newSession","payload":{"id":"doomed"}}"#)
        .await;
    client.recv_until("created new session 'doomed'").await;

    client
        .send(r#"{"type":"closeSession","payload":{"id":"doomed"}}"#)
        .await;
    let (message, _) = client.recv_until("doomed").await;
    assert!(
        message.contains("terminated by signal") || message.contains("exited"),
        "unexpected teardown message: {message:?}"
    );

    client.send(r#"{"type":"listSessions"}"#).await;
    let (message, _) = client.recv_until("sessions").await;
    assert_eq!(message, "observation: no sessions open");
}
