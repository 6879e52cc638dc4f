//! One managed subprocess session.
//!
//! A session owns exactly one child process. In direct mode the child is the
//! shell itself and its stdout/stderr bytes are the session's output
//! fragments. In rendered mode the child is a renderer helper that drives a
//! pseudo-terminal behind the scenes; the daemon talks to it over its
//! stdin/stdout with one JSON request or reply per line
//! (`{"type": "input" | "resize" | "getView", ...}`), and output is obtained
//! by asking for a view snapshot rather than by reading a stream.
//!
//! Instead of registering callbacks on the child's pipes, each session owns
//! two tasks: a read loop that owns the output stream, and an exit watcher
//! that owns the child handle and reports termination to the registry
//! exactly once. Killing a session cancels its token; teardown then rides
//! the same path as a natural exit.

use std::collections::VecDeque;
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use smx_core::{DomainError, SessionId, SessionMode, SessionState};

use crate::config::DaemonConfig;
use crate::registry::RegistryCommand;

/// Read buffer size for direct-mode output.
const READ_BUFFER_SIZE: usize = 4096;

/// Locks a std mutex, recovering the data from a poisoned lock.
///
/// Critical sections here are short and never hold the guard across an
/// await, so a poisoned lock still contains usable state.
fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exit details reported by a session's watcher task.
#[derive(Debug, Clone, Copy)]
pub struct SessionExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Buffered output shared between the read loop, the relay flush, and
/// look-at requests. The read loop is the only appender; the flush is the
/// only drainer; the mutex serializes the two.
#[derive(Debug, Default)]
pub struct OutputBuffers {
    /// Fragments received since the last flush.
    pending: Vec<String>,
    /// Fragments already flushed to clients, kept for replay.
    history: Vec<String>,
}

impl OutputBuffers {
    fn push(&mut self, fragment: String) {
        self.pending.push(fragment);
    }

    /// Drains pending fragments into history, returning their concatenation
    /// in arrival order. `None` when nothing is pending.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let drained = std::mem::take(&mut self.pending);
        let coalesced = drained.concat();
        self.history.extend(drained);
        Some(coalesced)
    }

    /// All accumulated output, flushed and pending alike, in arrival order.
    pub fn snapshot(&self) -> String {
        let mut all = String::new();
        for fragment in self.history.iter().chain(self.pending.iter()) {
            all.push_str(fragment);
        }
        all
    }
}

/// Cheap-to-clone handle for interacting with a running session.
///
/// Handles are stored in the registry and cloned out to connection tasks,
/// so session I/O (writes, view requests) never runs inside the registry
/// actor.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    mode: SessionMode,
    created_at: DateTime<Utc>,
    stdin: Arc<Mutex<ChildStdin>>,
    buffers: Arc<StdMutex<OutputBuffers>>,
    view_waiters: Arc<StdMutex<VecDeque<oneshot::Sender<String>>>>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    view_timeout: Duration,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current lifecycle state. `Starting` is never observable through a
    /// handle: handles only exist once the subprocess is wired up.
    pub fn state(&self) -> SessionState {
        if self.running.load(Ordering::SeqCst) {
            SessionState::Running
        } else {
            SessionState::Exited
        }
    }

    /// Sends text to the subprocess input, unmodified.
    ///
    /// Writes to an exited session are logged and dropped, never raised.
    pub async fn write(&self, text: &str) {
        if self.state().is_terminal() {
            warn!(session_id = %self.id, "dropping write to exited session");
            return;
        }

        let line = match self.mode {
            SessionMode::Direct => text.to_string(),
            SessionMode::Rendered => {
                match helper_line(&json!({"type": "input", "payload": text})) {
                    Some(line) => line,
                    None => return,
                }
            }
        };

        self.write_stdin(&line).await;
    }

    /// Resizes the rendered terminal; logged no-op in direct mode.
    pub async fn resize(&self, cols: u16, rows: u16) {
        match self.mode {
            SessionMode::Direct => {
                debug!(session_id = %self.id, "resize ignored for direct-mode session");
            }
            SessionMode::Rendered => {
                if let Some(line) =
                    helper_line(&json!({"type": "resize", "cols": cols, "rows": rows}))
                {
                    self.write_stdin(&line).await;
                }
            }
        }
    }

    /// Returns what a client should see when looking at this session: the
    /// rendered view in rendered mode, or all accumulated output (flushed
    /// and pending alike) in direct mode.
    pub async fn look(&self) -> Result<String, DomainError> {
        match self.mode {
            SessionMode::Direct => Ok(lock(&self.buffers).snapshot()),
            SessionMode::Rendered => self.request_view().await,
        }
    }

    /// Issues a `getView` request and awaits exactly one reply line from
    /// the helper, failing with `ViewTimeout` if none arrives in time.
    pub async fn request_view(&self) -> Result<String, DomainError> {
        let (tx, rx) = oneshot::channel();
        lock(&self.view_waiters).push_back(tx);

        if let Some(line) = helper_line(&json!({"type": "getView"})) {
            self.write_stdin(&line).await;
        }

        match timeout(self.view_timeout, rx).await {
            Ok(Ok(view)) => Ok(view),
            // Elapsed, or the read loop ended and dropped our waiter.
            _ => Err(DomainError::ViewTimeout {
                session_id: self.id.clone(),
                timeout_ms: self.view_timeout.as_millis() as u64,
            }),
        }
    }

    /// Atomically drains pending output for a relay flush.
    pub fn take_pending(&self) -> Option<String> {
        lock(&self.buffers).flush()
    }

    /// Requests termination of the subprocess. Teardown is reported by the
    /// exit watcher through the ordinary exit path.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn push_fragment(&self, fragment: String) {
        lock(&self.buffers).push(fragment);
    }

    async fn write_stdin(&self, data: &str) {
        let mut stdin = self.stdin.lock().await;
        if let Err(e) = stdin.write_all(data.as_bytes()).await {
            warn!(session_id = %self.id, error = %e, "session input write failed");
            return;
        }
        if let Err(e) = stdin.flush().await {
            warn!(session_id = %self.id, error = %e, "session input flush failed");
        }
    }
}

/// Encodes one helper request as a single line.
fn helper_line(value: &serde_json::Value) -> Option<String> {
    match serde_json::to_string(value) {
        Ok(mut line) => {
            line.push('\n');
            Some(line)
        }
        Err(e) => {
            warn!(error = %e, "failed to encode helper request");
            None
        }
    }
}

/// Pulls the view text out of a helper reply line.
///
/// The helper answers with a single-line JSON object; its `view` field is
/// the rendered screen. A reply that is not such an object is passed
/// through as-is.
fn extract_view(line: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(line) {
        Ok(value) => value
            .get("view")
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
            .unwrap_or_else(|| line.to_string()),
        Err(_) => line.to_string(),
    }
}

/// Spawns the session subprocess plus its read-loop and exit-watcher tasks.
///
/// On success the session is running and the returned handle can be stored
/// in the registry; on failure nothing is left behind and the session is
/// never inserted.
pub fn spawn_session(
    id: SessionId,
    binary_path: &str,
    binary_args: &[String],
    config: &DaemonConfig,
    registry_tx: mpsc::Sender<RegistryCommand>,
) -> Result<SessionHandle, DomainError> {
    debug!(session_id = %id, state = %SessionState::Starting, binary = %binary_path, "spawning session");

    let mut command = match config.mode {
        SessionMode::Direct => {
            let mut c = Command::new(binary_path);
            c.args(binary_args);
            c
        }
        SessionMode::Rendered => {
            let mut c = Command::new(&config.helper_bin);
            c.arg("--size")
                .arg(format!("{}x{}", config.helper_cols, config.helper_rows))
                .arg(binary_path)
                .args(binary_args);
            c
        }
    };
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| DomainError::SpawnFailure {
        reason: format!("{binary_path}: {e}"),
    })?;

    let stdin = take_pipe(child.stdin.take(), "stdin")?;
    let stdout = take_pipe(child.stdout.take(), "stdout")?;
    let stderr = take_pipe(child.stderr.take(), "stderr")?;

    let handle = SessionHandle {
        id: id.clone(),
        mode: config.mode,
        created_at: Utc::now(),
        stdin: Arc::new(Mutex::new(stdin)),
        buffers: Arc::new(StdMutex::new(OutputBuffers::default())),
        view_waiters: Arc::new(StdMutex::new(VecDeque::new())),
        running: Arc::new(AtomicBool::new(true)),
        cancel: CancellationToken::new(),
        view_timeout: config.view_timeout,
    };

    match config.mode {
        SessionMode::Direct => spawn_direct_read_loop(handle.clone(), stdout, stderr),
        SessionMode::Rendered => spawn_rendered_read_loops(handle.clone(), stdout, stderr),
    }
    spawn_exit_watcher(handle.clone(), child, registry_tx);

    info!(
        session_id = %id,
        mode = %config.mode,
        binary = %binary_path,
        state = %handle.state(),
        "session spawned"
    );
    Ok(handle)
}

fn take_pipe<T>(pipe: Option<T>, name: &str) -> Result<T, DomainError> {
    pipe.ok_or_else(|| DomainError::SpawnFailure {
        reason: format!("child {name} unavailable"),
    })
}

/// Direct mode: one task owns both output pipes and appends raw chunks to
/// the pending buffer in arrival order.
fn spawn_direct_read_loop(handle: SessionHandle, stdout: ChildStdout, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut stdout = stdout;
        let mut stderr = stderr;
        let mut out_buf = vec![0u8; READ_BUFFER_SIZE];
        let mut err_buf = vec![0u8; READ_BUFFER_SIZE];
        let mut out_open = true;
        let mut err_open = true;

        while out_open || err_open {
            tokio::select! {
                read = stdout.read(&mut out_buf), if out_open => match read {
                    Ok(0) => out_open = false,
                    Ok(n) => {
                        if let Some(chunk) = out_buf.get(..n) {
                            handle.push_fragment(String::from_utf8_lossy(chunk).into_owned());
                        }
                    }
                    Err(e) => {
                        debug!(session_id = %handle.id, error = %e, "stdout read failed");
                        out_open = false;
                    }
                },
                read = stderr.read(&mut err_buf), if err_open => match read {
                    Ok(0) => err_open = false,
                    Ok(n) => {
                        if let Some(chunk) = err_buf.get(..n) {
                            handle.push_fragment(String::from_utf8_lossy(chunk).into_owned());
                        }
                    }
                    Err(e) => {
                        debug!(session_id = %handle.id, error = %e, "stderr read failed");
                        err_open = false;
                    }
                },
            }
        }

        debug!(session_id = %handle.id, "output streams closed");
        // Pipe closure or error is an implicit exit; the watcher owns the
        // actual teardown.
        handle.cancel.cancel();
    });
}

/// Rendered mode: the helper buffers subprocess output itself and only ever
/// writes a line in reply to a request we issued, so every stdout line is
/// routed to the oldest outstanding view request. Helper stderr carries its
/// diagnostics and is logged, never treated as session output.
fn spawn_rendered_read_loops(handle: SessionHandle, stdout: ChildStdout, stderr: ChildStderr) {
    let reply_handle = handle.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let waiter = lock(&reply_handle.view_waiters).pop_front();
                    match waiter {
                        Some(tx) => {
                            if tx.send(extract_view(&line)).is_err() {
                                // Requester gave up (timed out); reply discarded.
                                debug!(session_id = %reply_handle.id, "discarded late view reply");
                            }
                        }
                        None => {
                            warn!(session_id = %reply_handle.id, "unsolicited helper output dropped");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(session_id = %reply_handle.id, error = %e, "helper read failed");
                    break;
                }
            }
        }

        // Helper gone: fail outstanding view requests now instead of letting
        // each run out its timeout.
        lock(&reply_handle.view_waiters).clear();
        debug!(session_id = %reply_handle.id, "helper stream closed");
        reply_handle.cancel.cancel();
    });

    let id = handle.id.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(session_id = %id, line = %line, "helper stderr");
        }
    });
}

/// Owns the child handle: awaits termination (or the cancel token, which
/// kills first), then reports the exit to the registry exactly once.
fn spawn_exit_watcher(
    handle: SessionHandle,
    mut child: Child,
    registry_tx: mpsc::Sender<RegistryCommand>,
) {
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = handle.cancel.cancelled() => {
                if let Err(e) = child.start_kill() {
                    debug!(session_id = %handle.id, error = %e, "kill after cancel failed");
                }
                child.wait().await
            }
        };

        handle.running.store(false, Ordering::SeqCst);

        let exit = match status {
            Ok(status) => SessionExit {
                code: status.code(),
                signal: status_signal(&status),
            },
            Err(e) => {
                warn!(session_id = %handle.id, error = %e, "failed to reap session process");
                SessionExit {
                    code: None,
                    signal: None,
                }
            }
        };

        let lifetime = Utc::now().signed_duration_since(handle.created_at);
        info!(
            session_id = %handle.id,
            code = ?exit.code,
            signal = ?exit.signal,
            lifetime_secs = lifetime.num_seconds(),
            "session process exited"
        );

        if registry_tx
            .send(RegistryCommand::SessionExited {
                session_id: handle.id.clone(),
                exit,
            })
            .await
            .is_err()
        {
            debug!(session_id = %handle.id, "registry gone before exit report");
        }
    });
}

#[cfg(unix)]
fn status_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn status_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
