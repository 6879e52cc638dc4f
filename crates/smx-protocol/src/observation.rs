//! Outbound observation formatting.
//!
//! Every message the daemon sends is a human-readable string prefixed
//! `observation: `, broadcast to all connected clients. Formatting lives
//! here so the daemon and its tests agree on exact phrasing.

use smx_core::SessionId;

/// Prefix carried by every outbound message.
pub const PREFIX: &str = "observation: ";

/// A session was created and made active.
pub fn session_created(id: &SessionId) -> String {
    format!("{PREFIX}created new session '{id}' and made it active")
}

/// The active session changed.
pub fn session_switched(id: &SessionId) -> String {
    format!("{PREFIX}switched to session '{id}'")
}

/// A command named a session that does not exist.
pub fn session_not_found(id: &SessionId) -> String {
    format!("{PREFIX}session '{id}' not found")
}

/// Reply to `whichSessionActive` when a session is active.
pub fn active_session(id: &SessionId) -> String {
    format!("{PREFIX}active session is '{id}'")
}

/// Reply to `whichSessionActive` when nothing is active.
pub fn no_active_session() -> String {
    format!("{PREFIX}no active session")
}

/// Reply to `listSessions`; falls back to [`no_sessions_open`] when empty.
pub fn session_list(ids: &[SessionId]) -> String {
    if ids.is_empty() {
        return no_sessions_open();
    }
    let names: Vec<&str> = ids.iter().map(SessionId::as_str).collect();
    format!("{PREFIX}open sessions: {}", names.join(", "))
}

/// A command needed a session but none are open.
pub fn no_sessions_open() -> String {
    format!("{PREFIX}no sessions open")
}

/// Coalesced output flushed by the relay tick.
pub fn session_output(id: &SessionId, output: &str) -> String {
    format!("{PREFIX}new output in session '{id}':\n{output}")
}

/// Full accumulated output or rendered view, for `lookAtActiveSession`.
pub fn session_contents(id: &SessionId, contents: &str) -> String {
    format!("{PREFIX}contents of session '{id}':\n{contents}")
}

/// A session's subprocess terminated.
pub fn session_exited(id: &SessionId, code: Option<i32>, signal: Option<i32>) -> String {
    match (code, signal) {
        (Some(code), _) => format!("{PREFIX}session '{id}' exited with code {code}"),
        (None, Some(signal)) => {
            format!("{PREFIX}session '{id}' was terminated by signal {signal}")
        }
        (None, None) => format!("{PREFIX}session '{id}' exited"),
    }
}

/// Session creation failed (spawn error, capacity, ...).
pub fn creation_failed(reason: &str) -> String {
    format!("{PREFIX}failed to create session: {reason}")
}

/// Session creation named an id that is already taken.
pub fn duplicate_session(id: &SessionId) -> String {
    format!("{PREFIX}session '{id}' already exists")
}

/// The renderer helper did not answer a view request in time.
pub fn view_timed_out(id: &SessionId, timeout_ms: u64) -> String {
    format!("{PREFIX}session '{id}' did not return a view within {timeout_ms} ms")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> SessionId {
        SessionId::new(s)
    }

    #[test]
    fn test_every_message_carries_the_prefix() {
        let messages = [
            session_created(&id("a")),
            session_switched(&id("a")),
            session_not_found(&id("a")),
            active_session(&id("a")),
            no_active_session(),
            session_list(&[id("a")]),
            no_sessions_open(),
            session_output(&id("a"), "x"),
            session_contents(&id("a"), "x"),
            session_exited(&id("a"), Some(0), None),
            creation_failed("nope"),
            duplicate_session(&id("a")),
            view_timed_out(&id("a"), 5000),
        ];
        for message in messages {
            assert!(message.starts_with(PREFIX), "missing prefix: {message}");
        }
    }

    #[test]
    fn test_created() {
        assert_eq!(
            session_created(&id("build")),
            "observation: created new session 'build' and made it active"
        );
    }

    #[test]
    fn test_switched_and_not_found() {
        assert_eq!(
            session_switched(&id("build")),
            "observation: switched to session 'build'"
        );
        assert_eq!(
            session_not_found(&id("ghost")),
            "observation: session 'ghost' not found"
        );
    }

    #[test]
    fn test_active() {
        assert_eq!(
            active_session(&id("build")),
            "observation: active session is 'build'"
        );
        assert_eq!(no_active_session(), "observation: no active session");
    }

    #[test]
    fn test_list_preserves_order() {
        let ids = [id("first"), id("second"), id("third")];
        assert_eq!(
            session_list(&ids),
            "observation: open sessions: first, second, third"
        );
    }

    #[test]
    fn test_empty_list_reads_as_none_open() {
        assert_eq!(session_list(&[]), "observation: no sessions open");
        assert_eq!(no_sessions_open(), "observation: no sessions open");
    }

    #[test]
    fn test_output_and_contents() {
        assert_eq!(
            session_output(&id("build"), "line1\nline2\n"),
            "observation: new output in session 'build':\nline1\nline2\n"
        );
        assert_eq!(
            session_contents(&id("build"), "screen"),
            "observation: contents of session 'build':\nscreen"
        );
    }

    #[test]
    fn test_exited_variants() {
        assert_eq!(
            session_exited(&id("a"), Some(1), None),
            "observation: session 'a' exited with code 1"
        );
        assert_eq!(
            session_exited(&id("a"), None, Some(9)),
            "observation: session 'a' was terminated by signal 9"
        );
        assert_eq!(
            session_exited(&id("a"), None, None),
            "observation: session 'a' exited"
        );
    }

    #[test]
    fn test_failures() {
        assert_eq!(
            creation_failed("spawn failed"),
            "observation: failed to create session: spawn failed"
        );
        assert_eq!(
            duplicate_session(&id("build")),
            "observation: session 'build' already exists"
        );
        assert_eq!(
            view_timed_out(&id("render"), 5000),
            "observation: session 'render' did not return a view within 5000 ms"
        );
    }
}
