//! Session value objects: identifiers, lifecycle state, output mode.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Unique identifier for a managed session.
///
/// Either caller-supplied via the `newSession` command or generated as a
/// random UUID v4 when the caller omits one. Immutable for the session's
/// lifetime; never reused automatically after the session exits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a SessionId from a caller-supplied string.
    ///
    /// No format validation is applied: ids are opaque to the daemon.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a collision-resistant random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Lifecycle state of a session.
///
/// `Exited` is terminal: the session is removed from the registry on that
/// transition and its id is not reused automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, subprocess not yet confirmed running.
    Starting,
    /// Subprocess handle exists and its pipes are wired.
    Running,
    /// The subprocess has exited.
    Exited,
}

impl SessionState {
    /// Whether this state admits no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

// ============================================================================
// Output Mode
// ============================================================================

/// How a session's subprocess produces output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    /// The subprocess is the shell itself; its stdout/stderr bytes are the
    /// session's output fragments.
    #[default]
    Direct,
    /// The subprocess is a renderer helper driving a pseudo-terminal; output
    /// is obtained by asking the helper for a view snapshot.
    Rendered,
}

impl SessionMode {
    /// Parses a mode name as used in configuration.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Some(Self::Direct),
            "rendered" => Some(Self::Rendered),
            _ => None,
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Rendered => write!(f, "rendered"),
        }
    }
}
