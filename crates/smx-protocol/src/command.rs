//! Inbound command parsing.
//!
//! Commands arrive as newline-delimited JSON envelopes:
//!
//! ```json
//! {"type": "newSession", "payload": {"id": "build", "binaryPath": "/bin/bash"}}
//! ```
//!
//! The envelope is decoded first, then the payload per command, so that an
//! absent or empty payload is accepted wherever no fields are required.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use smx_core::SessionId;

/// A parsed client command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Create a new session and make it active.
    NewSession {
        id: Option<SessionId>,
        binary_path: Option<String>,
        binary_args: Vec<String>,
    },

    /// Write text plus a trailing newline to the active session.
    RunCommand { text: String },

    /// Write text verbatim to the active session.
    Input { text: String },

    /// Make the named session active.
    SwitchToSession { id: SessionId },

    /// Report the active session id.
    WhichSessionActive,

    /// Report all session ids in creation order.
    ListSessions,

    /// Report the active session's accumulated output or rendered view.
    LookAtActiveSession,

    /// Resize the active session's terminal.
    Resize { cols: u16, rows: u16 },

    /// Terminate the named session (default: the active one).
    CloseSession { id: Option<SessionId> },
}

/// Errors produced when an inbound line cannot be understood.
///
/// Always recovered by the dispatcher: the offending line is logged and
/// skipped, never closing the connection.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The line is not a `{type, payload}` JSON envelope.
    #[error("invalid message envelope: {0}")]
    Envelope(String),

    /// The envelope names a command this daemon does not know.
    #[error("unknown command type: {0}")]
    UnknownType(String),

    /// The payload does not fit the named command.
    #[error("invalid payload for {command}: {reason}")]
    Payload { command: String, reason: String },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct NewSessionPayload {
    id: Option<String>,
    binary_path: Option<String>,
    binary_args: Vec<String>,
}

#[derive(Deserialize)]
struct TextPayload {
    text: String,
}

#[derive(Deserialize)]
struct IdPayload {
    id: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct OptionalIdPayload {
    id: Option<String>,
}

#[derive(Deserialize)]
struct ResizePayload {
    cols: u16,
    rows: u16,
}

fn decode<T: DeserializeOwned>(command: &str, payload: Value) -> Result<T, ParseError> {
    // An omitted payload arrives as Null; treat it like an empty object so
    // commands with all-optional fields accept it.
    let payload = if payload.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        payload
    };

    serde_json::from_value(payload).map_err(|e| ParseError::Payload {
        command: command.to_string(),
        reason: e.to_string(),
    })
}

impl Command {
    /// Parses one line of input into a command.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let Envelope { kind, payload } =
            serde_json::from_str(line).map_err(|e| ParseError::Envelope(e.to_string()))?;

        match kind.as_str() {
            "newSession" => {
                let p: NewSessionPayload = decode("newSession", payload)?;
                Ok(Self::NewSession {
                    id: p.id.map(SessionId::new),
                    binary_path: p.binary_path,
                    binary_args: p.binary_args,
                })
            }
            "runCommand" => {
                let p: TextPayload = decode("runCommand", payload)?;
                Ok(Self::RunCommand { text: p.text })
            }
            "input" => {
                let p: TextPayload = decode("input", payload)?;
                Ok(Self::Input { text: p.text })
            }
            "switchToSession" => {
                let p: IdPayload = decode("switchToSession", payload)?;
                Ok(Self::SwitchToSession {
                    id: SessionId::new(p.id),
                })
            }
            "whichSessionActive" => Ok(Self::WhichSessionActive),
            "listSessions" => Ok(Self::ListSessions),
            "lookAtActiveSession" => Ok(Self::LookAtActiveSession),
            "resize" => {
                let p: ResizePayload = decode("resize", payload)?;
                Ok(Self::Resize {
                    cols: p.cols,
                    rows: p.rows,
                })
            }
            "closeSession" => {
                let p: OptionalIdPayload = decode("closeSession", payload)?;
                Ok(Self::CloseSession {
                    id: p.id.map(SessionId::new),
                })
            }
            other => Err(ParseError::UnknownType(other.to_string())),
        }
    }
}
