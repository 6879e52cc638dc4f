//! Wire protocol for smxd client communication.
//!
//! Both directions are newline-delimited over the byte stream:
//! - Inbound: one JSON envelope per line, shaped
//!   `{"type": "<command>", "payload": {...}}`.
//! - Outbound: one JSON-encoded string per line, each a human-readable
//!   message prefixed `observation: `. JSON string encoding keeps
//!   multi-line observation bodies inside a single frame.
//!
//! Malformed inbound lines never terminate a connection; the daemon logs
//! and skips them.

pub mod command;
pub mod observation;

// Re-exports for convenience
pub use command::{Command, ParseError};
