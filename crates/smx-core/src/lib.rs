//! smx core - shared domain types for the session multiplexer.
//!
//! This crate provides the types shared between the daemon (`smxd`) and the
//! wire protocol (`smx-protocol`): session identifiers, lifecycle state,
//! output modes, and the domain error taxonomy.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod session;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use session::{SessionId, SessionMode, SessionState};
