//! Readiness backend abstraction (§4.1) and buffered per-connection I/O state
//! machine (§4.2).

pub mod backend;
pub mod connection;

pub use backend::{Backend, BackendKind, EventMask};
pub use connection::{Connection, ReadUntilOutcome, Role, SendOutcome};
