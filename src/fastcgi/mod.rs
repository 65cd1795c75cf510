//! FastCGI responder personality (§4.7): record framing, BEGIN_REQUEST/PARAMS/STDIN
//! aggregation, STDOUT/STDERR stream writers, END_REQUEST, and management records.
//!
//! Mirrors the HTTP personality's split in `crate::http`: `record` holds the pure
//! wire codec (testable without a socket), `connection` drives a
//! [`crate::io::Connection`] through it via the same `try_read_exact` probes.

pub mod connection;
pub mod record;

pub use connection::{FastCgiConnection, FastCgiSettings, FcgiHandler, FcgiOutput, Progress};
pub use record::RecordError;
