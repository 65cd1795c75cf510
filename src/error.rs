//! Crate-wide error type.
//!
//! Parsers keep their own narrow error enums (see [`crate::http::request::ParseError`],
//! [`crate::fastcgi::record::RecordError`]) and convert into [`Error`] only once the
//! failure reaches the reactor boundary, where it turns into a protocol response or a
//! connection teardown rather than unwinding further.

use std::io;
use std::net::AddrParseError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid address: {0}")]
    AddrParse(#[from] AddrParseError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("http protocol error: {0}")]
    Http(#[from] crate::http::request::ParseError),

    #[error("fastcgi protocol error: {0}")]
    FastCgi(#[from] crate::fastcgi::record::RecordError),

    #[error("fatal startup error: {0}")]
    Fatal(String),
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Error::Config(message)
    }
}

impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Error::Config(message.to_string())
    }
}
