//! Per-connection buffered I/O state machine (§3, §4.2).
//!
//! A [`Connection`] owns nothing about HTTP or FastCGI; it is the substrate
//! both personalities parse against. Rather than storing the "next
//! continuation" as a callback (the source's `read_until(delim, cb)` style),
//! this crate keeps the continuation implicit in the owning personality's own
//! state enum (see `http::request::ParsingState`, `fastcgi::connection::Phase`)
//! and exposes `try_read_until`/`try_read_exact` as one-shot probes the
//! personality re-issues on every readable event — the "explicit per-connection
//! state machine" option named in the design notes.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::time::Instant;

use crate::io::backend::{self, EventMask};

/// Buffer is compacted only once the write cursor has advanced this far, so a
/// long tail of small partial sends doesn't repeatedly memmove the buffer head.
const COMPACT_THRESHOLD: usize = 65_536;

pub const DEFAULT_READ_SIZE: usize = 4096;
pub const UPLOAD_READ_SIZE_SMALL: usize = 64 * 1024;
pub const UPLOAD_READ_SIZE_LARGE: usize = 128 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Regular,
    Host,
    Channel,
    BlockingChannel,
}

/// Outcome of a `try_read_until` probe.
pub enum ReadUntilOutcome {
    /// The delimiter was found; `data` is the consumed prefix including the
    /// delimiter itself.
    Found(Vec<u8>),
    /// `max_bytes` was exceeded before the delimiter appeared (or the
    /// delimiter appeared past `max_bytes`).
    MaxBytesExceeded,
    /// Not enough data buffered yet; READ interest has been asserted.
    Pending,
}

pub enum SendOutcome {
    /// Write buffer fully drained.
    Drained,
    /// Bytes remain; WRITE interest remains asserted.
    Partial,
    /// The peer reset the connection or another fatal write error occurred.
    Closed,
}

/// One per accepted socket or IPC channel endpoint (§3).
pub struct Connection<S> {
    pub stream: S,
    pub role: Role,
    read_buffer: VecDeque<u8>,
    write_buffer: Vec<u8>,
    write_cursor: usize,
    interest: EventMask,
    pub read_size: usize,
    pub last_access: Instant,
    closed: bool,
}

impl<S: Read + Write> Connection<S> {
    pub fn new(stream: S, role: Role) -> Self {
        let interest = match role {
            Role::Host => backend::READ,
            Role::BlockingChannel => 0,
            _ => backend::READ,
        };
        Self {
            stream,
            role,
            read_buffer: VecDeque::with_capacity(DEFAULT_READ_SIZE),
            write_buffer: Vec::new(),
            write_cursor: 0,
            interest,
            read_size: DEFAULT_READ_SIZE,
            last_access: Instant::now(),
            closed: false,
        }
    }

    pub fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    pub fn interest(&self) -> EventMask {
        self.interest
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// A connection with no pending demand (tracked by the personality layer)
    /// and an empty write buffer is torn down (§3 invariant); the personality
    /// calls this once it knows it has nothing further to read or write.
    pub fn clear_interest(&mut self) {
        self.interest = 0;
    }

    pub fn add_read_interest(&mut self) {
        self.interest |= backend::READ;
    }

    pub fn flush(&mut self) {
        if !self.write_buffer[self.write_cursor..].is_empty() {
            self.interest |= backend::WRITE;
        }
    }

    /// Reads up to `read_size` bytes in a loop until `WouldBlock`, appending
    /// verbatim to the read buffer. Returns `true` if the peer closed
    /// (zero-byte read) or a fatal error occurred.
    pub fn recv_ready(&mut self) -> io::Result<bool> {
        let mut chunk = vec![0u8; self.read_size];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    self.read_buffer.extend(&chunk[..n]);
                    self.touch();
                    if n < chunk.len() {
                        // short read: almost certainly drained the socket for now
                        return Ok(false);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Attempts to drain the write buffer starting at the cursor. Compacts
    /// the buffer once the cursor has advanced past [`COMPACT_THRESHOLD`].
    pub fn send_ready(&mut self) -> SendOutcome {
        loop {
            if self.write_cursor >= self.write_buffer.len() {
                self.write_buffer.clear();
                self.write_cursor = 0;
                self.interest &= !backend::WRITE;
                return SendOutcome::Drained;
            }

            match self.stream.write(&self.write_buffer[self.write_cursor..]) {
                Ok(0) => return SendOutcome::Partial,
                Ok(n) => {
                    self.write_cursor += n;
                    self.touch();
                    if self.write_cursor >= COMPACT_THRESHOLD {
                        self.write_buffer.drain(..self.write_cursor);
                        self.write_cursor = 0;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return SendOutcome::Partial,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return SendOutcome::Closed,
            }
        }
    }

    /// §4.2 `read_until`: scans buffered bytes for `delimiter`. `max_bytes ==
    /// 0` means unbounded. Never enlarges the logical read buffer beyond
    /// `max_bytes + delimiter.len() - 1` bytes before reporting the overflow
    /// (§8 backpressure invariant) — the caller is expected to have already
    /// appended via `recv_ready`, so this only classifies what's buffered.
    pub fn try_read_until(&mut self, delimiter: &[u8], max_bytes: usize) -> ReadUntilOutcome {
        if let Some(pos) = find_subsequence(&self.read_buffer, delimiter) {
            if max_bytes > 0 && pos > max_bytes {
                self.clear_interest();
                return ReadUntilOutcome::MaxBytesExceeded;
            }
            let total = pos + delimiter.len();
            let data: Vec<u8> = self.read_buffer.drain(..total).collect();
            self.interest &= !backend::READ;
            return ReadUntilOutcome::Found(data);
        }

        if max_bytes > 0 && self.read_buffer.len() >= max_bytes {
            self.clear_interest();
            return ReadUntilOutcome::MaxBytesExceeded;
        }

        self.add_read_interest();
        ReadUntilOutcome::Pending
    }

    /// §4.2 `read_exact`: consumes exactly `length` bytes once available.
    pub fn try_read_exact(&mut self, length: usize) -> Option<Vec<u8>> {
        if self.read_buffer.len() >= length {
            let data: Vec<u8> = self.read_buffer.drain(..length).collect();
            return Some(data);
        }
        self.add_read_interest();
        None
    }

    /// Bytes left over in the read buffer after the current demand is
    /// satisfied (used by FastCGI's "no demand ⇒ stay buffered" behavior
    /// between records, and to detect HTTP pipelining).
    pub fn buffered_len(&self) -> usize {
        self.read_buffer.len()
    }

    pub fn peek_buffer(&self) -> &VecDeque<u8> {
        &self.read_buffer
    }

    /// Append-only from producers (§3); the reactor is the sole consumer via
    /// `send_ready`.
    pub fn write(&mut self, bytes: &[u8]) {
        self.write_buffer.extend_from_slice(bytes);
        self.flush();
    }

    pub fn clear_write_buffer(&mut self) {
        self.write_buffer.clear();
        self.write_cursor = 0;
        self.interest &= !backend::WRITE;
    }

    pub fn write_buffer_is_empty(&self) -> bool {
        self.write_cursor >= self.write_buffer.len()
    }
}

fn find_subsequence(buf: &VecDeque<u8>, needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || buf.len() < needle.len() {
        return None;
    }
    'outer: for start in 0..=buf.len() - needle.len() {
        for (i, b) in needle.iter().enumerate() {
            if buf[start + i] != *b {
                continue 'outer;
            }
        }
        return Some(start);
    }
    None
}
