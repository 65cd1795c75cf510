//! Uniform event vocabulary over the readiness mechanism `mio` selects for the
//! target platform (epoll on Linux, kqueue on the BSDs/macOS, poll otherwise).
//!
//! `mio` itself picks the OS mechanism at compile time and does not expose a way
//! to force a different one at runtime; [`BackendKind`] models the four
//! mechanisms the spec enumerates so configuration and logging can name the one
//! in effect, and so the supervisor can apply the kqueue/`worker_count` rule in
//! §4.1 without depending on the standard library's own heavier `select`
//! fallback.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};

/// Subset of {READ, WRITE, ERROR, LINGER}. LINGER means "peer has hung up but
/// bytes may remain" and is only meaningful on backends that can surface a
/// half-close distinct from full closure (epoll/poll); kqueue and the
/// historical `select` fallback fold it into READ/ERROR.
pub type EventMask = u8;

pub const READ: EventMask = 0b0001;
pub const WRITE: EventMask = 0b0010;
pub const ERROR: EventMask = 0b0100;
pub const LINGER: EventMask = 0b1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Epoll,
    Kqueue,
    Poll,
    Select,
    Auto,
}

impl BackendKind {
    /// The mechanism `mio`'s `os-poll` feature actually compiles in for this
    /// target. `Select` is never resolved to automatically; it remains a
    /// last-resort, config-only fallback bounded by `FD_SETSIZE` (§9).
    pub fn resolved() -> BackendKind {
        if cfg!(target_os = "linux") || cfg!(target_os = "android") {
            BackendKind::Epoll
        } else if cfg!(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        )) {
            BackendKind::Kqueue
        } else {
            BackendKind::Poll
        }
    }

    /// A backend selected from configuration resolves `Auto` to the
    /// platform's native mechanism; anything else is taken at face value so
    /// misconfiguration (e.g. asking for `kqueue` on Linux) surfaces as a
    /// mismatch the caller can log rather than silently overriding the
    /// operator's choice.
    pub fn resolve(self) -> BackendKind {
        match self {
            BackendKind::Auto => BackendKind::resolved(),
            other => other,
        }
    }

    /// §4.1: kqueue's kernel-side event state is not inherited across
    /// `fork()` on the platforms this crate forks on, so a kqueue backend
    /// forces the supervisor to run single-process.
    pub fn forces_single_process(self) -> bool {
        matches!(self, BackendKind::Kqueue)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Epoll => "epoll",
            BackendKind::Kqueue => "kqueue",
            BackendKind::Poll => "poll",
            BackendKind::Select => "select",
            BackendKind::Auto => "auto",
        };
        f.write_str(name)
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "epoll" => Ok(BackendKind::Epoll),
            "kqueue" => Ok(BackendKind::Kqueue),
            "poll" => Ok(BackendKind::Poll),
            "select" => Ok(BackendKind::Select),
            "auto" => Ok(BackendKind::Auto),
            other => Err(format!("unknown event_manager backend '{other}'")),
        }
    }
}

fn to_interest(mask: EventMask) -> Interest {
    match (mask & READ != 0, mask & WRITE != 0) {
        (true, true) => Interest::READABLE.add(Interest::WRITABLE),
        (true, false) => Interest::READABLE,
        (false, true) => Interest::WRITABLE,
        (false, false) => Interest::READABLE,
    }
}

/// Wraps a single `mio::Poll` instance — one per process (§5: each worker and
/// the parent own a process-local backend; nothing here is shared).
pub struct Backend {
    kind: BackendKind,
    poll: Poll,
    events: Events,
    registered: HashMap<Token, EventMask>,
}

impl Backend {
    pub fn new(kind: BackendKind, capacity: usize) -> io::Result<Self> {
        Ok(Self {
            kind: kind.resolve(),
            poll: Poll::new()?,
            events: Events::with_capacity(capacity.max(64)),
            registered: HashMap::new(),
        })
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn register<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        mask: EventMask,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, to_interest(mask))?;
        self.registered.insert(token, mask);
        Ok(())
    }

    /// Idempotent from the caller's perspective: re-asserts whatever mask the
    /// connection's interest has changed to, regardless of what was
    /// registered before.
    pub fn modify<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        mask: EventMask,
    ) -> io::Result<()> {
        match self.poll.registry().reregister(source, token, to_interest(mask)) {
            Ok(()) => {
                self.registered.insert(token, mask);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Some backends (e.g. epoll on a socket already closed by the peer)
    /// auto-remove on close; an error here is absorbed rather than
    /// propagated, per §4.1.
    pub fn unregister<S: Source + ?Sized>(&mut self, source: &mut S, token: Token) {
        let _ = self.poll.registry().deregister(source);
        self.registered.remove(&token);
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.registered.contains_key(&token)
    }

    /// Returns all descriptors observed ready within `timeout`. An empty
    /// return is normal (§4.1).
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(Token, EventMask)>> {
        self.poll.poll(&mut self.events, timeout)?;
        let mut out = Vec::new();
        for event in self.events.iter() {
            let mut mask = 0;
            if event.is_readable() || event.is_read_closed() {
                mask |= READ;
            }
            if event.is_writable() {
                mask |= WRITE;
            }
            if event.is_error() {
                mask |= ERROR;
            }
            if event.is_read_closed() || event.is_write_closed() {
                mask |= LINGER;
            }
            out.push((event.token(), mask));
        }
        Ok(out)
    }
}
