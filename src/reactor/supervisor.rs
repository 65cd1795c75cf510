//! Per-process event loop (§4.3): the same loop body runs in the parent
//! (supervising workers, or serving directly if `worker_count == 0`) and in
//! every forked worker, distinguished only by `is_parent` and the listening
//! policy. Grounded directly in `elements/async/server.py`'s `Server.start`/
//! `spawn_worker`/`handle_signal`/`shutdown`.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::path::PathBuf;
use std::process::Child;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream, UnixStream};
use mio::unix::SourceFd;
use mio::Token;

use crate::config::{Config, ServerConfig};
use crate::error::{Error, Result};
use crate::fastcgi::{FastCgiConnection, FastCgiSettings, FcgiHandler, FcgiOutput, Progress as FcgiProgress};
use crate::http::connection::CgiDispatchInfo;
use crate::http::{cgi, HttpConnection, Progress as HttpProgress};
use crate::http::session::SessionStore;
use crate::io::backend::{self, Backend};
use crate::reactor::signals::{self, SignalCode};

/// A CGI process exceeding this runs the risk of holding a worker hostage
/// forever; killed and answered with 504 (§4.6.5).
const CGI_TIMEOUT: Duration = Duration::from_secs(30);

enum HostKind {
    Http { server_index: usize },
    FastCgi,
}

struct HostEntry {
    listener: TcpListener,
    kind: HostKind,
}

enum ConnEntry {
    Http(HttpConnection),
    FastCgi(FastCgiConnection<TcpStream>),
    Channel(Connection),
}

use crate::io::connection::Connection as GenericConnection;
type Connection = GenericConnection<UnixStream>;

/// Bridges a spawned CGI child's stdout pipe back to the HTTP connection
/// that requested it (§4.6.5). Registered as its own `mio` source since a
/// `std::process::ChildStdout` does not implement `Read + Write` the way
/// `Connection<S>` requires.
struct CgiBridge {
    owner: Token,
    child: Child,
    stdout_fd: RawFd,
    buffer: Vec<u8>,
    started_at: Instant,
}

/// Serves static files for the FastCGI responder role, emitting the same
/// CGI-style `Status:`/header block the HTTP gateway parses (§4.7, §4.6.5).
struct StaticFastCgiHandler {
    root: PathBuf,
    default_file: String,
}

impl FcgiHandler for StaticFastCgiHandler {
    fn dispatch(&self, params: &HashMap<String, String>, _stdin: &[u8]) -> FcgiOutput {
        let script = params
            .get("SCRIPT_FILENAME")
            .cloned()
            .or_else(|| params.get("DOCUMENT_URI").cloned())
            .unwrap_or_default();

        let mut path = if script.is_empty() {
            self.root.clone()
        } else {
            let rel = script.trim_start_matches('/');
            self.root.join(rel)
        };
        if path.is_dir() {
            path = path.join(&self.default_file);
        }

        match std::fs::read(&path) {
            Ok(content) => {
                let ext = path.extension().and_then(|e| e.to_str());
                let content_type = crate::http::response::get_mime_type(ext);
                let mut stdout = format!(
                    "Status: 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n",
                    content.len()
                )
                .into_bytes();
                stdout.extend_from_slice(&content);
                FcgiOutput { stdout, stderr: Vec::new(), exit_status: Some(0) }
            }
            Err(e) => {
                let body = format!("not found: {}", path.display());
                let stdout = format!(
                    "Status: 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
                    body.len()
                )
                .into_bytes();
                FcgiOutput { stdout, stderr: e.to_string().into_bytes(), exit_status: Some(1) }
            }
        }
    }
}

/// One process's reactor: owns a readiness backend, the set of listeners and
/// active connections local to this process, and (in the parent) the worker
/// fleet and its IPC channels (§3 "Supervisor process state").
pub struct Reactor {
    config: Config,
    backend: Backend,
    next_token: usize,

    hosts: HashMap<Token, HostEntry>,
    connections: HashMap<Token, ConnEntry>,
    cgi_bridges: HashMap<Token, CgiBridge>,
    /// Which `config.servers[_]` entry an HTTP connection's listener
    /// resolved to (§9 Open Question: one `ServerConfig` per listener, no
    /// Host-header re-routing mid-connection).
    http_server_for_token: HashMap<Token, usize>,

    sessions: SessionStore,
    fastcgi_handler: StaticFastCgiHandler,
    fastcgi_settings: FastCgiSettings,

    channels_by_pid: HashMap<i32, Vec<Token>>,
    workers: Vec<i32>,

    is_parent: bool,
    is_listening: bool,
    is_shutting_down: bool,
    is_graceful_shutdown: bool,

    last_supervision: Instant,
    last_idle_sweep: Instant,
    last_loop_hook: Instant,
}

impl Reactor {
    pub fn new(config: Config) -> Result<Self> {
        let backend = Backend::new(config.event_manager(), 256)
            .map_err(|e| Error::Fatal(format!("cannot create event backend: {e}")))?;

        let fastcgi_settings = FastCgiSettings {
            allow_persistence: config.fastcgi.as_ref().map(|f| f.allow_persistence).unwrap_or(true),
            max_requests: config.fastcgi.as_ref().and_then(|f| f.max_requests),
            worker_count: config.worker_count.max(1),
        };
        let fastcgi_handler = StaticFastCgiHandler {
            root: config
                .fastcgi
                .as_ref()
                .map(|f| PathBuf::from(&f.root))
                .unwrap_or_else(|| PathBuf::from("./www")),
            default_file: config
                .fastcgi
                .as_ref()
                .map(|f| f.default_file.clone())
                .unwrap_or_else(|| "index.html".to_string()),
        };

        let session_ttl = config.timeout.unwrap_or(3600);

        Ok(Self {
            config,
            backend,
            next_token: 0,
            hosts: HashMap::new(),
            connections: HashMap::new(),
            cgi_bridges: HashMap::new(),
            http_server_for_token: HashMap::new(),
            sessions: SessionStore::new(session_ttl),
            fastcgi_handler,
            fastcgi_settings,
            channels_by_pid: HashMap::new(),
            workers: Vec::new(),
            is_parent: true,
            is_listening: false,
            is_shutting_down: false,
            is_graceful_shutdown: false,
            last_supervision: Instant::now() - Duration::from_secs(2),
            last_idle_sweep: Instant::now(),
            last_loop_hook: Instant::now(),
        })
    }

    fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Binds every configured HTTP server's (host, port) pairs plus the
    /// FastCGI listener, if configured. Called once, before any fork (§4.3:
    /// "Bind and listen on each configured (ip, port)").
    fn bind_hosts(&mut self) -> Result<()> {
        for (index, server) in self.config.servers.iter().enumerate() {
            for &port in &server.ports {
                let addr = format!("{}:{port}", server.host).parse()?;
                let listener = TcpListener::bind(addr)
                    .map_err(|e| Error::Fatal(format!("cannot bind {addr}: {e}")))?;
                let token = self.next_token();
                self.hosts.insert(token, HostEntry { listener, kind: HostKind::Http { server_index: index } });
            }
        }

        if let Some(fcgi) = self.config.fastcgi.clone() {
            let addr = format!("{}:{}", fcgi.host, fcgi.port).parse()?;
            let listener = TcpListener::bind(addr)
                .map_err(|e| Error::Fatal(format!("cannot bind fastcgi {addr}: {e}")))?;
            let token = self.next_token();
            self.hosts.insert(token, HostEntry { listener, kind: HostKind::FastCgi });
        }

        Ok(())
    }

    /// §4.3 "listen": register or unregister every host's listener.
    fn listen(&mut self, status: bool) -> Result<()> {
        if self.is_listening == status || self.hosts.is_empty() {
            return Ok(());
        }
        for (token, entry) in self.hosts.iter_mut() {
            if status {
                self.backend
                    .register(&mut entry.listener, *token, backend::READ)
                    .map_err(|e| Error::Fatal(format!("cannot register listener: {e}")))?;
            } else {
                self.backend.unregister(&mut entry.listener, *token);
            }
        }
        self.is_listening = status;
        Ok(())
    }

    /// Entry point: binds, spawns workers (forking once per configured
    /// worker), and runs the loop. Mirrors `Server.start` (§4.3).
    pub fn run(mut self) -> Result<()> {
        signals::install();
        self.bind_hosts()?;

        if self.config.event_manager().forces_single_process() && self.config.worker_count > 0 {
            tracing::warn!("kqueue backend selected: forcing worker_count to 0 (kernel state is not fork-inherited)");
            self.config.worker_count = 0;
        }

        tracing::info!(
            backend = %self.backend.kind(),
            workers = self.config.worker_count,
            daemonize = self.config.daemonize,
            "server starting"
        );

        let worker_count = self.config.worker_count;
        for _ in 0..worker_count {
            self.spawn_worker()?;
        }
        if worker_count == 0 {
            self.listen(true)?;
        }

        self.run_loop()
    }

    /// §4.3 fork/worker spawning: one socketpair per configured channel,
    /// then fork. The parent keeps its endpoints as channels; the child gets
    /// a fresh backend, registers its endpoints, and starts listening.
    fn spawn_worker(&mut self) -> Result<()> {
        if !self.is_parent {
            return Ok(());
        }

        let mut parent_ends = Vec::with_capacity(self.config.channel_count);
        let mut worker_ends = Vec::with_capacity(self.config.channel_count);
        for _ in 0..self.config.channel_count {
            let (a, b) = UnixStream::pair().map_err(Error::Io)?;
            parent_ends.push(a);
            worker_ends.push(b);
        }

        let pid = unsafe { libc::fork() };
        match pid {
            -1 => Err(Error::Fatal("fork() failed".to_string())),
            0 => {
                // Child: drop the parent-side endpoints, rebuild process state.
                drop(parent_ends);
                self.become_worker(worker_ends)?;
                self.run_loop()?;
                std::process::exit(0);
            }
            child_pid => {
                drop(worker_ends);
                self.workers.push(child_pid);
                let mut tokens = Vec::with_capacity(parent_ends.len());
                for mut stream in parent_ends {
                    let token = self.next_token();
                    self.backend
                        .register(&mut stream, token, backend::READ)
                        .map_err(|e| Error::Fatal(format!("cannot register channel: {e}")))?;
                    self.connections.insert(token, ConnEntry::Channel(Connection::new(stream, crate::io::Role::Channel)));
                    tokens.push(token);
                }
                self.channels_by_pid.insert(child_pid, tokens);
                Ok(())
            }
        }
    }

    /// Child-side re-initialization after fork (§4.3): fresh connection set,
    /// fresh backend, register the inherited worker-side channel endpoints.
    fn become_worker(&mut self, worker_ends: Vec<UnixStream>) -> Result<()> {
        self.is_parent = false;
        self.is_listening = false;
        self.connections.clear();
        self.cgi_bridges.clear();
        self.channels_by_pid.clear();
        self.http_server_for_token.clear();
        self.workers.clear();
        self.next_token = 0;

        self.backend = Backend::new(self.config.event_manager(), 256)
            .map_err(|e| Error::Fatal(format!("cannot recreate event backend in worker: {e}")))?;

        // Listener tokens must be re-registered fresh too: keep the same
        // `mio::net::TcpListener`s (inherited fds survive fork) but forget
        // their old tokens, which belonged to the parent's now-gone backend.
        let inherited: Vec<HostEntry> = self.hosts.drain().map(|(_, v)| v).collect();
        for entry in inherited {
            let token = self.next_token();
            self.hosts.insert(token, entry);
        }

        let mut tokens = Vec::with_capacity(worker_ends.len());
        for mut stream in worker_ends {
            let token = self.next_token();
            self.backend
                .register(&mut stream, token, backend::READ)
                .map_err(|e| Error::Fatal(format!("cannot register channel: {e}")))?;
            self.connections.insert(token, ConnEntry::Channel(Connection::new(stream, crate::io::Role::Channel)));
            tokens.push(token);
        }
        self.channels_by_pid.insert(std::process::id() as i32, tokens);

        self.listen(true)?;
        Ok(())
    }

    fn run_loop(&mut self) -> Result<()> {
        loop {
            if self.is_shutting_down && !self.is_graceful_shutdown {
                break;
            }
            if self.is_shutting_down && self.is_graceful_shutdown && self.only_hosts_and_channels_remain() {
                break;
            }

            let now = Instant::now();

            if now.duration_since(self.last_supervision) >= Duration::from_secs(1) {
                self.last_supervision = now;
                self.supervision_sweep()?;
            }

            if let Some(timeout) = self.config.timeout {
                if now.duration_since(self.last_idle_sweep).as_secs_f64() >= self.config.timeout_interval {
                    self.last_idle_sweep = now;
                    self.idle_sweep(Duration::from_secs_f64(timeout as f64));
                }
            }
            self.reap_cgi_timeouts();

            if now.duration_since(self.last_loop_hook).as_secs_f64() >= self.config.loop_interval {
                self.last_loop_hook = now;
                self.sessions.cleanup();
            }

            let events = self
                .backend
                .poll(Some(Duration::from_millis(500)))
                .map_err(Error::Io)?;

            for (token, mask) in events {
                self.handle_event(token, mask);
            }
        }

        self.shutdown();
        Ok(())
    }

    fn only_hosts_and_channels_remain(&self) -> bool {
        !self.connections.values().any(|c| matches!(c, ConnEntry::Http(_) | ConnEntry::FastCgi(_)))
    }

    /// §4.3 step 1 + §7: process pending signals, then reap exited workers.
    fn supervision_sweep(&mut self) -> Result<()> {
        for signal in signals::drain_pending() {
            self.handle_signal(signal);
        }

        if self.is_shutting_down && self.is_listening {
            self.listen(false)?;
        }

        if self.is_parent {
            loop {
                let mut status = 0;
                let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
                if pid <= 0 {
                    break;
                }
                self.handle_worker_exited(pid, status);
            }
        }

        Ok(())
    }

    fn handle_signal(&mut self, code: SignalCode) {
        if self.is_parent {
            self.restart();
            if matches!(code, SignalCode::Hup | SignalCode::Term) {
                return;
            }
        }

        if self.is_shutting_down {
            tracing::warn!("second shutdown signal received, forcing immediate shutdown");
            self.is_graceful_shutdown = false;
            return;
        }

        tracing::info!("shutdown signal received, draining connections gracefully");
        self.is_graceful_shutdown = true;
        self.is_shutting_down = true;
    }

    /// §7: "SIGTERM/SIGHUP forwards to workers". Also used for the parent's
    /// own SIGINT handling, which restarts (terminates, since no supervisor
    /// re-exec is modeled here) every worker before considering its own
    /// shutdown state.
    fn restart(&mut self) {
        for &pid in &self.workers {
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
    }

    fn handle_worker_exited(&mut self, pid: i32, status: i32) {
        tracing::info!(pid, status, "worker exited");
        self.workers.retain(|&p| p != pid);

        if let Some(tokens) = self.channels_by_pid.remove(&pid) {
            for token in tokens {
                if let Some(ConnEntry::Channel(mut conn)) = self.connections.remove(&token) {
                    self.backend.unregister(&mut conn.stream, token);
                }
            }
        }

        if !self.is_shutting_down {
            if let Err(e) = self.spawn_worker() {
                tracing::error!(error = %e, "failed to respawn worker");
            }
        }
    }

    /// §4.3 step 2: tear down connections idle past `timeout`.
    fn idle_sweep(&mut self, timeout: Duration) {
        let now = Instant::now();
        let stale: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, entry)| match entry {
                ConnEntry::Http(c) => now.duration_since(c.conn.last_access) > timeout,
                ConnEntry::FastCgi(c) => now.duration_since(c.conn.last_access) > timeout,
                ConnEntry::Channel(_) => false,
            })
            .map(|(token, _)| *token)
            .collect();

        for token in stale {
            tracing::debug!(?token, "connection idle timeout");
            self.teardown_connection(token);
        }
    }

    fn reap_cgi_timeouts(&mut self) {
        let now = Instant::now();
        let timed_out: Vec<Token> = self
            .cgi_bridges
            .iter()
            .filter(|(_, b)| now.duration_since(b.started_at) > CGI_TIMEOUT)
            .map(|(t, _)| *t)
            .collect();

        for cgi_token in timed_out {
            if let Some(mut bridge) = self.cgi_bridges.remove(&cgi_token) {
                tracing::warn!(owner = ?bridge.owner, "cgi process exceeded timeout, killing");
                let _ = bridge.child.kill();
                let _ = bridge.child.wait();
                self.backend.unregister(&mut SourceFd(&bridge.stdout_fd), cgi_token);
                self.finish_cgi(bridge.owner, b"Status: 504 Gateway Timeout\r\nContent-Type: text/plain\r\nContent-Length: 11\r\n\r\ncgi timeout".to_vec());
            }
        }
    }

    fn handle_event(&mut self, token: Token, mask: backend::EventMask) {
        if self.hosts.contains_key(&token) {
            self.handle_host_event(token);
            return;
        }
        if self.cgi_bridges.contains_key(&token) {
            self.handle_cgi_event(token);
            return;
        }
        if mask & backend::ERROR != 0 {
            self.teardown_connection(token);
            return;
        }
        self.handle_connection_event(token, mask);
    }

    fn handle_host_event(&mut self, token: Token) {
        let kind_is_fastcgi = matches!(self.hosts.get(&token).map(|h| &h.kind), Some(HostKind::FastCgi));
        let server_index = match self.hosts.get(&token).map(|h| &h.kind) {
            Some(HostKind::Http { server_index }) => Some(*server_index),
            _ => None,
        };

        loop {
            let accepted = match self.hosts.get_mut(&token) {
                Some(entry) => entry.listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, peer)) => {
                    tracing::info!(%peer, "accepted connection");
                    if kind_is_fastcgi {
                        self.register_fastcgi(stream);
                    } else if let Some(idx) = server_index {
                        self.register_http(stream, idx);
                    }
                    if self.config.long_running {
                        // Serialize: this worker stops accepting until the
                        // connection it just took finishes (§4.3, §4.4).
                        self.listen(false).ok();
                        return;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn register_http(&mut self, stream: TcpStream, server_index: usize) {
        let mut conn = HttpConnection::new(stream);
        let token = self.next_token();
        if let Err(e) = self.backend.register(&mut conn.conn.stream, token, backend::READ) {
            tracing::warn!(error = %e, "failed to register http connection");
            return;
        }
        conn.max_requests = None;
        self.connections.insert(token, ConnEntry::Http(conn));
        self.http_server_for_token.insert(token, server_index);
    }

    fn register_fastcgi(&mut self, stream: TcpStream) {
        let mut conn = FastCgiConnection::new(stream, self.fastcgi_settings);
        let token = self.next_token();
        if let Err(e) = self.backend.register(&mut conn.conn.stream, token, backend::READ) {
            tracing::warn!(error = %e, "failed to register fastcgi connection");
            return;
        }
        self.connections.insert(token, ConnEntry::FastCgi(conn));
    }

    fn handle_connection_event(&mut self, token: Token, mask: backend::EventMask) {
        if mask & backend::WRITE != 0 {
            if let Some(entry) = self.connections.get_mut(&token) {
                let outcome = match entry {
                    ConnEntry::Http(c) => c.conn.send_ready(),
                    ConnEntry::FastCgi(c) => c.conn.send_ready(),
                    ConnEntry::Channel(c) => c.send_ready(),
                };
                if matches!(outcome, crate::io::connection::SendOutcome::Closed) {
                    self.teardown_connection(token);
                    return;
                }
            }
        }

        if mask & backend::READ != 0 {
            let closed = match self.connections.get_mut(&token) {
                Some(ConnEntry::Http(c)) => c.conn.recv_ready().unwrap_or(true),
                Some(ConnEntry::FastCgi(c)) => c.conn.recv_ready().unwrap_or(true),
                Some(ConnEntry::Channel(c)) => {
                    let closed = c.recv_ready().unwrap_or(true);
                    // Channels have no application protocol defined yet;
                    // drain and discard (§4.5 default `on_channel_message`).
                    let pending = c.buffered_len();
                    let _ = c.try_read_exact(pending);
                    closed
                }
                None => return,
            };
            if closed {
                self.teardown_connection(token);
                return;
            }
            self.drive_connection(token);
        }

        self.sync_interest(token);
    }

    fn drive_connection(&mut self, token: Token) {
        match self.connections.get(&token) {
            Some(ConnEntry::Http(_)) => self.drive_http(token),
            Some(ConnEntry::FastCgi(_)) => self.drive_fastcgi(token),
            _ => {}
        }
    }

    fn drive_http(&mut self, token: Token) {
        let server_index = *self.http_server_for_token.get(&token).unwrap_or(&0);
        let Some(server) = self.config.servers.get(server_index).cloned() else {
            self.teardown_connection(token);
            return;
        };

        loop {
            let Some(ConnEntry::Http(conn)) = self.connections.get_mut(&token) else { return };
            let progress = conn.advance(&server, &mut self.sessions, "0.0.0.0", 0);
            match progress {
                HttpProgress::Pending => return,
                HttpProgress::Responded => continue,
                HttpProgress::Close => {
                    self.teardown_connection(token);
                    return;
                }
                HttpProgress::DispatchCgi { route, request } => {
                    self.spawn_cgi(token, &server, route, request);
                    return;
                }
            }
        }
    }

    fn drive_fastcgi(&mut self, token: Token) {
        loop {
            let Some(ConnEntry::FastCgi(conn)) = self.connections.get_mut(&token) else { return };
            let handler = &self.fastcgi_handler;
            match conn.advance(handler) {
                FcgiProgress::Pending => return,
                FcgiProgress::Responded => continue,
                FcgiProgress::Close => {
                    self.teardown_connection(token);
                    return;
                }
            }
        }
    }

    fn spawn_cgi(
        &mut self,
        owner: Token,
        server: &ServerConfig,
        route: crate::config::RouteConfig,
        request: CgiDispatchInfo,
    ) {
        let env = cgi::build_cgi_env(
            &request.method,
            &request.script_path,
            &request.path,
            &request.query,
            "0.0.0.0",
            0,
            &request.headers,
            Some(request.content_length),
        );
        let mut command = cgi::build_command(&request.program, &request.script_path, &env);
        match command.spawn() {
            Ok(mut child) => {
                if let Some(mut stdin) = child.stdin.take() {
                    let _ = stdin.write_all(&request.body);
                }
                let stdout = child.stdout.take().expect("piped stdout");
                let stdout_fd = stdout.as_raw_fd();
                unsafe {
                    libc::fcntl(stdout_fd, libc::F_SETFL, libc::O_NONBLOCK);
                }
                std::mem::forget(stdout); // fd ownership now lives in `child`/the bridge
                let token = self.next_token();
                if let Err(e) = self.backend.register(&mut SourceFd(&stdout_fd), token, backend::READ) {
                    tracing::warn!(error = %e, "failed to register cgi stdout");
                    return;
                }
                self.cgi_bridges.insert(
                    token,
                    CgiBridge { owner, child, stdout_fd, buffer: Vec::new(), started_at: Instant::now() },
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, program = %request.program, "failed to spawn cgi process");
                if let Some(ConnEntry::Http(conn)) = self.connections.get_mut(&owner) {
                    let response = crate::http::response::handle_error(
                        crate::http::protocol::HTTP_INTERNAL_SERVER_ERROR,
                        Some(&server.error_pages),
                        &route.root,
                    );
                    let bytes = response.to_bytes(false, server.gmt_offset);
                    conn.conn.write(&bytes);
                    let _ = conn.conn.send_ready();
                }
                self.teardown_connection(owner);
            }
        }
    }

    fn handle_cgi_event(&mut self, token: Token) {
        let Some(bridge) = self.cgi_bridges.get_mut(&token) else { return };
        let mut chunk = [0u8; 8192];
        loop {
            let mut file = unsafe { std::fs::File::from_raw_fd(bridge.stdout_fd) };
            let result = file.read(&mut chunk);
            std::mem::forget(file); // still owned by `bridge.child`'s pipe
            match result {
                Ok(0) => {
                    let bridge = self.cgi_bridges.remove(&token).unwrap();
                    self.backend.unregister(&mut SourceFd(&bridge.stdout_fd), token);
                    let mut bridge = bridge;
                    let _ = bridge.child.wait();
                    self.finish_cgi(bridge.owner, bridge.buffer);
                    return;
                }
                Ok(n) => bridge.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => {
                    let bridge = self.cgi_bridges.remove(&token).unwrap();
                    self.backend.unregister(&mut SourceFd(&bridge.stdout_fd), token);
                    return;
                }
            }
        }
    }

    fn finish_cgi(&mut self, owner: Token, raw_output: Vec<u8>) {
        let server_index = *self.http_server_for_token.get(&owner).unwrap_or(&0);
        let Some(server) = self.config.servers.get(server_index).cloned() else { return };
        if let Some(ConnEntry::Http(conn)) = self.connections.get_mut(&owner) {
            let progress = conn.respond_with_cgi_output(&raw_output, &server);
            if matches!(progress, HttpProgress::Close) {
                self.teardown_connection(owner);
                return;
            }
        }
        self.sync_interest(owner);
    }

    /// After a handler returns, re-registers the connection's new interest
    /// mask with the backend, or tears it down if the mask fell to 0 (§4.2,
    /// §4.3 step 4's "if interest changed" branch).
    fn sync_interest(&mut self, token: Token) {
        let (mask, is_closed) = match self.connections.get(&token) {
            Some(ConnEntry::Http(c)) => (c.conn.interest(), c.conn.is_closed()),
            Some(ConnEntry::FastCgi(c)) => (c.conn.interest(), c.conn.is_closed()),
            Some(ConnEntry::Channel(c)) => (c.interest(), c.is_closed()),
            None => return,
        };

        if mask == 0 || is_closed {
            self.teardown_connection(token);
            return;
        }

        let result = match self.connections.get_mut(&token) {
            Some(ConnEntry::Http(c)) => self.backend.modify(&mut c.conn.stream, token, mask),
            Some(ConnEntry::FastCgi(c)) => self.backend.modify(&mut c.conn.stream, token, mask),
            Some(ConnEntry::Channel(c)) => self.backend.modify(&mut c.stream, token, mask),
            None => return,
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to update interest mask");
        }
    }

    fn teardown_connection(&mut self, token: Token) {
        if let Some(entry) = self.connections.remove(&token) {
            match entry {
                ConnEntry::Http(mut c) => {
                    self.backend.unregister(&mut c.conn.stream, token);
                    self.http_server_for_token.remove(&token);
                    if self.config.long_running {
                        let _ = self.listen(true);
                    }
                }
                ConnEntry::FastCgi(mut c) => self.backend.unregister(&mut c.conn.stream, token),
                ConnEntry::Channel(mut c) => self.backend.unregister(&mut c.stream, token),
            }
        }
    }

    /// §4.3 termination: unregister everything, signal workers to stop, wait
    /// for them.
    fn shutdown(&mut self) {
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.teardown_connection(token);
        }
        for (token, entry) in self.hosts.iter_mut() {
            self.backend.unregister(&mut entry.listener, *token);
        }

        if !self.is_parent {
            return;
        }

        for &pid in &self.workers {
            unsafe {
                libc::kill(pid, libc::SIGINT);
            }
        }
        for &pid in &self.workers {
            let mut status = 0;
            unsafe {
                libc::waitpid(pid, &mut status, 0);
            }
        }
    }
}
