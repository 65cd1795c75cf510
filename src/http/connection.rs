//! Per-connection HTTP state machine (§4.6.1-§4.6.4): drives a
//! [`crate::io::Connection`] through request-line → headers → body → dispatch
//! → response, re-issuing `try_read_until`/`try_read_exact` probes exactly as
//! the design notes describe (§9 "Continuation callbacks").

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

use crate::config::{RouteConfig, ServerConfig};
use crate::http::cgi;
use crate::http::protocol::{self, Method};
use crate::http::request::{self, ParseError, ParsedHeaders};
use crate::http::response::{get_mime_type, handle_error, HttpResponse};
use crate::http::router::{self, RoutingError};
use crate::http::session::SessionStore;
use crate::http::upload::{MultipartUpload, SavedPart};
use crate::io::connection::{ReadUntilOutcome, Role};
use crate::io::Connection;

const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

#[derive(Debug)]
enum ParsingState {
    RequestLine,
    Headers,
    UrlEncodedBody { remaining: usize, buffer: Vec<u8> },
    MultipartBody { remaining: usize },
    ChunkedBody,
    Done,
}

#[derive(Debug, Clone)]
struct PendingRequest {
    method: Method,
    path: String,
    query: String,
    protocol: String,
    parsed_headers: ParsedHeaders,
    content_length: usize,
}

/// The CGI child process itself is owned by the reactor (it alone can
/// register the pipe fd with the event backend) and tracked against this
/// connection's token; `action` only needs to record that dispatch happened.
pub enum ActiveAction {
    None,
    /// A static file is being streamed in `FILE_READ_SIZE` blocks.
    FileDownload { file: File, remaining: u64 },
    AwaitingCgi,
}

/// One accepted HTTP connection.
pub struct HttpConnection {
    pub conn: Connection<mio::net::TcpStream>,
    state: ParsingState,
    pending: Option<PendingRequest>,
    upload: Option<MultipartUpload>,
    boundary: String,
    pub action: ActiveAction,
    pub persistent: bool,
    pub requests_served: u32,
    pub max_requests: Option<u32>,
}

pub enum Progress {
    /// Waiting on more bytes; nothing further to do this turn.
    Pending,
    /// A full response is ready in `conn`'s write buffer; persistence has
    /// already been decided.
    Responded,
    /// A route resolved to a CGI script; the reactor must spawn it.
    DispatchCgi { route: RouteConfig, request: CgiDispatchInfo },
    /// The connection should be torn down.
    Close,
}

#[derive(Clone)]
pub struct CgiDispatchInfo {
    pub method: Method,
    pub path: String,
    pub query: String,
    pub headers: ParsedHeaders,
    pub content_length: usize,
    pub script_path: PathBuf,
    pub program: String,
    pub body: Vec<u8>,
}

impl HttpConnection {
    pub fn new(stream: mio::net::TcpStream) -> Self {
        Self {
            conn: Connection::new(stream, Role::Regular),
            state: ParsingState::RequestLine,
            pending: None,
            upload: None,
            boundary: String::new(),
            action: ActiveAction::None,
            persistent: true,
            requests_served: 0,
            max_requests: None,
        }
    }

    fn reset_for_next_request(&mut self) {
        self.state = ParsingState::RequestLine;
        self.pending = None;
        self.upload = None;
        self.boundary.clear();
        self.action = ActiveAction::None;
    }

    /// Drives the state machine as far as currently-buffered bytes allow.
    pub fn advance(
        &mut self,
        server: &ServerConfig,
        sessions: &mut SessionStore,
        remote_addr: &str,
        remote_port: u16,
    ) -> Progress {
        loop {
            match &self.state {
                ParsingState::RequestLine => {
                    match self.conn.try_read_until(CRLF, server.max_request_length) {
                        ReadUntilOutcome::Found(line) => {
                            let line = strip_crlf(&line);
                            match request::parse_request_line(&line) {
                                Ok((method, path, query, protocol)) => {
                                    self.pending = Some(PendingRequest {
                                        method,
                                        path,
                                        query,
                                        protocol,
                                        parsed_headers: ParsedHeaders::default(),
                                        content_length: 0,
                                    });
                                    self.state = ParsingState::Headers;
                                }
                                Err(e) => return self.fail(e, server),
                            }
                        }
                        ReadUntilOutcome::MaxBytesExceeded => {
                            return self.fail(ParseError::RequestLineTooLong, server)
                        }
                        ReadUntilOutcome::Pending => return Progress::Pending,
                    }
                }
                ParsingState::Headers => {
                    match self.conn.try_read_until(HEADER_END, server.max_headers_length) {
                        ReadUntilOutcome::Found(block) => {
                            let text = String::from_utf8_lossy(&block);
                            let text = text.trim_end_matches("\r\n\r\n");
                            match request::parse_headers(text) {
                                Ok(parsed) => {
                                    let content_length_present = parsed.headers.contains_key("content-length");
                                    let pending = self.pending.as_mut().unwrap();
                                    pending.content_length = parsed
                                        .headers
                                        .get("content-length")
                                        .and_then(|v| v.parse().ok())
                                        .unwrap_or(0);
                                    self.persistent =
                                        request::decide_persistence(&pending.protocol, &parsed.headers);
                                    pending.parsed_headers = parsed;
                                    match self.enter_body_state(server, content_length_present) {
                                        Ok(()) => {}
                                        Err(resp) => return self.respond(resp, server),
                                    }
                                }
                                Err(e) => return self.fail(e, server),
                            }
                        }
                        ReadUntilOutcome::MaxBytesExceeded => {
                            return self.fail(ParseError::HeaderTooLong, server)
                        }
                        ReadUntilOutcome::Pending => return Progress::Pending,
                    }
                }
                ParsingState::UrlEncodedBody { remaining, .. } => {
                    let remaining = *remaining;
                    match self.conn.try_read_exact(remaining) {
                        Some(body) => match self.take_buffer_state() {
                            ParsingState::UrlEncodedBody { buffer, .. } => {
                                let mut full = buffer;
                                full.extend_from_slice(&body);
                                return self.dispatch(full, server, sessions, remote_addr, remote_port);
                            }
                            _ => unreachable!(),
                        },
                        None => return Progress::Pending,
                    }
                }
                ParsingState::MultipartBody { remaining } => {
                    let to_read = (*remaining).min(self.conn.buffered_len().max(1));
                    if self.conn.buffered_len() == 0 {
                        return Progress::Pending;
                    }
                    match self.conn.try_read_exact(to_read) {
                        Some(chunk) => {
                            let remaining_after = remaining.saturating_sub(chunk.len());
                            if let Some(upload) = &mut self.upload {
                                upload.feed(&chunk);
                            }
                            self.state = ParsingState::MultipartBody { remaining: remaining_after };
                            if remaining_after == 0 {
                                return self.finish_upload(server, sessions, remote_addr, remote_port);
                            }
                        }
                        None => return Progress::Pending,
                    }
                }
                ParsingState::ChunkedBody => {
                    // Chunked request bodies are aggregated the same way as
                    // a fixed-length body once fully drained; simplified to
                    // a bounded accumulation against `max_request_length`.
                    match self.conn.try_read_until(b"0\r\n\r\n", server.max_request_length) {
                        ReadUntilOutcome::Found(raw) => {
                            let body = dechunk(&raw);
                            return self.dispatch(body, server, sessions, remote_addr, remote_port);
                        }
                        ReadUntilOutcome::MaxBytesExceeded => {
                            return self.fail(ParseError::PayloadTooLarge, server)
                        }
                        ReadUntilOutcome::Pending => return Progress::Pending,
                    }
                }
                ParsingState::Done => {
                    return self.dispatch(Vec::new(), server, sessions, remote_addr, remote_port)
                }
            }
        }
    }

    fn take_buffer_state(&mut self) -> ParsingState {
        std::mem::replace(&mut self.state, ParsingState::Done)
    }

    /// §4.6.1 `on_headers` content negotiation. `content_length_present`
    /// distinguishes "`Content-Length` header absent" from "present and
    /// zero" — only the former is a 411 for a urlencoded body.
    fn enter_body_state(
        &mut self,
        server: &ServerConfig,
        content_length_present: bool,
    ) -> Result<(), HttpResponse> {
        let pending = self.pending.as_ref().unwrap();
        let is_chunked = pending
            .parsed_headers
            .headers
            .get("transfer-encoding")
            .map(|v| v.contains("chunked"))
            .unwrap_or(false);
        let content_type =
            pending.parsed_headers.headers.get("content-type").cloned().unwrap_or_default();

        if !is_chunked && pending.content_length > server.client_max_body_size {
            return Err(handle_error(
                protocol::HTTP_PAYLOAD_TOO_LARGE,
                Some(&server.error_pages),
                &route_root(server, &pending.path),
            ));
        }

        if is_chunked {
            self.state = ParsingState::ChunkedBody;
        } else if content_type.starts_with("multipart/form-data") {
            self.boundary = content_type
                .split("boundary=")
                .nth(1)
                .map(|b| b.trim_matches('"').to_string())
                .unwrap_or_default();
            if self.boundary.is_empty() {
                return Err(handle_error(
                    protocol::HTTP_BAD_REQUEST,
                    Some(&server.error_pages),
                    &route_root(server, &pending.path),
                ));
            }
            let upload_dir = PathBuf::from(&server.upload_dir);
            let _ = std::fs::create_dir_all(&upload_dir);
            self.upload = Some(MultipartUpload::new(
                &self.boundary,
                upload_dir,
                server.max_upload_size as u64,
            ));
            self.state = ParsingState::MultipartBody { remaining: pending.content_length };
        } else if content_type.starts_with("application/x-www-form-urlencoded")
            && !content_length_present
        {
            return Err(handle_error(
                protocol::HTTP_LENGTH_REQUIRED,
                Some(&server.error_pages),
                &route_root(server, &pending.path),
            ));
        } else if pending.content_length > 0 {
            self.state =
                ParsingState::UrlEncodedBody { remaining: pending.content_length, buffer: Vec::new() };
        } else {
            // text/plain, unset, or any other content type with no body:
            // dispatch immediately with an empty body (§4.6.1).
            self.state = ParsingState::Done;
        }

        Ok(())
    }

    fn dispatch(
        &mut self,
        body: Vec<u8>,
        server: &ServerConfig,
        sessions: &mut SessionStore,
        remote_addr: &str,
        remote_port: u16,
    ) -> Progress {
        let pending = self.pending.take().unwrap();
        let root = route_root(server, &pending.path);

        let route = match router::find_route(&server.routes, &pending.path, &pending.method) {
            Ok(r) => r.clone(),
            Err(RoutingError::NotFound) => {
                return self.respond(
                    handle_error(protocol::HTTP_NOT_FOUND, Some(&server.error_pages), &root),
                    server,
                )
            }
            Err(RoutingError::MethodNotAllowed) => {
                return self.respond(
                    handle_error(protocol::HTTP_METHOD_NOT_ALLOWED, Some(&server.error_pages), &root),
                    server,
                )
            }
        };

        if let Some(redirect_to) = &route.redirection {
            let code = route.redirect_code.unwrap_or(protocol::HTTP_FOUND);
            return self.respond(HttpResponse::redirect(code, redirect_to), server);
        }

        if let Some(ext) = &route.cgi_ext {
            if pending.path.ends_with(ext.as_str()) {
                let program = route
                    .cgi_path
                    .clone()
                    .unwrap_or_else(|| cgi::default_interpreter(ext).to_string());
                let script_path = PathBuf::from(&route.root).join(pending.path.trim_start_matches('/'));
                self.action = ActiveAction::AwaitingCgi;
                return Progress::DispatchCgi {
                    route: route.clone(),
                    request: CgiDispatchInfo {
                        method: pending.method,
                        path: pending.path.clone(),
                        query: pending.query.clone(),
                        headers: pending.parsed_headers.clone(),
                        content_length: pending.content_length,
                        script_path,
                        program,
                        body,
                    },
                };
            }
        }

        let response = match pending.method {
            Method::Get | Method::Head => self.handle_get(&pending, &route, server),
            Method::Post => self.handle_post(&pending, &route, server, &body),
            Method::Delete => self.handle_delete(&pending, &route, server),
            _ => handle_error(protocol::HTTP_METHOD_NOT_ALLOWED, Some(&server.error_pages), &root),
        };

        let mut response = response;
        if server.session_autostart {
            let cookie_name = &server.session_cookie;
            let _ = sessions.ensure_session(
                cookie_name,
                &pending.parsed_headers.cookies,
                &mut response,
            );
        }
        let _ = (remote_addr, remote_port);

        self.respond(response, server)
    }

    fn finish_upload(
        &mut self,
        server: &ServerConfig,
        sessions: &mut SessionStore,
        remote_addr: &str,
        remote_port: u16,
    ) -> Progress {
        let (parts, fields) =
            self.upload.take().map(|u| (u.parts, u.fields)).unwrap_or_default();
        self.dispatch_upload_result(parts, fields, server, sessions, remote_addr, remote_port)
    }

    fn dispatch_upload_result(
        &mut self,
        parts: Vec<SavedPart>,
        fields: HashMap<String, Vec<String>>,
        server: &ServerConfig,
        sessions: &mut SessionStore,
        remote_addr: &str,
        remote_port: u16,
    ) -> Progress {
        let mut pending = self.pending.take().unwrap();
        let root = route_root(server, &pending.path);

        // §4.6.2: non-file fields merge into the parameter map like a
        // urlencoded body, instead of being dropped once their bytes drain.
        let field_pairs: Vec<(String, String)> = fields
            .into_iter()
            .flat_map(|(k, vs)| vs.into_iter().map(move |v| (k.clone(), v)))
            .collect();
        pending.parsed_headers.form = request::ParamMap::from_pairs(field_pairs);

        let mut response = if parts.is_empty() && pending.parsed_headers.form.is_empty() {
            handle_error(protocol::HTTP_BAD_REQUEST, Some(&server.error_pages), &root)
        } else if parts.iter().any(|p| p.error.is_some()) {
            let failed: Vec<_> = parts
                .iter()
                .filter(|p| p.error.is_some())
                .map(|p| p.filename.clone().unwrap_or_default())
                .collect();
            let mut res = HttpResponse::new(413);
            res.set_body(format!("upload rejected: {}", failed.join(", ")).into_bytes(), "text/plain");
            res
        } else {
            let mut res = HttpResponse::new(201);
            let names: Vec<_> = parts.iter().filter_map(|p| p.filename.clone()).collect();
            if names.len() == 1 {
                res.set_header("location", format!("/{}/{}", server.upload_dir, names[0]));
            }
            let mut body_text = format!("saved: {}", names.join(", "));
            if !pending.parsed_headers.form.is_empty() {
                let fields_text: Vec<String> = pending
                    .parsed_headers
                    .form
                    .to_pairs()
                    .into_iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect();
                body_text.push_str(&format!("; fields: {}", fields_text.join(", ")));
            }
            res.set_body(body_text.into_bytes(), "text/plain");
            res
        };

        if server.session_autostart {
            let _ = sessions.ensure_session(
                &server.session_cookie,
                &pending.parsed_headers.cookies,
                &mut response,
            );
        }
        let _ = (remote_addr, remote_port);

        self.respond(response, server)
    }

    fn handle_get(&mut self, req: &PendingRequest, route: &RouteConfig, server: &ServerConfig) -> HttpResponse {
        let rel = req.path.trim_start_matches(&route.path as &str).trim_start_matches('/');
        let mut full_path = PathBuf::from(&route.root).join(rel);
        if full_path.is_dir() {
            let index = full_path.join(&route.default_file);
            if index.is_file() {
                full_path = index;
            } else if route.autoindex {
                return crate::http::response::generate_autoindex(&full_path, &req.path);
            } else {
                return handle_error(
                    protocol::HTTP_NOT_FOUND,
                    Some(&server.error_pages),
                    &route_root(server, &req.path),
                );
            }
        }

        match std::fs::read(&full_path) {
            Ok(content) => {
                let ext = full_path.extension().and_then(|e| e.to_str());
                let mut res = HttpResponse::new(protocol::HTTP_OK);
                res.set_body(content, get_mime_type(ext));
                res
            }
            Err(_) => handle_error(
                protocol::HTTP_NOT_FOUND,
                Some(&server.error_pages),
                &route_root(server, &req.path),
            ),
        }
    }

    fn handle_post(
        &mut self,
        req: &PendingRequest,
        route: &RouteConfig,
        server: &ServerConfig,
        body: &[u8],
    ) -> HttpResponse {
        if route.upload_dir.is_empty() {
            return handle_error(
                protocol::HTTP_METHOD_NOT_ALLOWED,
                Some(&server.error_pages),
                &route_root(server, &req.path),
            );
        }
        let dir = PathBuf::from(&route.root).join(&route.upload_dir);
        let _ = std::fs::create_dir_all(&dir);
        let filename = format!(
            "uploaded_{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0)
        );
        let _ = std::fs::write(dir.join(&filename), body);
        let mut res = HttpResponse::new(201);
        res.set_header("location", format!("/{}/{}", route.upload_dir, filename));
        res.set_body(format!("File saved as {filename}").into_bytes(), "text/plain");
        res
    }

    fn handle_delete(&mut self, req: &PendingRequest, route: &RouteConfig, server: &ServerConfig) -> HttpResponse {
        let rel = req.path.trim_start_matches(&route.path as &str).trim_start_matches('/');
        let full_path = PathBuf::from(&route.root).join(rel);
        match std::fs::remove_file(&full_path) {
            Ok(()) => {
                let mut res = HttpResponse::new(204);
                res.set_header("content-length", "0");
                res
            }
            Err(_) => handle_error(
                protocol::HTTP_NOT_FOUND,
                Some(&server.error_pages),
                &route_root(server, &req.path),
            ),
        }
    }

    fn fail(&mut self, err: ParseError, server: &ServerConfig) -> Progress {
        let code = err.status_code();
        self.persistent = false;
        let response = handle_error(code, Some(&server.error_pages), &server.routes.first().map(|r| r.root.clone()).unwrap_or_default());
        self.respond(response, server)
    }

    fn respond(&mut self, response: HttpResponse, server: &ServerConfig) -> Progress {
        let bytes = response.to_bytes(self.persistent, server.gmt_offset);
        self.conn.write(&bytes);
        self.requests_served += 1;
        if let Some(max) = self.max_requests {
            if self.requests_served >= max {
                self.persistent = false;
            }
        }
        self.reset_for_next_request();
        if !self.persistent {
            Progress::Close
        } else {
            Progress::Responded
        }
    }

    /// Completes a CGI dispatch once the reactor has collected the script's
    /// full stdout (§4.6.5).
    pub fn respond_with_cgi_output(&mut self, raw_output: &[u8], server: &ServerConfig) -> Progress {
        let response = cgi::parse_cgi_output(raw_output);
        self.respond(response, server)
    }
}

fn route_root(server: &ServerConfig, path: &str) -> String {
    router::find_route(&server.routes, path, &Method::Get)
        .map(|r| r.root.clone())
        .unwrap_or_default()
}

fn strip_crlf(data: &[u8]) -> String {
    let end = data.len().saturating_sub(2);
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// Minimal dechunker used once a full chunked body (terminated by
/// `0\r\n\r\n`) has been buffered; strips the `<hex>\r\n...\r\n` envelopes.
fn dechunk(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < raw.len() {
        let Some(line_end) = find(&raw[pos..], CRLF) else { break };
        let size_str = String::from_utf8_lossy(&raw[pos..pos + line_end]);
        let Ok(size) = usize::from_str_radix(size_str.trim(), 16) else { break };
        pos += line_end + 2;
        if size == 0 {
            break;
        }
        if pos + size > raw.len() {
            break;
        }
        out.extend_from_slice(&raw[pos..pos + size]);
        pos += size + 2; // skip trailing CRLF after chunk data
    }
    out
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
