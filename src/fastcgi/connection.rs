//! Per-connection FastCGI state machine (§4.7.2, §4.7.5): drives a
//! [`crate::io::Connection`] through header → body → dispatch, the same
//! `try_read_exact`-probing shape as `http::connection::HttpConnection`.

use std::collections::HashMap;

use crate::fastcgi::record::{self, RecordHeader};
use crate::io::connection::Role;
use crate::io::Connection;

#[derive(Debug)]
enum Phase {
    AwaitHeader,
    AwaitBody(RecordHeader),
}

/// Settings the supervisor hands every FastCGI connection (§4.7.2,
/// `allow_persistence(status, max_requests)` in the original).
#[derive(Debug, Clone, Copy)]
pub struct FastCgiSettings {
    pub allow_persistence: bool,
    pub max_requests: Option<u32>,
    pub worker_count: usize,
}

/// Result of dispatching a fully-aggregated request to the application.
pub struct FcgiOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` maps to exit status 0, matching the source's `None ↦ 0` rule.
    pub exit_status: Option<i32>,
}

/// The connector between the FastCGI personality and the external handler
/// (§2 component H's FastCGI-side counterpart to the HTTP `Action` contract).
pub trait FcgiHandler {
    fn dispatch(&self, params: &HashMap<String, String>, stdin: &[u8]) -> FcgiOutput;
}

pub enum Progress {
    /// Waiting on more bytes.
    Pending,
    /// A management or request record was answered; the connection stays open.
    Responded,
    /// `END_REQUEST` was written and persistence was not granted; the
    /// connection should drain its write buffer and close (§4.7.5).
    Close,
}

/// One accepted FastCGI connection.
pub struct FastCgiConnection<S> {
    pub conn: Connection<S>,
    phase: Phase,
    settings: FastCgiSettings,

    request_id: u16,
    flags: u8,
    handled_requests: u32,
    persistence_requested: bool,

    params_buf: Vec<u8>,
    has_params: bool,
    stdin_buf: Vec<u8>,
    has_stdin: bool,
}

impl<S: std::io::Read + std::io::Write> FastCgiConnection<S> {
    pub fn new(stream: S, settings: FastCgiSettings) -> Self {
        Self {
            conn: Connection::new(stream, Role::Regular),
            phase: Phase::AwaitHeader,
            settings,
            request_id: record::NULL_REQUEST_ID,
            flags: 0,
            handled_requests: 0,
            persistence_requested: true,
            params_buf: Vec::new(),
            has_params: false,
            stdin_buf: Vec::new(),
            has_stdin: false,
        }
    }

    /// Drives the state machine as far as currently-buffered bytes allow,
    /// invoking `handler` once a request's PARAMS and STDIN are both complete.
    pub fn advance(&mut self, handler: &dyn FcgiHandler) -> Progress {
        loop {
            match &self.phase {
                Phase::AwaitHeader => match self.conn.try_read_exact(record::HEADER_LEN) {
                    Some(raw) => match record::decode_header(&raw) {
                        Ok(header) => self.phase = Phase::AwaitBody(header),
                        Err(_) => {
                            self.conn.clear_interest();
                            return Progress::Close;
                        }
                    },
                    None => return Progress::Pending,
                },
                Phase::AwaitBody(header) => {
                    let header = *header;
                    let total = header.content_length as usize + header.padding_length as usize;
                    match self.conn.try_read_exact(total) {
                        Some(raw) => {
                            let body = &raw[..header.content_length as usize];
                            match self.handle_record(&header, body, handler) {
                                Progress::Pending => unreachable!("a full record always answers or re-arms"),
                                other => {
                                    self.phase = Phase::AwaitHeader;
                                    if matches!(other, Progress::Close) {
                                        return other;
                                    }
                                    // Responded: loop again in case more bytes
                                    // are already buffered (pipelined records).
                                    if self.conn.buffered_len() == 0 {
                                        return other;
                                    }
                                }
                            }
                        }
                        None => return Progress::Pending,
                    }
                }
            }
        }
    }

    fn handle_record(
        &mut self,
        header: &RecordHeader,
        body: &[u8],
        handler: &dyn FcgiHandler,
    ) -> Progress {
        if header.request_id == record::NULL_REQUEST_ID {
            return self.handle_management(header, body);
        }

        match header.record_type {
            record::TYPE_BEGIN_REQUEST => self.handle_begin_request(header.request_id, body),
            record::TYPE_ABORT_REQUEST => Progress::Responded,
            record::TYPE_PARAMS => {
                if header.request_id != self.request_id {
                    return Progress::Responded;
                }
                if body.is_empty() {
                    self.has_params = true;
                } else {
                    self.params_buf.extend_from_slice(body);
                }
                self.maybe_dispatch(handler)
            }
            record::TYPE_STDIN => {
                // §9 Open Question, decided: STDIN before an accepted
                // BEGIN_REQUEST (request_id still NULL) is ignored.
                if header.request_id != self.request_id || self.request_id == record::NULL_REQUEST_ID
                {
                    return Progress::Responded;
                }
                if body.is_empty() {
                    self.has_stdin = true;
                } else {
                    self.stdin_buf.extend_from_slice(body);
                }
                self.maybe_dispatch(handler)
            }
            record::TYPE_DATA => Progress::Responded,
            _ => Progress::Responded,
        }
    }

    fn handle_management(&mut self, header: &RecordHeader, body: &[u8]) -> Progress {
        match header.record_type {
            record::TYPE_GET_VALUES => {
                let requested = record::decode_nv_pairs(body).unwrap_or_default();
                let mut results = Vec::new();
                for key in requested.keys() {
                    match key.as_str() {
                        "FCGI_MAX_CONNS" | "FCGI_MAX_REQS" => {
                            results.push((key.as_str(), self.settings.worker_count.to_string()))
                        }
                        "FCGI_MPXS_CONNS" => results.push((
                            key.as_str(),
                            if self.settings.allow_persistence { "1" } else { "0" }.to_string(),
                        )),
                        _ => {}
                    }
                }
                self.conn.write(&record::encode_get_values_result(&results));
                self.conn.flush();
            }
            _ => {
                self.conn.write(&record::encode_unknown_type(header.record_type));
                self.conn.flush();
            }
        }
        Progress::Responded
    }

    /// §4.7.5 post-response policy, shared by every `END_REQUEST`-writing
    /// branch (not just the `maybe_dispatch` completion path): keep the
    /// connection open only if persistence is allowed and the peer asked
    /// for it, else drop READ interest so it drains and closes.
    fn close_or_continue(&mut self) -> Progress {
        if self.settings.allow_persistence && self.persistence_requested {
            Progress::Responded
        } else {
            self.conn.clear_interest();
            Progress::Close
        }
    }

    fn handle_begin_request(&mut self, request_id: u16, body: &[u8]) -> Progress {
        if self.request_id != record::NULL_REQUEST_ID {
            self.conn.write(&record::encode_end_request(
                request_id,
                0,
                record::STATUS_CANT_MPX_CONN,
            ));
            self.conn.flush();
            return self.close_or_continue();
        }

        let Some((role, flags)) = record::decode_begin_request(body) else {
            self.conn.clear_interest();
            return Progress::Close;
        };

        let at_cap = self
            .settings
            .max_requests
            .map(|max| self.handled_requests >= max)
            .unwrap_or(false);

        if flags & record::FLAG_KEEP_CONN == 0 || at_cap {
            self.persistence_requested = false;
        }

        if at_cap {
            self.conn.write(&record::encode_end_request(
                request_id,
                0,
                record::STATUS_OVERLOADED,
            ));
            self.conn.flush();
            return self.close_or_continue();
        }

        if role != record::ROLE_RESPONDER {
            self.conn.write(&record::encode_end_request(
                request_id,
                0,
                record::STATUS_UNKNOWN_ROLE,
            ));
            self.conn.flush();
            return self.close_or_continue();
        }

        self.request_id = request_id;
        self.flags = flags;
        self.has_params = false;
        self.has_stdin = false;
        self.params_buf.clear();
        self.stdin_buf.clear();
        self.handled_requests += 1;
        Progress::Responded
    }

    fn maybe_dispatch(&mut self, handler: &dyn FcgiHandler) -> Progress {
        if !(self.has_params && self.has_stdin) {
            return Progress::Responded;
        }

        let params = record::decode_nv_pairs(&self.params_buf).unwrap_or_default();
        let output = handler.dispatch(&params, &self.stdin_buf);

        if !output.stdout.is_empty() {
            self.conn.write(&record::frame_stream(
                record::TYPE_STDOUT,
                self.request_id,
                &output.stdout,
            ));
        }
        if !output.stderr.is_empty() {
            self.conn.write(&record::frame_stream(
                record::TYPE_STDERR,
                self.request_id,
                &output.stderr,
            ));
        }

        self.conn.write(&record::encode_end_request(
            self.request_id,
            output.exit_status.unwrap_or(0),
            record::STATUS_REQUEST_COMPLETE,
        ));
        self.conn.flush();

        self.request_id = record::NULL_REQUEST_ID;
        self.has_params = false;
        self.has_stdin = false;
        self.params_buf.clear();
        self.stdin_buf.clear();

        self.close_or_continue()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct Loopback {
        inbound: Cursor<Vec<u8>>,
        outbound: Vec<u8>,
    }

    impl std::io::Read for Loopback {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.inbound.read(buf)
        }
    }

    impl std::io::Write for Loopback {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.outbound.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct Echo;
    impl FcgiHandler for Echo {
        fn dispatch(&self, params: &HashMap<String, String>, stdin: &[u8]) -> FcgiOutput {
            let mut stdout = format!("params={}\n", params.len()).into_bytes();
            stdout.extend_from_slice(stdin);
            FcgiOutput { stdout, stderr: Vec::new(), exit_status: None }
        }
    }

    fn settings(allow_persistence: bool, max_requests: Option<u32>) -> FastCgiSettings {
        FastCgiSettings { allow_persistence, max_requests, worker_count: 2 }
    }

    fn conn_with(data: &[u8], settings: FastCgiSettings) -> FastCgiConnection<Loopback> {
        let mut c = FastCgiConnection::new(
            Loopback { inbound: Cursor::new(data.to_vec()), outbound: Vec::new() },
            settings,
        );
        c.conn.recv_ready().unwrap();
        c
    }

    fn begin_request(request_id: u16, flags: u8) -> Vec<u8> {
        let mut body = vec![0u8, record::ROLE_RESPONDER as u8, flags];
        body.extend_from_slice(&[0u8; 5]);
        let mut out = record::encode_header(record::TYPE_BEGIN_REQUEST, request_id, body.len() as u16).to_vec();
        out.extend_from_slice(&body);
        out
    }

    fn params_record(request_id: u16, body: &[u8]) -> Vec<u8> {
        let mut out = record::encode_header(record::TYPE_PARAMS, request_id, body.len() as u16).to_vec();
        out.extend_from_slice(body);
        out
    }

    fn stdin_record(request_id: u16, body: &[u8]) -> Vec<u8> {
        let mut out = record::encode_header(record::TYPE_STDIN, request_id, body.len() as u16).to_vec();
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn full_responder_cycle_with_keep_conn() {
        let mut raw = begin_request(7, record::FLAG_KEEP_CONN);
        raw.extend(params_record(7, &record::encode_nv_pairs(&[("A", "1".to_string())])));
        raw.extend(params_record(7, &[])); // params done
        raw.extend(stdin_record(7, b"x=1"));
        raw.extend(stdin_record(7, &[])); // stdin done

        let mut conn = conn_with(&raw, settings(true, None));
        let echo = Echo;

        loop {
            match conn.advance(&echo) {
                Progress::Pending => break,
                Progress::Close => panic!("expected connection to stay open with KEEP_CONN"),
                Progress::Responded => continue,
            }
        }

        let out = &conn.conn.stream.outbound;
        // stdout record then end_request record must both be present.
        assert!(out.windows(b"params=1".len()).any(|w| w == b"params=1"));
        let end_request_pos = find_type(out, record::TYPE_END_REQUEST).expect("END_REQUEST present");
        assert_eq!(out[end_request_pos + record::HEADER_LEN + 4], record::STATUS_REQUEST_COMPLETE);
    }

    #[test]
    fn without_keep_conn_closes_after_end_request() {
        let mut raw = begin_request(1, 0);
        raw.extend(params_record(1, &[]));
        raw.extend(stdin_record(1, &[]));

        let mut conn = conn_with(&raw, settings(true, None));
        let echo = Echo;
        let mut saw_close = false;
        loop {
            match conn.advance(&echo) {
                Progress::Pending => break,
                Progress::Close => {
                    saw_close = true;
                    break;
                }
                Progress::Responded => continue,
            }
        }
        assert!(saw_close);
    }

    #[test]
    fn concurrent_begin_request_is_rejected() {
        let mut raw = begin_request(1, record::FLAG_KEEP_CONN);
        raw.extend(begin_request(2, record::FLAG_KEEP_CONN));

        let mut conn = conn_with(&raw, settings(true, None));
        let echo = Echo;
        conn.advance(&echo); // consumes first BEGIN_REQUEST
        conn.advance(&echo); // consumes second BEGIN_REQUEST -> CANT_MPX_CONN

        let out = &conn.conn.stream.outbound;
        let pos = find_type(out, record::TYPE_END_REQUEST).expect("END_REQUEST present");
        assert_eq!(out[pos + record::HEADER_LEN + 4], record::STATUS_CANT_MPX_CONN);
    }

    #[test]
    fn overloaded_when_request_cap_reached_closes_the_connection() {
        let mut raw = begin_request(1, record::FLAG_KEEP_CONN);
        raw.extend(params_record(1, &[]));
        raw.extend(stdin_record(1, &[]));
        raw.extend(begin_request(2, record::FLAG_KEEP_CONN));

        let mut conn = conn_with(&raw, settings(true, Some(1)));
        let echo = Echo;
        let mut saw_close = false;
        loop {
            match conn.advance(&echo) {
                Progress::Pending => break,
                Progress::Close => {
                    saw_close = true;
                    break;
                }
                Progress::Responded => continue,
            }
        }
        assert!(saw_close, "connection must close once max_requests is reached, like the HTTP keep-alive cap");

        let out = &conn.conn.stream.outbound;
        let positions: Vec<_> = (0..out.len())
            .filter(|&i| out.get(i + 1) == Some(&record::TYPE_END_REQUEST))
            .collect();
        assert!(positions.len() >= 2, "expected two END_REQUEST records");
    }

    #[test]
    fn get_values_reports_mpxs_conns() {
        let requested = record::encode_nv_pairs(&[("FCGI_MPXS_CONNS", String::new())]);
        let mut out = record::encode_header(record::TYPE_GET_VALUES, record::NULL_REQUEST_ID, requested.len() as u16).to_vec();
        out.extend_from_slice(&requested);

        let mut conn = conn_with(&out, settings(true, None));
        let echo = Echo;
        conn.advance(&echo);

        let reply = &conn.conn.stream.outbound;
        let header = record::decode_header(&reply[..record::HEADER_LEN]).unwrap();
        assert_eq!(header.record_type, record::TYPE_GET_VALUES_RESULT);
        let body = &reply[record::HEADER_LEN..record::HEADER_LEN + header.content_length as usize];
        let pairs = record::decode_nv_pairs(body).unwrap();
        assert_eq!(pairs.get("FCGI_MPXS_CONNS").unwrap(), "1");
    }

    fn find_type(bytes: &[u8], record_type: u8) -> Option<usize> {
        let mut pos = 0;
        while pos + record::HEADER_LEN <= bytes.len() {
            let header = record::decode_header(&bytes[pos..pos + record::HEADER_LEN]).ok()?;
            if header.record_type == record_type {
                return Some(pos);
            }
            pos += record::HEADER_LEN + header.content_length as usize + header.padding_length as usize;
        }
        None
    }
}
