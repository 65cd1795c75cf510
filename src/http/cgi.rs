//! CGI gateway (§4.6.5, §11 — supplemented from `elements/async/impl/http.py`'s
//! `handle_cgi`-equivalent, mirrored by the teacher's own `cgi.rs`). Builds
//! the CGI-1.1 environment, spawns the interpreter, and parses its stdout
//! into an [`HttpResponse`]. This is an HTTP-only extension, distinct from
//! the FastCGI responder in `crate::fastcgi`.

use std::collections::HashMap;
use std::path::Path;
use std::process::{Command, Stdio};

use crate::http::protocol::Method;
use crate::http::request::ParsedHeaders;
use crate::http::response::HttpResponse;

/// Picks the interpreter for a route with no explicit `cgi_path`.
pub fn default_interpreter(ext: &str) -> &'static str {
    match ext.trim_start_matches('.') {
        "py" => "python3",
        "sh" => "bash",
        _ => "python3",
    }
}

/// §4.6.5: one `HTTP_<NAME>` env var per request header plus the fixed
/// CGI-1.1 variables.
pub fn build_cgi_env(
    method: &Method,
    script_path: &Path,
    path_info: &str,
    query: &str,
    remote_addr: &str,
    remote_port: u16,
    parsed_headers: &ParsedHeaders,
    content_length: Option<usize>,
) -> HashMap<String, String> {
    let mut env = parsed_headers.env.clone();

    env.insert("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string());
    env.insert("SERVER_PROTOCOL".to_string(), "HTTP/1.1".to_string());
    env.insert("REQUEST_METHOD".to_string(), method.to_string());
    env.insert("SCRIPT_NAME".to_string(), script_path.to_string_lossy().into_owned());
    env.insert("PATH_INFO".to_string(), path_info.to_string());
    env.insert("QUERY_STRING".to_string(), query.to_string());
    env.insert("REMOTE_ADDR".to_string(), remote_addr.to_string());
    env.insert("REMOTE_PORT".to_string(), remote_port.to_string());
    env.insert("SERVER_SOFTWARE".to_string(), "Elements".to_string());

    if let Some(ct) = parsed_headers.headers.get("content-type") {
        env.insert("CONTENT_TYPE".to_string(), ct.clone());
    }
    if let Some(len) = content_length {
        env.insert("CONTENT_LENGTH".to_string(), len.to_string());
    }

    env
}

/// Builds (but does not spawn) the child process description for `program`
/// invoked against `script_path` with `env`.
pub fn build_command(program: &str, script_path: &Path, env: &HashMap<String, String>) -> Command {
    let mut cmd = Command::new(program);
    cmd.arg(script_path);
    cmd.envs(env);
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());
    cmd
}

/// §4.6.5: parses a `Status:`/header block terminated by a blank line out of
/// a CGI script's stdout, translating it into an [`HttpResponse`]. The
/// remainder of `raw_output` becomes the body.
pub fn parse_cgi_output(raw_output: &[u8]) -> HttpResponse {
    let separator = b"\r\n\r\n";
    let header_end = find_subsequence(raw_output, separator).unwrap_or(raw_output.len());
    let body_start = (header_end + separator.len()).min(raw_output.len());

    let header_section = String::from_utf8_lossy(&raw_output[..header_end]);
    let body = raw_output[body_start..].to_vec();

    let mut status_code = 200u16;
    let mut headers = Vec::new();

    for line in header_section.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().to_string();
            if key == "status" {
                status_code =
                    value.split_whitespace().next().and_then(|s| s.parse().ok()).unwrap_or(200);
            } else {
                headers.push((key, value));
            }
        }
    }

    let mut response = HttpResponse::new(status_code);
    let has_content_type = headers.iter().any(|(k, _)| k == "content-type");
    for (k, v) in headers {
        response.set_header(&k, v);
    }
    if !has_content_type {
        response.set_header("content-type", "text/html");
    }
    response.set_header("content-length", body.len().to_string());
    response.body = body;
    response
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
