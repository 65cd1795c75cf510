//! Request-line/header parsing helpers (§4.6.1) — pure functions over
//! already-delimited byte slices. The stateful drive loop that issues
//! `read_until`/`read_exact` demands against a [`crate::io::Connection`]
//! lives in `http::connection`; this module only turns delimited bytes into
//! typed data, so it can be unit tested without a socket.

use std::collections::HashMap;
use std::fmt;

use crate::http::protocol::{decode_urlencoded, Method};

#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    MalformedRequestLine,
    InvalidMethod,
    UnsupportedProtocol,
    InvalidHeaderLine,
    HeaderTooLong,
    RequestLineTooLong,
    LengthRequired,
    InvalidChunkSize,
    PayloadTooLarge,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ParseError::MalformedRequestLine => "malformed request line",
            ParseError::InvalidMethod => "unsupported method",
            ParseError::UnsupportedProtocol => "unsupported protocol version",
            ParseError::InvalidHeaderLine => "malformed header line",
            ParseError::HeaderTooLong => "header block too long",
            ParseError::RequestLineTooLong => "request line too long",
            ParseError::LengthRequired => "missing content-length",
            ParseError::InvalidChunkSize => "invalid chunk size",
            ParseError::PayloadTooLarge => "payload too large",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for ParseError {}

impl ParseError {
    /// The status code this parse failure is answered with (§7).
    pub fn status_code(&self) -> u16 {
        use crate::http::protocol::*;
        match self {
            ParseError::InvalidMethod => HTTP_METHOD_NOT_ALLOWED,
            ParseError::UnsupportedProtocol => HTTP_VERSION_NOT_SUPPORTED,
            ParseError::HeaderTooLong | ParseError::RequestLineTooLong => HTTP_URI_TOO_LONG,
            ParseError::LengthRequired => HTTP_LENGTH_REQUIRED,
            ParseError::PayloadTooLarge => HTTP_PAYLOAD_TOO_LARGE,
            _ => HTTP_BAD_REQUEST,
        }
    }
}

/// §4.6.1: `on_request_line`. `line` excludes the trailing CRLF.
pub fn parse_request_line(line: &str) -> Result<(Method, String, String, String), ParseError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let (method_str, uri, protocol) = match parts.as_slice() {
        [m, u] => (*m, *u, "HTTP/1.0"),
        [m, u, p] => (*m, *u, *p),
        _ => return Err(ParseError::MalformedRequestLine),
    };

    let method = method_str.parse::<Method>().map_err(|_| ParseError::InvalidMethod)?;

    if protocol != "HTTP/1.0" && protocol != "HTTP/1.1" {
        return Err(ParseError::UnsupportedProtocol);
    }

    let (path, query) = match uri.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (uri.to_string(), String::new()),
    };

    Ok((method, path, query, protocol.to_string()))
}

/// One parsed header block (§4.6.1 `on_headers`): a lowercase map for
/// general use, and a CGI-style `HTTP_<NAME>` environment map for the CGI
/// gateway (§4.6.5).
#[derive(Debug, Default, Clone)]
pub struct ParsedHeaders {
    pub headers: HashMap<String, String>,
    pub env: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    /// Body parameters merged in after dispatch: urlencoded pairs or, for a
    /// multipart request, the non-file field values (§4.6.2).
    pub form: ParamMap,
}

/// `block` is the header section with the trailing blank line already
/// stripped (one `K: V` pair per line, CRLF-separated).
pub fn parse_headers(block: &str) -> Result<ParsedHeaders, ParseError> {
    let mut parsed = ParsedHeaders::default();

    for line in block.split("\r\n") {
        if line.is_empty() {
            continue;
        }
        let (key, value) = line.split_once(':').ok_or(ParseError::InvalidHeaderLine)?;
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() {
            return Err(ParseError::InvalidHeaderLine);
        }

        let env_key = format!("HTTP_{}", key.to_ascii_uppercase().replace('-', "_"));
        parsed.env.insert(env_key, value.to_string());

        if key.eq_ignore_ascii_case("cookie") {
            for pair in value.split(';') {
                if let Some((k, v)) = pair.trim().split_once('=') {
                    parsed.cookies.insert(k.trim().to_string(), v.trim().to_string());
                }
            }
        }

        parsed.headers.insert(key.to_ascii_lowercase(), value.to_string());
    }

    Ok(parsed)
}

/// §4.6.1 persistence decision: `HTTP/1.1` keeps alive unless `Connection:
/// close`; `HTTP/1.0` requires an explicit `Connection: keep-alive`.
pub fn decide_persistence(protocol: &str, headers: &HashMap<String, String>) -> bool {
    let connection = headers.get("connection").map(|v| v.to_ascii_lowercase());
    match protocol {
        "HTTP/1.1" => connection.as_deref() != Some("close"),
        _ => connection.as_deref() == Some("keep-alive"),
    }
}

/// Query/body parameter map merging duplicates into a list, mirroring the
/// source's single-element-list-collapses-to-scalar convention.
#[derive(Debug, Clone, Default)]
pub struct ParamMap(HashMap<String, Vec<String>>);

impl ParamMap {
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for (k, v) in pairs {
            map.entry(k).or_default().push(v);
        }
        ParamMap(map)
    }

    pub fn merge(&mut self, other: Vec<(String, String)>) {
        for (k, v) in other {
            self.0.entry(k).or_default().push(v);
        }
    }

    /// Collapses a single-element list to a scalar; multi-valued keys stay a
    /// list (first value returned here, full list via `all`).
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.first()).map(|s| s.as_str())
    }

    pub fn all(&self, key: &str) -> &[String] {
        self.0.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Flattened, sorted `(key, value)` view — one entry per value, keys
    /// with several values repeated — for display or re-encoding.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .0
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.clone(), v.clone())))
            .collect();
        out.sort();
        out
    }
}

pub fn parse_query_string(query: &str) -> ParamMap {
    ParamMap::from_pairs(decode_urlencoded(query))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line_defaults_protocol_to_1_0() {
        let (method, path, query, protocol) = parse_request_line("GET /a?b=1").unwrap();
        assert_eq!(method, Method::Get);
        assert_eq!(path, "/a");
        assert_eq!(query, "b=1");
        assert_eq!(protocol, "HTTP/1.0");
    }

    #[test]
    fn request_line_rejects_unknown_method() {
        assert_eq!(parse_request_line("FETCH / HTTP/1.1"), Err(ParseError::InvalidMethod));
    }

    #[test]
    fn request_line_rejects_unsupported_protocol() {
        assert_eq!(
            parse_request_line("GET / HTTP/2.0"),
            Err(ParseError::UnsupportedProtocol)
        );
    }

    #[test]
    fn headers_build_env_and_cookie_map() {
        let parsed = parse_headers("Host: x\r\nCookie: a=1; b=2\r\nX-My-Header: v").unwrap();
        assert_eq!(parsed.headers.get("host").unwrap(), "x");
        assert_eq!(parsed.env.get("HTTP_X_MY_HEADER").unwrap(), "v");
        assert_eq!(parsed.cookies.get("a").unwrap(), "1");
        assert_eq!(parsed.cookies.get("b").unwrap(), "2");
    }

    #[test]
    fn persistence_http11_default_keepalive() {
        let headers = HashMap::new();
        assert!(decide_persistence("HTTP/1.1", &headers));
    }

    #[test]
    fn persistence_http10_requires_explicit_keepalive() {
        let mut headers = HashMap::new();
        assert!(!decide_persistence("HTTP/1.0", &headers));
        headers.insert("connection".to_string(), "keep-alive".to_string());
        assert!(decide_persistence("HTTP/1.0", &headers));
    }

    #[test]
    fn urlencoded_body_merges_duplicate_keys() {
        let params = parse_query_string("a=1&b=2&a=3");
        assert_eq!(params.all("a"), ["1".to_string(), "3".to_string()]);
        assert_eq!(params.get("b"), Some("2"));
    }
}
