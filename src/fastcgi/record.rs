//! FastCGI wire codec (§4.7.1, §4.7.3, §6 layout table): pure functions over
//! already-delimited byte slices, mirroring `crate::http::request`'s split
//! between parsing and the connection state machine that drives it.

use std::collections::HashMap;
use std::fmt;

pub const HEADER_LEN: usize = 8;
pub const FCGI_VERSION_1: u8 = 1;

pub const TYPE_BEGIN_REQUEST: u8 = 1;
pub const TYPE_ABORT_REQUEST: u8 = 2;
pub const TYPE_END_REQUEST: u8 = 3;
pub const TYPE_PARAMS: u8 = 4;
pub const TYPE_STDIN: u8 = 5;
pub const TYPE_STDOUT: u8 = 6;
pub const TYPE_STDERR: u8 = 7;
pub const TYPE_DATA: u8 = 8;
pub const TYPE_GET_VALUES: u8 = 9;
pub const TYPE_GET_VALUES_RESULT: u8 = 10;
pub const TYPE_UNKNOWN_TYPE: u8 = 11;

pub const NULL_REQUEST_ID: u16 = 0;

pub const ROLE_RESPONDER: u16 = 1;
pub const ROLE_AUTHORIZER: u16 = 2;
pub const ROLE_FILTER: u16 = 3;

pub const FLAG_KEEP_CONN: u8 = 1;

pub const STATUS_REQUEST_COMPLETE: u8 = 0;
pub const STATUS_CANT_MPX_CONN: u8 = 1;
pub const STATUS_OVERLOADED: u8 = 2;
pub const STATUS_UNKNOWN_ROLE: u8 = 3;

/// A stream record (STDOUT/STDERR) is split into frames of at most this many
/// bytes (§4.7.4) since `content_length` is a 16-bit field.
pub const MAX_STREAM_CHUNK: usize = 65_535;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("unsupported FastCGI version {0}")]
    UnsupportedVersion(u8),
    #[error("truncated record header")]
    TruncatedHeader,
    #[error("truncated name-value pair")]
    TruncatedNameValuePair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u8,
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl fmt::Display for RecordHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type={} request_id={} content_length={}",
            self.record_type, self.request_id, self.content_length
        )
    }
}

/// §6 FastCGI record layout: `version(1) type(1) request_id(2) content_length(2)
/// padding_length(1) reserved(1)`, all multi-byte fields big-endian.
pub fn encode_header(record_type: u8, request_id: u16, content_length: u16) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0] = FCGI_VERSION_1;
    out[1] = record_type;
    out[2..4].copy_from_slice(&request_id.to_be_bytes());
    out[4..6].copy_from_slice(&content_length.to_be_bytes());
    out[6] = 0; // padding_length: this crate never pads outbound records
    out[7] = 0;
    out
}

/// §4.7.1 step 1. `data` must be exactly [`HEADER_LEN`] bytes.
pub fn decode_header(data: &[u8]) -> Result<RecordHeader, RecordError> {
    if data.len() < HEADER_LEN {
        return Err(RecordError::TruncatedHeader);
    }
    let version = data[0];
    if version != FCGI_VERSION_1 {
        return Err(RecordError::UnsupportedVersion(version));
    }
    Ok(RecordHeader {
        version,
        record_type: data[1],
        request_id: u16::from_be_bytes([data[2], data[3]]),
        content_length: u16::from_be_bytes([data[4], data[5]]),
        padding_length: data[6],
    })
}

/// BEGIN_REQUEST body: `role(2) flags(1) reserved(5)`.
pub fn decode_begin_request(body: &[u8]) -> Option<(u16, u8)> {
    if body.len() < 3 {
        return None;
    }
    Some((u16::from_be_bytes([body[0], body[1]]), body[2]))
}

/// END_REQUEST body: `app_status(4) protocol_status(1) reserved(3)`.
pub fn encode_end_request(request_id: u16, app_status: i32, protocol_status: u8) -> Vec<u8> {
    let mut body = Vec::with_capacity(8);
    body.extend_from_slice(&app_status.to_be_bytes());
    body.push(protocol_status);
    body.extend_from_slice(&[0, 0, 0]);
    frame(TYPE_END_REQUEST, request_id, &body)
}

/// UNKNOWN_TYPE body: `type(1) reserved(7)`.
pub fn encode_unknown_type(unknown_type: u8) -> Vec<u8> {
    let mut body = vec![unknown_type];
    body.extend_from_slice(&[0u8; 7]);
    frame(TYPE_UNKNOWN_TYPE, NULL_REQUEST_ID, &body)
}

pub fn encode_get_values_result(pairs: &[(&str, String)]) -> Vec<u8> {
    let body = encode_nv_pairs(pairs);
    frame(TYPE_GET_VALUES_RESULT, NULL_REQUEST_ID, &body)
}

/// Wraps one record's header + body (no padding emitted).
fn frame(record_type: u8, request_id: u16, body: &[u8]) -> Vec<u8> {
    let mut out = encode_header(record_type, request_id, body.len() as u16).to_vec();
    out.extend_from_slice(body);
    out
}

/// §4.7.4: slices `data` into chunks of at most [`MAX_STREAM_CHUNK`] bytes,
/// each wrapped in its own STDOUT/STDERR record.
pub fn frame_stream(record_type: u8, request_id: u16, data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return frame(record_type, request_id, &[]);
    }
    let mut out = Vec::with_capacity(data.len() + HEADER_LEN);
    for chunk in data.chunks(MAX_STREAM_CHUNK) {
        out.extend_from_slice(&frame(record_type, request_id, chunk));
    }
    out
}

/// §4.7.3: `name_len(1|4) value_len(1|4) name value`. A length byte with the
/// top bit set means "four-byte big-endian length with the top bit masked".
pub fn decode_nv_pairs(data: &[u8]) -> Result<HashMap<String, String>, RecordError> {
    let mut pairs = HashMap::new();
    let mut pos = 0usize;

    while pos < data.len() {
        let (name_len, advance) = read_length(data, pos)?;
        pos += advance;
        let (value_len, advance) = read_length(data, pos)?;
        pos += advance;

        let name_end = pos + name_len;
        let value_end = name_end + value_len;
        if value_end > data.len() {
            return Err(RecordError::TruncatedNameValuePair);
        }

        let name = String::from_utf8_lossy(&data[pos..name_end]).into_owned();
        let value = String::from_utf8_lossy(&data[name_end..value_end]).into_owned();
        pairs.insert(name, value);
        pos = value_end;
    }

    Ok(pairs)
}

fn read_length(data: &[u8], pos: usize) -> Result<(usize, usize), RecordError> {
    if pos >= data.len() {
        return Err(RecordError::TruncatedNameValuePair);
    }
    let first = data[pos];
    if first & 0x80 != 0 {
        if pos + 4 > data.len() {
            return Err(RecordError::TruncatedNameValuePair);
        }
        let raw = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
        Ok(((raw & 0x7fff_ffff) as usize, 4))
    } else {
        Ok((first as usize, 1))
    }
}

fn encode_length(len: usize, out: &mut Vec<u8>) {
    if len > 127 {
        let raw = (len as u32) | 0x8000_0000;
        out.extend_from_slice(&raw.to_be_bytes());
    } else {
        out.push(len as u8);
    }
}

pub fn encode_nv_pairs(pairs: &[(&str, String)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in pairs {
        encode_length(name.len(), &mut out);
        encode_length(value.len(), &mut out);
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(value.as_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let raw = encode_header(TYPE_STDIN, 7, 42);
        let header = decode_header(&raw).unwrap();
        assert_eq!(header.record_type, TYPE_STDIN);
        assert_eq!(header.request_id, 7);
        assert_eq!(header.content_length, 42);
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut raw = encode_header(TYPE_STDIN, 1, 0);
        raw[0] = 2;
        assert_eq!(decode_header(&raw), Err(RecordError::UnsupportedVersion(2)));
    }

    #[test]
    fn begin_request_body_decodes_role_and_flags() {
        let body = [0u8, ROLE_RESPONDER as u8, FLAG_KEEP_CONN, 0, 0, 0, 0, 0];
        let (role, flags) = decode_begin_request(&body).unwrap();
        assert_eq!(role, ROLE_RESPONDER);
        assert_eq!(flags, FLAG_KEEP_CONN);
    }

    #[test]
    fn nv_pairs_round_trip_short_names() {
        let encoded = encode_nv_pairs(&[("SCRIPT_NAME", "/x".to_string()), ("A", "B".to_string())]);
        let decoded = decode_nv_pairs(&encoded).unwrap();
        assert_eq!(decoded.get("SCRIPT_NAME").unwrap(), "/x");
        assert_eq!(decoded.get("A").unwrap(), "B");
    }

    #[test]
    fn nv_pairs_round_trip_long_value_uses_four_byte_length() {
        let long_value = "x".repeat(200);
        let encoded = encode_nv_pairs(&[("K", long_value.clone())]);
        // length byte's top bit must be set for the value length
        assert_eq!(encoded[1] & 0x80, 0x80);
        let decoded = decode_nv_pairs(&encoded).unwrap();
        assert_eq!(decoded.get("K").unwrap(), &long_value);
    }

    #[test]
    fn stream_framing_splits_large_payload_into_max_chunks() {
        let data = vec![b'x'; MAX_STREAM_CHUNK + 10];
        let framed = frame_stream(TYPE_STDOUT, 3, &data);
        // two records: header+65535 bytes, header+10 bytes
        let first = decode_header(&framed[..HEADER_LEN]).unwrap();
        assert_eq!(first.content_length as usize, MAX_STREAM_CHUNK);
        let second_start = HEADER_LEN + MAX_STREAM_CHUNK;
        let second = decode_header(&framed[second_start..second_start + HEADER_LEN]).unwrap();
        assert_eq!(second.content_length, 10);
    }

    #[test]
    fn end_request_frame_encodes_status_fields() {
        let framed = encode_end_request(5, 0, STATUS_REQUEST_COMPLETE);
        let header = decode_header(&framed[..HEADER_LEN]).unwrap();
        assert_eq!(header.record_type, TYPE_END_REQUEST);
        assert_eq!(header.request_id, 5);
        assert_eq!(framed[HEADER_LEN + 4], STATUS_REQUEST_COMPLETE);
    }
}
