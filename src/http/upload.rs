//! Multipart upload streaming to disk (§4.6.2). Each file part is written in
//! chunks directly to a temp file under the configured upload directory
//! instead of being buffered in memory.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::http::response::get_mime_type;

pub const UPLOAD_READ_SIZE_SMALL: usize = 64 * 1024;
pub const UPLOAD_READ_SIZE_LARGE: usize = 128 * 1024;
pub const LARGE_UPLOAD_THRESHOLD: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartError {
    MaxSizeExceeded,
    Io,
}

#[derive(Debug, Clone)]
pub struct SavedPart {
    pub field_name: String,
    pub filename: Option<String>,
    pub temp_name: String,
    pub content_type: String,
    pub size: u64,
    pub error: Option<PartError>,
}

#[derive(Debug, Default)]
struct PartInfo {
    name: String,
    filename: Option<String>,
    content_type: String,
}

fn parse_part_headers(headers: &str) -> PartInfo {
    let mut info = PartInfo::default();
    for line in headers.lines() {
        if line.to_ascii_lowercase().starts_with("content-disposition:") {
            if let Some(n) = line.split(';').find(|s| s.trim().starts_with("name=")) {
                info.name = n.split('=').nth(1).unwrap_or("").trim_matches('"').to_string();
            }
            if let Some(fname) = line.split(';').find(|s| s.trim().starts_with("filename=")) {
                info.filename =
                    Some(fname.split('=').nth(1).unwrap_or("").trim_matches('"').to_string());
            }
        } else if line.to_ascii_lowercase().starts_with("content-type:") {
            info.content_type =
                line.split(':').nth(1).unwrap_or("application/octet-stream").trim().to_string();
        }
    }
    info
}

fn random_temp_name() -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(25).map(char::from).collect()
}

#[derive(Debug)]
enum Phase {
    SeekBoundary,
    PartHeaders,
    PartBody { data_start_in_buf: usize },
}

/// The part currently being streamed: a file part writes to disk, a plain
/// field accumulates in memory until its boundary is hit (§4.6.2's "merges
/// parsed pairs into the parameter map like a urlencoded body" for fields
/// without a `filename`).
enum CurrentPart {
    File(File, SavedPart),
    Field(String, Vec<u8>),
    None,
}

/// Drives one multipart/form-data request body to completion. Owns an
/// accumulation buffer distinct from the `Connection` read buffer — bytes
/// are handed to `feed` as they become available from the body-read loop.
pub struct MultipartUpload {
    boundary: Vec<u8>,
    upload_dir: PathBuf,
    max_part_size: u64,
    buffer: VecDeque<u8>,
    phase: Phase,
    current_part: CurrentPart,
    pub parts: Vec<SavedPart>,
    pub fields: HashMap<String, Vec<String>>,
    pub done: bool,
}

impl MultipartUpload {
    pub fn new(boundary: &str, upload_dir: PathBuf, max_part_size: u64) -> Self {
        Self {
            boundary: format!("--{boundary}").into_bytes(),
            upload_dir,
            max_part_size,
            buffer: VecDeque::new(),
            phase: Phase::SeekBoundary,
            current_part: CurrentPart::None,
            parts: Vec::new(),
            fields: HashMap::new(),
            done: false,
        }
    }

    /// §4.6.2 step 2: read size hint while a part is actively streaming.
    pub fn preferred_read_size(&self, content_length_hint: u64) -> usize {
        if content_length_hint >= LARGE_UPLOAD_THRESHOLD as u64 {
            UPLOAD_READ_SIZE_LARGE
        } else {
            UPLOAD_READ_SIZE_SMALL
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend(chunk);
        self.drive();
    }

    fn drive(&mut self) {
        loop {
            match &self.phase {
                Phase::SeekBoundary => {
                    let Some(pos) = find(&self.buffer, &self.boundary, 0) else { break };
                    let after = pos + self.boundary.len();
                    if matches_at(&self.buffer, after, b"--") {
                        self.done = true;
                        self.buffer.drain(..after + 2);
                        break;
                    }
                    if !matches_at(&self.buffer, after, b"\r\n") {
                        break; // wait for more bytes to disambiguate
                    }
                    self.buffer.drain(..after + 2);
                    self.phase = Phase::PartHeaders;
                }
                Phase::PartHeaders => {
                    let Some(sep) = find(&self.buffer, b"\r\n\r\n", 0) else { break };
                    let header_bytes: Vec<u8> = self.buffer.iter().take(sep).copied().collect();
                    let info = parse_part_headers(&String::from_utf8_lossy(&header_bytes));
                    self.buffer.drain(..sep + 4);

                    if let Some(filename) = info.filename.filter(|f| !f.is_empty()) {
                        let temp_name = random_temp_name();
                        let path = self.upload_dir.join(&temp_name);
                        let content_type = if info.content_type.is_empty() {
                            guess_content_type(&filename)
                        } else {
                            info.content_type.clone()
                        };
                        let saved = SavedPart {
                            field_name: info.name,
                            filename: Some(filename),
                            temp_name,
                            content_type,
                            size: 0,
                            error: None,
                        };
                        match OpenOptions::new().create(true).write(true).truncate(true).open(&path)
                        {
                            Ok(file) => self.current_part = CurrentPart::File(file, saved),
                            Err(_) => {
                                let mut saved = saved;
                                saved.error = Some(PartError::Io);
                                self.current_part = CurrentPart::None;
                                self.parts.push(saved);
                            }
                        }
                    } else {
                        self.current_part = CurrentPart::Field(info.name, Vec::new());
                    }
                    self.phase = Phase::PartBody { data_start_in_buf: 0 };
                }
                Phase::PartBody { .. } => {
                    let Some(pos) = find(&self.buffer, &self.boundary, 0) else {
                        // no boundary yet: flush everything except a safety
                        // margin that might be the start of the boundary.
                        let margin = self.boundary.len() + 2;
                        if self.buffer.len() > margin {
                            let writable = self.buffer.len() - margin;
                            self.write_part_bytes(writable);
                        }
                        break;
                    };
                    let data_end = if pos >= 2 && matches_at(&self.buffer, pos - 2, b"\r\n") {
                        pos - 2
                    } else {
                        pos
                    };
                    self.write_part_bytes(data_end);
                    self.buffer.drain(..pos);
                    self.finish_current_part();
                    self.phase = Phase::SeekBoundary;
                }
            }
        }
    }

    fn write_part_bytes(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        let data: Vec<u8> = self.buffer.drain(..count).collect();
        match &mut self.current_part {
            CurrentPart::File(file, saved) => {
                if saved.error.is_some() {
                    return;
                }
                if saved.size + data.len() as u64 > self.max_part_size {
                    saved.error = Some(PartError::MaxSizeExceeded);
                    return;
                }
                if file.write_all(&data).is_err() {
                    saved.error = Some(PartError::Io);
                } else {
                    saved.size += data.len() as u64;
                }
            }
            CurrentPart::Field(_, buf) => buf.extend_from_slice(&data),
            CurrentPart::None => {}
        }
    }

    fn finish_current_part(&mut self) {
        match std::mem::replace(&mut self.current_part, CurrentPart::None) {
            CurrentPart::File(_, saved) => self.parts.push(saved),
            CurrentPart::Field(name, buf) => {
                let value = String::from_utf8_lossy(&buf).into_owned();
                self.fields.entry(name).or_default().push(value);
            }
            CurrentPart::None => {}
        }
    }
}

fn guess_content_type(filename: &str) -> String {
    let ext = Path::new(filename).extension().and_then(|e| e.to_str());
    get_mime_type(ext).to_string()
}

fn matches_at(buf: &VecDeque<u8>, at: usize, needle: &[u8]) -> bool {
    needle.iter().enumerate().all(|(i, b)| buf.get(at + i) == Some(b))
}

fn find(buf: &VecDeque<u8>, needle: &[u8], start: usize) -> Option<usize> {
    if needle.is_empty() || buf.len() < start + needle.len() {
        return None;
    }
    (start..=buf.len() - needle.len()).find(|&i| matches_at(buf, i, needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn body(boundary: &str, parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, filename, data) in parts {
            out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            match filename {
                Some(f) => out.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{f}\"\r\nContent-Type: text/plain\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => out.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            out.extend_from_slice(data);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        out
    }

    #[test]
    fn streams_a_single_file_part_to_disk() {
        let dir = tempdir().unwrap();
        let boundary = "X";
        let raw = body(boundary, &[("blob", Some("a.txt"), b"hello world")]);

        let mut upload = MultipartUpload::new(boundary, dir.path().to_path_buf(), 1_000_000);
        upload.feed(&raw);

        assert!(upload.done);
        assert_eq!(upload.parts.len(), 1);
        let part = &upload.parts[0];
        assert!(part.error.is_none());
        assert_eq!(part.size, 11);
        let contents = std::fs::read(dir.path().join(&part.temp_name)).unwrap();
        assert_eq!(contents, b"hello world");
    }

    #[test]
    fn oversized_part_is_flagged_but_consumption_continues() {
        let dir = tempdir().unwrap();
        let boundary = "X";
        let raw = body(boundary, &[("blob", Some("a.bin"), &[1u8; 100])]);

        let mut upload = MultipartUpload::new(boundary, dir.path().to_path_buf(), 10);
        upload.feed(&raw);

        assert!(upload.done);
        assert_eq!(upload.parts.len(), 1);
        assert_eq!(upload.parts[0].error, Some(PartError::MaxSizeExceeded));
    }

    #[test]
    fn field_part_without_filename_is_captured_not_written_to_disk() {
        let dir = tempdir().unwrap();
        let boundary = "X";
        let raw = body(boundary, &[("name", None, b"alice")]);

        let mut upload = MultipartUpload::new(boundary, dir.path().to_path_buf(), 1_000_000);
        upload.feed(&raw);

        assert!(upload.done);
        assert!(upload.parts.is_empty());
        assert_eq!(upload.fields.get("name").map(Vec::as_slice), Some(&["alice".to_string()][..]));
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn mixed_field_and_file_parts_both_survive() {
        let dir = tempdir().unwrap();
        let boundary = "X";
        let raw = body(
            boundary,
            &[("name", None, b"alice"), ("blob", Some("a.txt"), b"hello world")],
        );

        let mut upload = MultipartUpload::new(boundary, dir.path().to_path_buf(), 1_000_000);
        upload.feed(&raw);

        assert!(upload.done);
        assert_eq!(upload.parts.len(), 1);
        assert_eq!(upload.fields.get("name").map(Vec::as_slice), Some(&["alice".to_string()][..]));
    }

    #[test]
    fn feeding_one_byte_at_a_time_still_completes() {
        let dir = tempdir().unwrap();
        let boundary = "X";
        let raw = body(boundary, &[("blob", Some("a.txt"), b"streamed-slowly")]);

        let mut upload = MultipartUpload::new(boundary, dir.path().to_path_buf(), 1_000_000);
        for byte in &raw {
            upload.feed(&[*byte]);
        }

        assert!(upload.done);
        assert_eq!(upload.parts[0].size, "streamed-slowly".len() as u64);
    }
}
