pub mod config;
pub mod error;
pub mod paths;
pub mod wait;

use anyhow::Result;
use chrono::Local;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;

pub use config::{JobConfig, QueueSpec, Timing};
pub use error::RelayError;
pub use paths::PathTranslator;
pub use wait::{sleep_cancellable, wait_until, WaitPolicy};

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("sha256:{}", hex::encode(digest))
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = chrono::Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Writes `lines` joined with `\n` plus a trailing newline. Any `\r\n` that
/// slipped in through template lines is collapsed so the cluster shell never
/// sees carriage returns.
pub fn write_unix_text(path: &Path, lines: &[String]) -> Result<()> {
    let mut text = lines.join("\n");
    text.push('\n');
    atomic_write_bytes(path, &normalize_line_endings(text.as_bytes()))
}

/// Writes `lines` with `\r\n` endings for files the Windows side executes.
pub fn write_dos_text(path: &Path, lines: &[String]) -> Result<()> {
    let mut text = Vec::new();
    for line in lines {
        text.extend_from_slice(line.trim_end_matches(['\r', '\n']).as_bytes());
        text.extend_from_slice(b"\r\n");
    }
    atomic_write_bytes(path, &text)
}

pub fn normalize_line_endings(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter().peekable();
    while let Some(&b) = iter.next() {
        if b == b'\r' && iter.peek() == Some(&&b'\n') {
            continue;
        }
        out.push(b);
    }
    out
}

/// Appends one timestamped line to a sentinel file, creating it if needed.
/// Sentinels are append-only; nothing in this workspace removes them.
pub fn append_sentinel(path: &Path, message: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{} @ {}", message, Local::now().to_rfc3339())?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_line_endings_strips_crlf_only() {
        let input = b"#!/bin/bash\r\necho a\rb\n\r\n";
        assert_eq!(normalize_line_endings(input), b"#!/bin/bash\necho a\rb\n\n");
    }

    #[test]
    fn write_unix_text_never_emits_carriage_returns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("job.sh");
        let lines = vec!["#!/bin/bash\r".to_string(), "echo hi".to_string()];
        write_unix_text(&path, &lines).expect("write");
        let bytes = fs::read(&path).expect("read");
        assert!(!bytes.contains(&b'\r'));
        assert_eq!(bytes, b"#!/bin/bash\necho hi\n");
    }

    #[test]
    fn write_dos_text_uses_crlf() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("upload.bat");
        write_dos_text(&path, &["echo a".to_string(), "echo b\r".to_string()]).expect("write");
        assert_eq!(fs::read(&path).expect("read"), b"echo a\r\necho b\r\n");
    }

    #[test]
    fn append_sentinel_is_append_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("session-started.txt");
        append_sentinel(&path, "first").expect("append");
        append_sentinel(&path, "second").expect("append");
        let text = fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("first @ "));
        assert!(lines[1].starts_with("second @ "));
    }

    #[test]
    fn sha256_bytes_is_prefixed_hex() {
        let digest = sha256_bytes(b"abc");
        assert_eq!(
            digest,
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
