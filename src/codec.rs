//! Atomic JSON writes, fsynced JSONL appends, a resumable tail reader, and
//! the base64 byte framing used for all binary payloads on the transport.
//!
//! These are the only primitives through which the rest of the crate
//! touches the shared cache directory; every other module is built on top
//! of them so the atomicity and partial-line-safety invariants only need to
//! be proven once.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{Context, Result};
use data_encoding::BASE64;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tempfile::NamedTempFile;

/// Serializes `value` with sorted keys, compact separators and ASCII-only
/// escaping, matching the wire format's stability requirement (writers must
/// be deterministic; readers must not depend on key order).
fn stable_json_string<T: Serialize>(value: &T) -> Result<String> {
    // serde_json's default `Value::Object` is a `BTreeMap`, so round-tripping
    // through `Value` sorts keys for free.
    let as_value = serde_json::to_value(value).context("serializing JSON record")?;
    let compact = serde_json::to_string(&as_value).context("encoding JSON record")?;
    Ok(ascii_escape(&compact))
}

/// Escapes every non-ASCII character in an already-compact JSON string as a
/// `\uXXXX` sequence. Safe to run over the whole document: outside string
/// literals every byte serde_json emits is already ASCII punctuation.
fn ascii_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut units = [0u16; 2];
    for c in s.chars() {
        if (c as u32) < 0x80 {
            out.push(c);
        } else {
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    out
}

/// Writes `value` to `path` atomically: a sibling temp file is created,
/// written, fsynced, then renamed over the destination. The temp file is
/// unlinked on every error path.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .context("destination path has no parent directory")?;
    fs::create_dir_all(parent)?;
    let payload = stable_json_string(value)?;

    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("creating temp file next to {}", path.display()))?;
    tmp.write_all(payload.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| anyhow::anyhow!("renaming temp file over {}: {}", path.display(), e.error))?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

pub fn read_json_value(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

/// Appends one self-delimiting JSON line, flushed and fsynced before
/// returning, so a crash can never leave a half-written record.
pub fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let line = stable_json_string(record)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {} for append", path.display()))?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.flush()?;
    file.sync_all()?;
    Ok(())
}

/// Creates an empty file if it does not already exist, without truncating
/// one that does (used when touching the three per-session log files).
pub fn touch(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)?;
    Ok(())
}

/// Reads the complete JSON lines available past `offset`.
///
/// Returns `(new_offset, records)` where `records` are exactly the
/// self-delimiting lines in `[offset, new_offset)`. A trailing partial line
/// (no terminating `\n` yet) is left unread so a concurrent writer's
/// in-progress append is never parsed as a whole line. If the file has
/// shrunk below `offset` (truncated or rotated), the read resets to 0.
/// Invalid JSON lines are skipped rather than aborting the scan.
pub fn tail_jsonl(path: &Path, offset: u64) -> Result<(u64, Vec<Value>)> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((offset, Vec::new())),
        Err(e) => return Err(e.into()),
    };

    let size = file.metadata()?.len();
    let offset = if offset > size { 0 } else { offset };
    if offset == size {
        return Ok((offset, Vec::new()));
    }

    file.seek(SeekFrom::Start(offset))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    let Some(last_newline) = data.iter().rposition(|&b| b == b'\n') else {
        return Ok((offset, Vec::new()));
    };
    let parseable = &data[..=last_newline];
    let new_offset = offset + parseable.len() as u64;

    let mut records = Vec::new();
    for line in parseable.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        match serde_json::from_slice::<Value>(line) {
            Ok(value) => records.push(value),
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "skipping malformed JSONL record");
            }
        }
    }

    Ok((new_offset, records))
}

pub fn encode_bytes(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Decodes a base64 payload. A decoding error rejects only this record; it
/// must never abort the caller's stream.
pub fn decode_bytes(raw: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(raw.as_bytes())
        .context("invalid base64 byte frame")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status.json");
        atomic_write_json(&path, &json!({"b": 2, "a": 1})).unwrap();
        let value: Value = read_json_value(&path).unwrap();
        assert_eq!(value, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn atomic_write_leaves_no_temp_residue() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status.json");
        atomic_write_json(&path, &json!({"a": 1})).unwrap();
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().filter_map(Result::ok).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].file_name().to_string_lossy(), "status.json");
    }

    #[test]
    fn write_produces_sorted_compact_ascii_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.json");
        atomic_write_json(&path, &json!({"z": "héllo", "a": 1})).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.is_ascii());
        assert!(raw.starts_with("{\"a\":1,\"z\":"));
        assert!(!raw.contains(' '));
    }

    #[test]
    fn tail_jsonl_resumes_from_offset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stream.jsonl");
        append_jsonl(&path, &json!({"seq": 0})).unwrap();
        append_jsonl(&path, &json!({"seq": 1})).unwrap();

        let (offset1, records1) = tail_jsonl(&path, 0).unwrap();
        assert_eq!(records1.len(), 2);

        append_jsonl(&path, &json!({"seq": 2})).unwrap();
        let (offset2, records2) = tail_jsonl(&path, offset1).unwrap();
        assert_eq!(records2.len(), 1);
        assert_eq!(records2[0]["seq"], 2);
        assert!(offset2 > offset1);
    }

    #[test]
    fn tail_jsonl_leaves_partial_trailing_line_unread() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stream.jsonl");
        append_jsonl(&path, &json!({"seq": 0})).unwrap();

        // Simulate a writer mid-append: a record with no trailing newline.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"seq":1}"#).unwrap();
        file.flush().unwrap();

        let (offset, records) = tail_jsonl(&path, 0).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["seq"], 0);

        // Completing the line makes it visible on the next tail call.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"\n").unwrap();
        drop(file);
        let (_offset2, records2) = tail_jsonl(&path, offset).unwrap();
        assert_eq!(records2.len(), 1);
        assert_eq!(records2[0]["seq"], 1);
    }

    #[test]
    fn tail_jsonl_resets_on_truncation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stream.jsonl");
        append_jsonl(&path, &json!({"seq": 0})).unwrap();
        let (offset, _) = tail_jsonl(&path, 0).unwrap();

        fs::write(&path, b"").unwrap();
        let (new_offset, records) = tail_jsonl(&path, offset).unwrap();
        assert_eq!(new_offset, 0);
        assert!(records.is_empty());
    }

    #[test]
    fn tail_jsonl_skips_malformed_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stream.jsonl");
        fs::write(&path, b"not json\n{\"seq\":1}\n").unwrap();
        let (_offset, records) = tail_jsonl(&path, 0).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["seq"], 1);
    }

    #[test]
    fn tail_jsonl_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.jsonl");
        let (offset, records) = tail_jsonl(&path, 0).unwrap();
        assert_eq!(offset, 0);
        assert!(records.is_empty());
    }

    #[test]
    fn byte_framing_round_trips() {
        let data = b"hello\x00\xffworld";
        let encoded = encode_bytes(data);
        assert!(encoded.is_ascii());
        let decoded = decode_bytes(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn byte_framing_rejects_invalid_base64() {
        assert!(decode_bytes("not base64!!").is_err());
    }
}
