//! Worker heartbeat files: liveness advertisement, staleness filtering, and
//! route matching, named and tested the way `pigeon/worker.py`'s
//! `_normalize_route`/`_route_matches` are.

use anyhow::{Context, Result};

use crate::codec::atomic_write_json;
use crate::model::HeartbeatRecord;
use crate::paths::{heartbeat_path, sanitize_worker_id, PigeonConfig};

pub const HEARTBEAT_INTERVAL_SECS: f64 = 1.0;
pub const DEFAULT_STALE_AFTER_SECS: f64 = 3.0;

/// Writes (or overwrites) a worker's heartbeat file atomically.
pub fn write_heartbeat(config: &PigeonConfig, record: &HeartbeatRecord) -> Result<()> {
    atomic_write_json(&heartbeat_path(config, &record.worker_id), record)
}

/// Removes a worker's heartbeat file. Idempotent: a missing file is not an
/// error, matching the expected shutdown path where removal may race a
/// concurrent cleanup.
pub fn remove_heartbeat(config: &PigeonConfig, worker_id: &str) -> Result<()> {
    let path = heartbeat_path(config, worker_id);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing heartbeat {}", path.display())),
    }
}

/// Strips whitespace from a route; empty or non-present becomes `None`, so
/// `None`, `Some("")`, and `Some("   ")` all collapse to the same bucket.
pub fn normalize_route(route: Option<&str>) -> Option<String> {
    let trimmed = route?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// A worker with route `worker_route` serves a request with route
/// `req_route` iff their normalized forms are equal. `None` matches `None`
/// only; it is a distinct bucket from every non-null value.
pub fn route_matches(worker_route: Option<&str>, req_route: Option<&str>) -> bool {
    normalize_route(worker_route) == normalize_route(req_route)
}

/// Scans `workers_dir` for heartbeats that are fresh (`now - updated_ts <=
/// stale_after`) and whose route matches `req_route`. Files that fail to
/// parse or are missing `updated_ts` are skipped. Results are sorted by
/// file name (i.e. by sanitized worker id).
pub fn discover_active_workers(
    config: &PigeonConfig,
    req_route: Option<&str>,
    now: f64,
    stale_after: f64,
) -> Result<Vec<HeartbeatRecord>> {
    let dir = config.workers_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries: Vec<(String, HeartbeatRecord)> = Vec::new();
    for entry in std::fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "skipping unreadable heartbeat");
                continue;
            }
        };
        let record: HeartbeatRecord = match serde_json::from_str(&content) {
            Ok(r) => r,
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "skipping malformed heartbeat");
                continue;
            }
        };
        if now - record.updated_ts > stale_after {
            continue;
        }
        if !route_matches(record.route.as_deref(), req_route) {
            continue;
        }
        entries.push((entry.file_name().to_string_lossy().into_owned(), record));
    }

    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries.into_iter().map(|(_, record)| record).collect())
}

pub fn worker_id(host: &str, pid: i32) -> String {
    sanitize_worker_id(&format!("{host}-{pid}"))
}
