//! Record types exchanged through the cache directory: requests, status,
//! and the three per-session JSONL streams.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Terminal dimensions, carried on the request and on resize control records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u32,
    pub rows: u32,
}

/// The requesting side's view of the terminal at session start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalInfo {
    pub stdin_isatty: bool,
    pub stdout_isatty: bool,
    #[serde(default)]
    pub size: Option<TerminalSize>,
}

/// Identifies the process that created a session, for diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequesterInfo {
    pub host: String,
    pub pid: i32,
    pub user: String,
}

/// The immutable record a requester writes once at `request.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub session_id: String,
    pub command: Vec<String>,
    pub cwd: String,
    #[serde(default)]
    pub route: Option<String>,
    pub created_at: String,
    pub requester: RequesterInfo,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub unset_env: Vec<String>,
    pub terminal: TerminalInfo,
}

/// Lifecycle state of a session, as recorded in `status.json`. Transitions
/// form the DAG `pending -> running -> (succeeded | failed | cancelled)`;
/// the core runner only ever writes `succeeded`/`failed` — `cancelled` is
/// reserved for external tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Which worker claimed a session, once running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRef {
    pub host: String,
    pub pid: i32,
}

/// The mutable record a worker updates in place at `status.json`. Updates
/// are merge-over-prior: unrecognized fields are preserved via `extra`
/// rather than dropped on rewrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub session_id: String,
    pub state: SessionState,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub worker: Option<WorkerRef>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl StatusRecord {
    pub fn pending(session_id: impl Into<String>, created_at: impl Into<String>) -> Self {
        let created_at = created_at.into();
        Self {
            session_id: session_id.into(),
            state: SessionState::Pending,
            created_at: created_at.clone(),
            updated_at: created_at,
            started_at: None,
            finished_at: None,
            exit_code: None,
            worker: None,
            error: None,
            extra: BTreeMap::new(),
        }
    }
}

/// Which descriptor an output record was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Pty,
    Stdout,
    Stderr,
}

/// The non-output half of `stream.jsonl`: one-shot lifecycle markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum EventRecord {
    #[serde(rename = "started")]
    Started { ts: f64 },
    #[serde(rename = "pty_fallback_to_pipes")]
    PtyFallbackToPipes { ts: f64 },
    #[serde(rename = "worker_error")]
    WorkerError { ts: f64, message: String },
    #[serde(rename = "exit")]
    Exit {
        ts: f64,
        exit_code: i32,
        raw_return_code: i32,
    },
}

/// One line of `stream.jsonl`. `seq` is monotonically increasing per
/// session across `Output` records; channels may interleave but each
/// channel is individually in-order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamRecord {
    #[serde(rename = "event")]
    Event(EventRecord),
    #[serde(rename = "output")]
    Output {
        seq: u64,
        ts: f64,
        channel: Channel,
        data_b64: String,
    },
}

/// One line of `stdin.jsonl`, written by the requester and tailed by the
/// worker driving the session. `seq` is strictly increasing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StdinRecord {
    #[serde(rename = "stdin")]
    Stdin { seq: u64, ts: f64, data_b64: String },
    #[serde(rename = "stdin_eof")]
    StdinEof { seq: u64, ts: f64 },
}

/// One line of `control.jsonl`: out-of-band signals, kept separate from the
/// byte stream so a resize can never be confused with input data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlRecord {
    #[serde(rename = "signal")]
    Signal { seq: u64, ts: f64, signal: i32 },
    #[serde(rename = "resize")]
    Resize {
        seq: u64,
        ts: f64,
        cols: u32,
        rows: u32,
    },
}

/// A worker's liveness advertisement, written to `workers/<id>.json` on a
/// fixed interval and consulted by requesters deciding whether to wait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub worker_id: String,
    pub host: String,
    pub pid: i32,
    #[serde(default)]
    pub route: Option<String>,
    pub started_at: String,
    pub updated_at: String,
    pub updated_ts: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_record_round_trips_with_unknown_fields_preserved() {
        let raw = serde_json::json!({
            "session_id": "s1",
            "state": "running",
            "created_at": "2026-01-01T00:00:00.000000Z",
            "updated_at": "2026-01-01T00:00:01.000000Z",
            "started_at": "2026-01-01T00:00:01.000000Z",
            "finished_at": null,
            "exit_code": null,
            "worker": {"host": "h", "pid": 42},
            "error": null,
            "future_field": "kept"
        });
        let status: StatusRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(status.extra.get("future_field").unwrap(), "kept");
        let back = serde_json::to_value(&status).unwrap();
        assert_eq!(back["future_field"], "kept");
    }

    #[test]
    fn stream_event_tags_nest_under_type_event() {
        let rec = StreamRecord::Event(EventRecord::Exit {
            ts: 1.0,
            exit_code: 0,
            raw_return_code: 0,
        });
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["type"], "event");
        assert_eq!(v["event"], "exit");
        assert_eq!(v["exit_code"], 0);
    }

    #[test]
    fn output_record_carries_base64_data() {
        let rec = StreamRecord::Output {
            seq: 1,
            ts: 0.0,
            channel: Channel::Pty,
            data_b64: "aGk=".into(),
        };
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["type"], "output");
        assert_eq!(v["channel"], "pty");
    }

    #[test]
    fn stdin_eof_has_no_data_field() {
        let rec = StdinRecord::StdinEof { seq: 3, ts: 0.0 };
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["type"], "stdin_eof");
        assert!(v.get("data_b64").is_none());
    }

    #[test]
    fn control_record_resize_uses_cols_rows() {
        let rec = ControlRecord::Resize {
            seq: 0,
            ts: 0.0,
            cols: 80,
            rows: 24,
        };
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["type"], "resize");
        assert_eq!(v["cols"], 80);
        assert_eq!(v["rows"], 24);
    }

    #[test]
    fn request_record_defaults_env_unset_env_and_route() {
        let raw = serde_json::json!({
            "session_id": "s1",
            "command": ["echo", "hi"],
            "cwd": "/tmp",
            "created_at": "2026-01-01T00:00:00.000000Z",
            "requester": {"host": "h", "pid": 1, "user": "u"},
            "terminal": {"stdin_isatty": false, "stdout_isatty": false}
        });
        let req: RequestRecord = serde_json::from_value(raw).unwrap();
        assert!(req.env.is_empty());
        assert!(req.unset_env.is_empty());
        assert_eq!(req.route, None);
        assert_eq!(req.terminal.size, None);
    }

    #[test]
    fn session_state_is_terminal_classifies_correctly() {
        assert!(!SessionState::Pending.is_terminal());
        assert!(!SessionState::Running.is_terminal());
        assert!(SessionState::Succeeded.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(SessionState::Cancelled.is_terminal());
    }
}
