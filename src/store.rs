//! Per-session directory lifecycle: creation-once semantics, the O_EXCL
//! claim that binds a session to exactly one worker, and merge-over-prior
//! atomic status updates.

use std::os::unix::fs::OpenOptionsExt;

use anyhow::{bail, Context, Result};

use crate::codec::{atomic_write_json, read_json, touch};
use crate::model::{RequestRecord, StatusRecord};
use crate::paths::{
    claim_path, control_path, request_path, session_dir, status_path, stdin_path, stream_path,
    PigeonConfig,
};

/// Attempts to claim a session for `(worker_host, worker_pid)` by creating
/// `worker.claim` with `O_CREAT | O_EXCL`. Returns `Ok(true)` on success,
/// `Ok(false)` if another worker already owns the session — this is the
/// expected, silent `ClaimRace` outcome, not an error.
pub fn try_claim(
    config: &PigeonConfig,
    session_id: &str,
    worker_host: &str,
    worker_pid: i32,
) -> Result<bool> {
    let path = claim_path(config, session_id);
    let result = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(&path);
    match result {
        Ok(mut file) => {
            use std::io::Write;
            write!(file, "worker_host={worker_host}\nworker_pid={worker_pid}\n")?;
            file.sync_all()?;
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e).with_context(|| format!("claiming session {session_id}")),
    }
}

/// Creates `sessions_dir/<session_id>/`, writes `request.json` and an
/// initial `pending` `status.json`, and touches the three empty log files.
/// Fails with an error if the session directory already exists — a session
/// id is claimed by directory creation exactly once.
pub fn create_session(
    config: &PigeonConfig,
    request: &RequestRecord,
    status: &StatusRecord,
) -> Result<()> {
    let dir = session_dir(config, &request.session_id);
    std::fs::create_dir(&dir)
        .with_context(|| format!("session {} already exists", request.session_id))?;

    atomic_write_json(&request_path(config, &request.session_id), request)?;
    atomic_write_json(&status_path(config, &request.session_id), status)?;
    touch(&stream_path(config, &request.session_id))?;
    touch(&stdin_path(config, &request.session_id))?;
    touch(&control_path(config, &request.session_id))?;
    Ok(())
}

pub fn read_request(config: &PigeonConfig, session_id: &str) -> Result<RequestRecord> {
    read_json(&request_path(config, session_id))
}

pub fn read_status(config: &PigeonConfig, session_id: &str) -> Result<StatusRecord> {
    read_json(&status_path(config, session_id))
}

/// Applies `mutate` to the current status record and writes it back
/// atomically. `mutate` is expected to set `state`/`updated_at` (and any
/// other fields it needs) on the record it is handed; fields it does not
/// touch, including unrecognized ones stashed in `extra`, survive the
/// round trip unchanged.
pub fn update_status(
    config: &PigeonConfig,
    session_id: &str,
    mutate: impl FnOnce(&mut StatusRecord),
) -> Result<StatusRecord> {
    let path = status_path(config, session_id);
    let mut status: StatusRecord = read_json(&path)?;
    let prior_state = status.state;
    mutate(&mut status);

    if prior_state.is_terminal() && status.state != prior_state {
        bail!(
            "session {session_id}: refusing to transition out of terminal state {prior_state:?}"
        );
    }

    atomic_write_json(&path, &status)?;
    Ok(status)
}

pub fn claim_exists(config: &PigeonConfig, session_id: &str) -> bool {
    claim_path(config, session_id).exists()
}

/// Lists session ids present under `sessions_dir`, sorted ascending by
/// directory name (which sorts chronologically since session ids are
/// millisecond-prefixed).
pub fn list_session_ids(config: &PigeonConfig) -> Result<Vec<String>> {
    let dir = config.sessions_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids: Vec<String> = std::fs::read_dir(&dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    ids.sort();
    Ok(ids)
}

pub fn session_exists(config: &PigeonConfig, session_id: &str) -> bool {
    session_dir(config, session_id).is_dir()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RequesterInfo, SessionState, TerminalInfo};
    use crate::time::utc_iso_now;
    use tempfile::TempDir;

    fn sample_request(session_id: &str, cwd: &str) -> RequestRecord {
        RequestRecord {
            session_id: session_id.into(),
            command: vec!["bash".into(), "-c".into(), "echo hi".into()],
            cwd: cwd.into(),
            route: None,
            created_at: utc_iso_now(),
            requester: RequesterInfo {
                host: "h".into(),
                pid: 1,
                user: "u".into(),
            },
            env: Default::default(),
            unset_env: Vec::new(),
            terminal: TerminalInfo {
                stdin_isatty: false,
                stdout_isatty: false,
                size: None,
            },
        }
    }

    #[test]
    fn create_session_writes_all_expected_files() {
        let dir = TempDir::new().unwrap();
        let config = PigeonConfig::new(dir.path(), "ns");
        config.ensure_dirs().unwrap();
        let req = sample_request("1-aaaaaaaaaaaa", "/tmp");
        let status = StatusRecord::pending(req.session_id.clone(), req.created_at.clone());

        create_session(&config, &req, &status).unwrap();

        let sdir = session_dir(&config, &req.session_id);
        assert!(sdir.join("request.json").is_file());
        assert!(sdir.join("status.json").is_file());
        assert!(sdir.join("stream.jsonl").is_file());
        assert!(sdir.join("stdin.jsonl").is_file());
        assert!(sdir.join("control.jsonl").is_file());
    }

    #[test]
    fn create_session_fails_if_already_exists() {
        let dir = TempDir::new().unwrap();
        let config = PigeonConfig::new(dir.path(), "ns");
        config.ensure_dirs().unwrap();
        let req = sample_request("1-aaaaaaaaaaaa", "/tmp");
        let status = StatusRecord::pending(req.session_id.clone(), req.created_at.clone());

        create_session(&config, &req, &status).unwrap();
        let err = create_session(&config, &req, &status).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn update_status_preserves_unknown_fields_and_bumps_state() {
        let dir = TempDir::new().unwrap();
        let config = PigeonConfig::new(dir.path(), "ns");
        config.ensure_dirs().unwrap();
        let req = sample_request("1-aaaaaaaaaaaa", "/tmp");
        let status = StatusRecord::pending(req.session_id.clone(), req.created_at.clone());
        create_session(&config, &req, &status).unwrap();

        update_status(&config, &req.session_id, |s| {
            s.extra.insert("custom".into(), serde_json::json!(true));
            s.state = SessionState::Running;
            s.updated_at = utc_iso_now();
        })
        .unwrap();

        let reloaded = read_status(&config, &req.session_id).unwrap();
        assert_eq!(reloaded.state, SessionState::Running);
        assert_eq!(reloaded.extra.get("custom").unwrap(), &serde_json::json!(true));
    }

    #[test]
    fn update_status_refuses_to_leave_terminal_state() {
        let dir = TempDir::new().unwrap();
        let config = PigeonConfig::new(dir.path(), "ns");
        config.ensure_dirs().unwrap();
        let req = sample_request("1-aaaaaaaaaaaa", "/tmp");
        let status = StatusRecord::pending(req.session_id.clone(), req.created_at.clone());
        create_session(&config, &req, &status).unwrap();

        update_status(&config, &req.session_id, |s| {
            s.state = SessionState::Succeeded;
            s.exit_code = Some(0);
        })
        .unwrap();

        let result = update_status(&config, &req.session_id, |s| {
            s.state = SessionState::Running;
        });
        assert!(result.is_err());
    }

    #[test]
    fn try_claim_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let config = PigeonConfig::new(dir.path(), "ns");
        config.ensure_dirs().unwrap();
        let req = sample_request("1-aaaaaaaaaaaa", "/tmp");
        let status = StatusRecord::pending(req.session_id.clone(), req.created_at.clone());
        create_session(&config, &req, &status).unwrap();

        assert!(try_claim(&config, &req.session_id, "host-a", 1).unwrap());
        assert!(!try_claim(&config, &req.session_id, "host-b", 2).unwrap());
        assert!(claim_exists(&config, &req.session_id));

        let body = std::fs::read_to_string(claim_path(&config, &req.session_id)).unwrap();
        assert!(body.contains("worker_host=host-a"));
    }

    #[test]
    fn list_session_ids_sorted_ascending() {
        let dir = TempDir::new().unwrap();
        let config = PigeonConfig::new(dir.path(), "ns");
        config.ensure_dirs().unwrap();
        for id in ["2-bbbbbbbbbbbb", "1-aaaaaaaaaaaa", "3-cccccccccccc"] {
            let req = sample_request(id, "/tmp");
            let status = StatusRecord::pending(req.session_id.clone(), req.created_at.clone());
            create_session(&config, &req, &status).unwrap();
        }
        let ids = list_session_ids(&config).unwrap();
        assert_eq!(ids, vec!["1-aaaaaaaaaaaa", "2-bbbbbbbbbbbb", "3-cccccccccccc"]);
    }
}
