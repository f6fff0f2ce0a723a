//! Deterministic on-disk layout for a pigeon cache namespace.
//!
//! Every path the rest of the crate touches is derived here so the layout
//! described in the wire-protocol documentation stays in exactly one place.

use std::path::PathBuf;

use data_encoding::HEXLOWER;
use sha2::{Digest, Sha256};

/// Resolved cache root and namespace. All session, worker and lock paths are
/// derived from this pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PigeonConfig {
    pub cache_root: PathBuf,
    pub namespace: String,
}

impl PigeonConfig {
    pub fn new(cache_root: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
        Self {
            cache_root: cache_root.into(),
            namespace: namespace.into(),
        }
    }

    pub fn ns_root(&self) -> PathBuf {
        self.cache_root.join("namespaces").join(&self.namespace)
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.ns_root().join("sessions")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.ns_root().join("locks")
    }

    pub fn workers_dir(&self) -> PathBuf {
        self.ns_root().join("workers")
    }

    /// Creates the three namespace sub-directories. Idempotent.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.sessions_dir())?;
        std::fs::create_dir_all(self.locks_dir())?;
        std::fs::create_dir_all(self.workers_dir())?;
        Ok(())
    }
}

pub fn session_dir(config: &PigeonConfig, session_id: &str) -> PathBuf {
    config.sessions_dir().join(session_id)
}

pub fn request_path(config: &PigeonConfig, session_id: &str) -> PathBuf {
    session_dir(config, session_id).join("request.json")
}

pub fn status_path(config: &PigeonConfig, session_id: &str) -> PathBuf {
    session_dir(config, session_id).join("status.json")
}

pub fn stream_path(config: &PigeonConfig, session_id: &str) -> PathBuf {
    session_dir(config, session_id).join("stream.jsonl")
}

pub fn stdin_path(config: &PigeonConfig, session_id: &str) -> PathBuf {
    session_dir(config, session_id).join("stdin.jsonl")
}

pub fn control_path(config: &PigeonConfig, session_id: &str) -> PathBuf {
    session_dir(config, session_id).join("control.jsonl")
}

pub fn claim_path(config: &PigeonConfig, session_id: &str) -> PathBuf {
    session_dir(config, session_id).join("worker.claim")
}

pub fn heartbeat_path(config: &PigeonConfig, worker_id: &str) -> PathBuf {
    config
        .workers_dir()
        .join(format!("{}.json", sanitize_worker_id(worker_id)))
}

/// Advisory lock path for a resolved working directory: the lowercase hex
/// SHA-256 digest of its UTF-8 bytes, with a `.lock` suffix.
pub fn cwd_lock_path(config: &PigeonConfig, cwd: &str) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(cwd.as_bytes());
    let digest = HEXLOWER.encode(&hasher.finalize());
    config.locks_dir().join(format!("{digest}.lock"))
}

/// Replaces every character outside `[A-Za-z0-9_.-]` with `_`, so a worker id
/// derived from an arbitrary hostname is always a safe file name.
pub fn sanitize_worker_id(worker_id: &str) -> String {
    worker_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_namespaced() {
        let config = PigeonConfig::new("/cache", "team-a");
        assert_eq!(
            config.sessions_dir(),
            PathBuf::from("/cache/namespaces/team-a/sessions")
        );
        assert_eq!(
            config.locks_dir(),
            PathBuf::from("/cache/namespaces/team-a/locks")
        );
        assert_eq!(
            config.workers_dir(),
            PathBuf::from("/cache/namespaces/team-a/workers")
        );
    }

    #[test]
    fn cwd_lock_path_is_stable_sha256() {
        let config = PigeonConfig::new("/cache", "ns");
        let p1 = cwd_lock_path(&config, "/home/user/project");
        let p2 = cwd_lock_path(&config, "/home/user/project");
        assert_eq!(p1, p2);
        let digest = p1.file_stem().unwrap().to_string_lossy().into_owned();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn cwd_lock_path_differs_per_cwd() {
        let config = PigeonConfig::new("/cache", "ns");
        assert_ne!(
            cwd_lock_path(&config, "/a"),
            cwd_lock_path(&config, "/b")
        );
    }

    #[test]
    fn sanitize_worker_id_replaces_unsafe_chars() {
        assert_eq!(sanitize_worker_id("my host/name:9"), "my_host_name_9");
        assert_eq!(sanitize_worker_id("host-1.local_a"), "host-1.local_a");
    }

    #[test]
    fn session_paths_are_scoped_to_session_dir() {
        let config = PigeonConfig::new("/cache", "ns");
        let dir = session_dir(&config, "abc");
        assert_eq!(request_path(&config, "abc"), dir.join("request.json"));
        assert_eq!(status_path(&config, "abc"), dir.join("status.json"));
        assert_eq!(stream_path(&config, "abc"), dir.join("stream.jsonl"));
        assert_eq!(stdin_path(&config, "abc"), dir.join("stdin.jsonl"));
        assert_eq!(control_path(&config, "abc"), dir.join("control.jsonl"));
        assert_eq!(claim_path(&config, "abc"), dir.join("worker.claim"));
    }
}
