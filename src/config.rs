//! Configuration view: merges CLI flags, environment variables, and an
//! optional TOML file into the resolved value set the core consumes.
//!
//! Precedence, highest first: CLI flags, environment variables, config
//! file, built-in defaults. Mirrors `pigeon/config.py`'s `FileConfig` shape,
//! but leans on `serde`'s own type validation instead of hand-rolled
//! `_ensure_*` checks — a malformed `worker.max_jobs` already fails to
//! deserialize with a path-qualified message from the `toml` crate.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_WORKER_MAX_JOBS: u32 = 4;
const DEFAULT_WORKER_POLL_INTERVAL: f64 = 0.05;
const DEFAULT_INTERACTIVE_COMMAND: &str = "bash --noprofile --norc -i";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    cache: Option<String>,
    namespace: Option<String>,
    route: Option<String>,
    user: Option<String>,
    #[serde(default)]
    worker: WorkerFileConfig,
    #[serde(default)]
    remote_env: BTreeMap<String, String>,
    interactive_command: Option<String>,
    source_bashrc: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkerFileConfig {
    max_jobs: Option<u32>,
    poll_interval: Option<f64>,
    debug: Option<bool>,
    route: Option<String>,
}

/// CLI-supplied overrides. Every field is optional; an absent field falls
/// through to the environment, then the file, then a default.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub cache: Option<String>,
    pub namespace: Option<String>,
    pub request_route: Option<String>,
    pub worker_route: Option<String>,
    pub wait_worker: Option<f64>,
    pub worker_max_jobs: Option<u32>,
    pub worker_poll_interval: Option<f64>,
    pub verbose: bool,
    pub config_path: Option<String>,
}

/// The fully resolved configuration view the core consumes, read-only past
/// construction.
#[derive(Debug, Clone)]
pub struct PigeonOptions {
    pub cache_root: PathBuf,
    pub namespace: String,
    pub requester_user: String,
    pub request_route: Option<String>,
    pub worker_route: Option<String>,
    pub remote_env: BTreeMap<String, String>,
    pub worker_max_jobs: u32,
    pub worker_poll_interval: f64,
    pub worker_debug: bool,
    pub interactive_command: String,
    pub interactive_source_bashrc: bool,
    pub wait_worker: f64,
    pub verbose: bool,
}

/// `explicit` > `PIGEON_CONFIG` > `./.pigeon.toml` > `./pigeon.toml` > none.
fn discover_config_path(explicit: Option<&str>) -> Option<PathBuf> {
    if let Some(explicit) = explicit {
        return Some(PathBuf::from(explicit));
    }
    if let Ok(by_env) = std::env::var("PIGEON_CONFIG") {
        if !by_env.is_empty() {
            return Some(PathBuf::from(by_env));
        }
    }
    let cwd = std::env::current_dir().ok()?;
    for name in [".pigeon.toml", "pigeon.toml"] {
        let candidate = cwd.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("config file not found: {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("{}: invalid config", path.display()))
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_f64(name: &str) -> Option<f64> {
    env_non_empty(name).and_then(|v| v.parse().ok())
}

impl PigeonOptions {
    /// Resolves the configuration view from `overrides`, the process
    /// environment, and an optional TOML file, in that precedence order.
    pub fn load(overrides: &CliOverrides) -> Result<Self> {
        let config_path = discover_config_path(overrides.config_path.as_deref());
        let file = match &config_path {
            Some(path) => load_file_config(path)?,
            None => FileConfig::default(),
        };

        let cache_root = overrides
            .cache
            .clone()
            .or_else(|| env_non_empty("PIGEON_CACHE"))
            .or(file.cache)
            .context("no cache root configured (set --cache, PIGEON_CACHE, or `cache` in the config file)")?;

        let namespace = overrides
            .namespace
            .clone()
            .or_else(|| env_non_empty("PIGEON_NAMESPACE"))
            .or(file.namespace)
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        let requester_user = env_non_empty("USER")
            .or(file.user)
            .unwrap_or_else(|| "unknown".to_string());

        let request_route = overrides
            .request_route
            .clone()
            .or_else(|| env_non_empty("PIGEON_ROUTE"))
            .or(file.route);

        let worker_route = overrides
            .worker_route
            .clone()
            .or_else(|| env_non_empty("PIGEON_WORKER_ROUTE"))
            .or(file.worker.route);

        let worker_max_jobs = overrides
            .worker_max_jobs
            .or(file.worker.max_jobs)
            .unwrap_or(DEFAULT_WORKER_MAX_JOBS);

        let worker_poll_interval = overrides
            .worker_poll_interval
            .or(file.worker.poll_interval)
            .unwrap_or(DEFAULT_WORKER_POLL_INTERVAL);

        let worker_debug = env_non_empty("PIGEON_DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .or(file.worker.debug)
            .unwrap_or(false);

        let wait_worker = overrides
            .wait_worker
            .or_else(|| env_f64("PIGEON_WAIT_WORKER"))
            .unwrap_or(3.0)
            .max(0.0);

        let interactive_command = env_non_empty("PIGEON_INTERACTIVE_COMMAND")
            .or(file.interactive_command)
            .unwrap_or_else(|| DEFAULT_INTERACTIVE_COMMAND.to_string());

        let interactive_source_bashrc = env_non_empty("PIGEON_SOURCE_BASHRC")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .or(file.source_bashrc)
            .unwrap_or(false);

        let config_label = config_path
            .as_deref()
            .map_or_else(|| "<config>".to_string(), |p| p.display().to_string());
        if worker_max_jobs < 1 {
            anyhow::bail!("{config_label}: 'worker.max_jobs' must be > 0");
        }
        if worker_poll_interval <= 0.0 {
            anyhow::bail!("{config_label}: 'worker.poll_interval' must be > 0");
        }

        Ok(Self {
            cache_root: PathBuf::from(cache_root),
            namespace,
            requester_user,
            request_route,
            worker_route,
            remote_env: file.remote_env,
            worker_max_jobs,
            worker_poll_interval,
            worker_debug,
            interactive_command,
            interactive_source_bashrc,
            wait_worker,
            verbose: overrides.verbose,
        })
    }
}
