//! Worker scheduler: heartbeat loop, pending-session discovery with route
//! matching, bounded concurrent runner pool, graceful shutdown.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use signal_hook::consts::{SIGINT, SIGTERM};

use crate::config::{CliOverrides, PigeonOptions};
use crate::ids::host_name;
use crate::model::HeartbeatRecord;
use crate::paths::PigeonConfig;
use crate::registry::{remove_heartbeat, worker_id, write_heartbeat, HEARTBEAT_INTERVAL_SECS};
use crate::runner;
use crate::store;
use crate::time::{now_ts, utc_iso_now};

/// One in-flight session runner, tracked so the scheduler can reap it once
/// its thread finishes without blocking on it.
struct InFlight {
    session_id: String,
    handle: std::thread::JoinHandle<()>,
}

/// Starts the worker loop and blocks until SIGINT/SIGTERM. Runs to
/// completion: in-flight sessions are not cancelled, only allowed to
/// finish, per the shutdown contract.
pub fn run_worker(overrides: &CliOverrides) -> Result<()> {
    let mut options = PigeonOptions::load(overrides)?;
    let config = PigeonConfig::new(&options.cache_root, &options.namespace);
    config.ensure_dirs()?;

    let host = host_name();
    let pid = std::process::id() as i32;
    let id = worker_id(&host, pid);

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&stop))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&stop))?;

    let started_at = utc_iso_now();
    write_worker_heartbeat(&config, &id, &host, pid, &started_at, options.worker_route.as_deref())?;

    let mut last_heartbeat = Instant::now();
    let mut last_config_reload = Instant::now();
    let mut logged_reload_failures: HashSet<String> = HashSet::new();
    let mut in_flight: Vec<InFlight> = Vec::new();

    tracing::info!(worker_id = %id, route = ?options.worker_route, "worker started");

    while !stop.load(Ordering::SeqCst) {
        if last_config_reload.elapsed() >= Duration::from_secs(1) {
            last_config_reload = Instant::now();
            match PigeonOptions::load(overrides) {
                Ok(reloaded) => {
                    let route_changed = reloaded.worker_route != options.worker_route;
                    options = reloaded;
                    if route_changed {
                        last_heartbeat = Instant::now() - Duration::from_secs_f64(HEARTBEAT_INTERVAL_SECS);
                    }
                }
                Err(err) => {
                    let message = err.to_string();
                    if logged_reload_failures.insert(message.clone()) {
                        tracing::warn!(error = %message, "config reload failed");
                    }
                }
            }
        }

        if last_heartbeat.elapsed().as_secs_f64() >= HEARTBEAT_INTERVAL_SECS {
            last_heartbeat = Instant::now();
            write_worker_heartbeat(
                &config,
                &id,
                &host,
                pid,
                &started_at,
                options.worker_route.as_deref(),
            )?;
        }

        in_flight.retain(|task| !task.handle.is_finished());

        let mut capacity = (options.worker_max_jobs as usize).saturating_sub(in_flight.len());
        if capacity > 0 {
            if let Ok(ids) = store::list_session_ids(&config) {
                for session_id in ids {
                    if capacity == 0 {
                        break;
                    }
                    if in_flight.iter().any(|t| t.session_id == session_id) {
                        continue;
                    }
                    let Ok(status) = store::read_status(&config, &session_id) else {
                        continue;
                    };
                    if status.state != crate::model::SessionState::Pending {
                        continue;
                    }
                    let Ok(request) = store::read_request(&config, &session_id) else {
                        continue;
                    };
                    if !crate::registry::route_matches(options.worker_route.as_deref(), request.route.as_deref())
                    {
                        continue;
                    }
                    match store::try_claim(&config, &session_id, &host, pid) {
                        Ok(true) => {
                            let config = config.clone();
                            let host = host.clone();
                            let handle = std::thread::spawn(move || {
                                if let Err(err) = runner::run_session(&config, &session_id, &host, pid) {
                                    tracing::error!(session_id = %session_id, error = %err, "runner task failed");
                                }
                            });
                            in_flight.push(InFlight {
                                session_id: request.session_id,
                                handle,
                            });
                            capacity -= 1;
                        }
                        Ok(false) => {}
                        Err(err) => {
                            tracing::warn!(session_id = %session_id, error = %err, "claim attempt failed");
                        }
                    }
                }
            }
        }

        std::thread::sleep(Duration::from_secs_f64(options.worker_poll_interval.max(0.01)));
    }

    tracing::info!(worker_id = %id, "worker shutting down, waiting for in-flight sessions");
    for task in in_flight {
        let _ = task.handle.join();
    }
    remove_heartbeat(&config, &id)?;
    Ok(())
}

fn write_worker_heartbeat(
    config: &PigeonConfig,
    worker_id: &str,
    host: &str,
    pid: i32,
    started_at: &str,
    route: Option<&str>,
) -> Result<()> {
    let now = now_ts();
    let record = HeartbeatRecord {
        worker_id: worker_id.to_string(),
        host: host.to_string(),
        pid,
        route: route.map(str::to_string),
        started_at: started_at.to_string(),
        updated_at: utc_iso_now(),
        updated_ts: now,
    };
    write_heartbeat(config, &record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RequesterInfo, StatusRecord, TerminalInfo};
    use tempfile::TempDir;

    #[test]
    fn write_worker_heartbeat_round_trips() {
        let dir = TempDir::new().unwrap();
        let config = PigeonConfig::new(dir.path(), "ns");
        config.ensure_dirs().unwrap();
        write_worker_heartbeat(&config, "host-1", "host", 1, "2026-01-01T00:00:00.000000Z", None)
            .unwrap();
        let found = crate::registry::discover_active_workers(&config, None, now_ts(), 3.0).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].worker_id, "host-1");
    }

    #[test]
    fn claim_race_is_silent_not_an_error() {
        let dir = TempDir::new().unwrap();
        let config = PigeonConfig::new(dir.path(), "ns");
        config.ensure_dirs().unwrap();
        let req = crate::model::RequestRecord {
            session_id: "1-aaaaaaaaaaaa".into(),
            command: vec!["echo".into(), "hi".into()],
            cwd: "/tmp".into(),
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
        };
        let status = StatusRecord::pending(req.session_id.clone(), req.created_at.clone());
        store::create_session(&config, &req, &status).unwrap();

        assert!(store::try_claim(&config, &req.session_id, "host-a", 1).unwrap());
        assert!(!store::try_claim(&config, &req.session_id, "host-b", 2).unwrap());
    }
}
