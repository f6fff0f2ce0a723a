//! Session runner: claims a session, spawns its command behind a PTY (or a
//! pipe triple when no PTY is available), and forwards stdin/control/output
//! between the cache directory and the child until it exits.
//!
//! Mirrors `tty_spawn.rs`'s fork/`execvp`/`communication_loop` shape,
//! generalized from a locally-attached terminal to the session's three
//! JSONL files.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use nix::errno::Errno;
use nix::libc::{TIOCGWINSZ, TIOCSWINSZ};
use nix::pty::{openpty, Winsize};
use nix::sys::select::{select, FdSet};
use nix::sys::signal::{killpg, Signal};
use nix::sys::time::TimeVal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, dup2, execvp, fork, pipe, read, setsid, write, ForkResult, Pid};

use crate::codec::{decode_bytes, encode_bytes, tail_jsonl};
use crate::lock::CwdLock;
use crate::model::{Channel, ControlRecord, EventRecord, RequestRecord, StdinRecord, StreamRecord, WorkerRef};
use crate::paths::{control_path, cwd_lock_path, stdin_path, stream_path, PigeonConfig};
use crate::store;
use crate::time::{now_ts, utc_iso_now};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const READ_CHUNK: usize = 4096;

/// Entry point submitted by the scheduler onto its thread pool. Never
/// returns an error that would be worth surfacing to the scheduler: any
/// failure from step 2 onward is recorded as `worker_error` plus a
/// `failed` status, and the function returns `Ok(())`.
pub fn run_session(config: &PigeonConfig, session_id: &str, worker_host: &str, worker_pid: i32) -> Result<()> {
    if let Err(err) = run_session_inner(config, session_id, worker_host, worker_pid) {
        tracing::warn!(session_id, error = %err, "session failed");
        let _ = append_stream_event(
            config,
            session_id,
            EventRecord::WorkerError {
                ts: now_ts(),
                message: format!("{err:#}"),
            },
        );
        let _ = store::update_status(config, session_id, |status| {
            status.state = crate::model::SessionState::Failed;
            status.updated_at = utc_iso_now();
            status.finished_at = Some(utc_iso_now());
            status.exit_code = Some(1);
            status.error = Some(err.to_string());
        });
    }
    Ok(())
}

fn run_session_inner(config: &PigeonConfig, session_id: &str, worker_host: &str, worker_pid: i32) -> Result<()> {
    let lock_guard;
    let request = store::read_request(config, session_id).context("reading request.json")?;
    if request.command.is_empty() {
        bail!("request command is empty");
    }
    if request.cwd.is_empty() {
        bail!("request cwd is empty");
    }
    lock_guard = CwdLock::acquire(&cwd_lock_path(config, &request.cwd)).context("acquiring cwd lock")?;

    let env = build_env(&request);

    store::update_status(config, session_id, |status| {
        status.state = crate::model::SessionState::Running;
        status.updated_at = utc_iso_now();
        status.started_at = Some(utc_iso_now());
        status.worker = Some(WorkerRef {
            host: worker_host.to_string(),
            pid: worker_pid,
        });
        status.exit_code = None;
    })?;
    append_stream_event(config, session_id, EventRecord::Started { ts: now_ts() })?;

    let (mut io, child) = spawn_child(config, session_id, &request, &env)?;

    let raw_exit = forward_loop(config, session_id, io.as_mut(), child)?;
    drop(lock_guard);

    let exit_code = if raw_exit >= 0 { raw_exit } else { 128 + raw_exit.abs() };
    append_stream_event(
        config,
        session_id,
        EventRecord::Exit {
            ts: now_ts(),
            exit_code,
            raw_return_code: raw_exit,
        },
    )?;

    store::update_status(config, session_id, |status| {
        status.state = if exit_code == 0 {
            crate::model::SessionState::Succeeded
        } else {
            crate::model::SessionState::Failed
        };
        status.updated_at = utc_iso_now();
        status.finished_at = Some(utc_iso_now());
        status.exit_code = Some(exit_code);
    })?;

    Ok(())
}

fn build_env(request: &RequestRecord) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = std::env::vars().collect();
    for (key, value) in &request.env {
        env.insert(key.clone(), value.clone());
    }
    for key in &request.unset_env {
        env.remove(key);
    }
    env
}

/// Replaces `-ic`-style combined short flags with their non-interactive
/// form (`-c`), preserving every other flag cluster untouched. Applied only
/// when the PTY is unavailable, since an interactive shell is unusable
/// without one.
fn downgrade_interactive_flags(argv: &mut [String]) {
    for token in argv.iter_mut() {
        let Some(rest) = token.strip_prefix('-') else { continue };
        if rest.is_empty() || rest.starts_with('-') {
            continue;
        }
        if !rest.chars().all(|c| c.is_ascii_alphabetic()) || !rest.contains('i') {
            continue;
        }
        let downgraded: String = rest.chars().filter(|&c| c != 'i').collect();
        if !downgraded.is_empty() {
            *token = format!("-{downgraded}");
        }
    }
}

/// Abstracts over a PTY master fd and a three-pipe fallback so the forward
/// loop doesn't need to know which one it is driving.
trait TerminalIo {
    fn write_stdin(&self, data: &[u8]) -> Result<()>;
    fn send_eof(&mut self) -> Result<()>;
    fn resize(&self, cols: u32, rows: u32) -> Result<()>;
    /// Waits up to `timeout` for output; returns `None` on timeout, `Some((channel,
    /// bytes))` with an empty `bytes` vec meaning that side reached EOF.
    fn read_output(&mut self, timeout: Duration) -> Result<Option<(Channel, Vec<u8>)>>;
    fn is_eof(&self) -> bool;
}

struct PtyIo {
    master: OwnedFd,
    eof: bool,
}

impl TerminalIo for PtyIo {
    fn write_stdin(&self, data: &[u8]) -> Result<()> {
        write_all(self.master.as_fd(), data)
    }

    fn send_eof(&mut self) -> Result<()> {
        // 0x04 is EOT/Ctrl-D; the pty line discipline treats it as EOF when
        // the slave is in canonical mode.
        write(self.master.as_fd(), &[0x04]).map(|_| ()).or_else(|e| {
            if e == Errno::EIO {
                Ok(())
            } else {
                Err(e.into())
            }
        })
    }

    fn resize(&self, cols: u32, rows: u32) -> Result<()> {
        let winsize = Winsize {
            ws_row: rows.max(1) as u16,
            ws_col: cols.max(1) as u16,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        nix::ioctl_write_ptr_bad!(set_window_size, TIOCSWINSZ, Winsize);
        unsafe { set_window_size(self.master.as_raw_fd(), &winsize) }
            .map(|_| ())
            .context("TIOCSWINSZ")
    }

    fn read_output(&mut self, timeout: Duration) -> Result<Option<(Channel, Vec<u8>)>> {
        if self.eof {
            return Ok(None);
        }
        let mut fds = FdSet::new();
        fds.insert(self.master.as_fd());
        let mut tv = duration_to_timeval(timeout);
        match select(None, Some(&mut fds), None, None, Some(&mut tv)) {
            Ok(0) => Ok(None),
            Err(Errno::EINTR | Errno::EAGAIN) => Ok(None),
            Err(err) => Err(err.into()),
            Ok(_) => {
                let mut buf = [0u8; READ_CHUNK];
                match read(&self.master, &mut buf) {
                    Ok(0) => {
                        self.eof = true;
                        Ok(Some((Channel::Pty, Vec::new())))
                    }
                    Ok(n) => Ok(Some((Channel::Pty, buf[..n].to_vec()))),
                    Err(Errno::EIO) => {
                        self.eof = true;
                        Ok(Some((Channel::Pty, Vec::new())))
                    }
                    Err(Errno::EAGAIN | Errno::EINTR) => Ok(None),
                    Err(err) => Err(err.into()),
                }
            }
        }
    }

    fn is_eof(&self) -> bool {
        self.eof
    }
}

struct PipesIo {
    stdin_w: Option<OwnedFd>,
    stdout_r: OwnedFd,
    stderr_r: OwnedFd,
    stdout_eof: bool,
    stderr_eof: bool,
}

impl TerminalIo for PipesIo {
    fn write_stdin(&self, data: &[u8]) -> Result<()> {
        let Some(stdin_w) = &self.stdin_w else {
            return Ok(());
        };
        write_all(stdin_w.as_fd(), data)
    }

    fn send_eof(&mut self) -> Result<()> {
        // Closing our write end delivers EOF to the child's stdin read.
        // `take()` makes repeated calls idempotent: the fd is dropped (and
        // thus closed) exactly once.
        self.stdin_w.take();
        Ok(())
    }

    fn resize(&self, _cols: u32, _rows: u32) -> Result<()> {
        Ok(())
    }

    fn read_output(&mut self, timeout: Duration) -> Result<Option<(Channel, Vec<u8>)>> {
        if self.stdout_eof && self.stderr_eof {
            return Ok(None);
        }
        let mut fds = FdSet::new();
        if !self.stdout_eof {
            fds.insert(self.stdout_r.as_fd());
        }
        if !self.stderr_eof {
            fds.insert(self.stderr_r.as_fd());
        }
        let mut tv = duration_to_timeval(timeout);
        match select(None, Some(&mut fds), None, None, Some(&mut tv)) {
            Ok(0) => Ok(None),
            Err(Errno::EINTR | Errno::EAGAIN) => Ok(None),
            Err(err) => Err(err.into()),
            Ok(_) => {
                if !self.stdout_eof && fds.contains(self.stdout_r.as_fd()) {
                    let mut buf = [0u8; READ_CHUNK];
                    match read(&self.stdout_r, &mut buf) {
                        Ok(0) => {
                            self.stdout_eof = true;
                            return Ok(Some((Channel::Stdout, Vec::new())));
                        }
                        Ok(n) => return Ok(Some((Channel::Stdout, buf[..n].to_vec()))),
                        Err(Errno::EAGAIN | Errno::EINTR) => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                if !self.stderr_eof && fds.contains(self.stderr_r.as_fd()) {
                    let mut buf = [0u8; READ_CHUNK];
                    match read(&self.stderr_r, &mut buf) {
                        Ok(0) => {
                            self.stderr_eof = true;
                            return Ok(Some((Channel::Stderr, Vec::new())));
                        }
                        Ok(n) => return Ok(Some((Channel::Stderr, buf[..n].to_vec()))),
                        Err(Errno::EAGAIN | Errno::EINTR) => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                Ok(None)
            }
        }
    }

    fn is_eof(&self) -> bool {
        self.stdout_eof && self.stderr_eof
    }
}

fn duration_to_timeval(d: Duration) -> TimeVal {
    TimeVal::new(d.as_secs() as i64, d.subsec_micros() as i64)
}

fn write_all(fd: BorrowedFd, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        match write(fd, buf) {
            Ok(0) => break,
            Ok(n) => buf = &buf[n..],
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn argv_to_cstrings(argv: &[String]) -> Result<Vec<CString>> {
    argv.iter()
        .map(|s| CString::new(s.as_bytes()).map_err(|_| anyhow!("argv element contains a NUL byte")))
        .collect()
}

/// Makes the slave fd the calling process's controlling terminal and binds
/// it to stdin/stdout/stderr. Only called in the forked child.
fn enter_pty_slave(slave_fd: RawFd) -> Result<()> {
    setsid().ok();
    #[cfg(target_os = "linux")]
    {
        const TIOCSCTTY: u64 = 0x540E;
        unsafe {
            if nix::libc::ioctl(slave_fd, TIOCSCTTY as nix::libc::c_ulong, 0) == -1 {
                nix::libc::ioctl(slave_fd, TIOCSCTTY as nix::libc::c_ulong, 1);
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    unsafe {
        nix::libc::ioctl(slave_fd, nix::libc::TIOCSCTTY as nix::libc::c_ulong, 0);
    }
    unsafe {
        nix::libc::dup2(slave_fd, 0);
        nix::libc::dup2(slave_fd, 1);
        nix::libc::dup2(slave_fd, 2);
    }
    if slave_fd > 2 {
        let _ = close(slave_fd);
    }
    Ok(())
}

fn exec_child(request: &RequestRecord, env: &BTreeMap<String, String>) -> ! {
    std::env::set_current_dir(&request.cwd).ok();
    for (key, _) in std::env::vars() {
        if !env.contains_key(&key) {
            std::env::remove_var(key);
        }
    }
    for (key, value) in env {
        std::env::set_var(key, value);
    }
    let args = match argv_to_cstrings(&request.command) {
        Ok(a) => a,
        Err(_) => std::process::exit(127),
    };
    let _ = execvp(&args[0], &args);
    std::process::exit(127)
}

fn spawn_child(
    config: &PigeonConfig,
    session_id: &str,
    request: &RequestRecord,
    env: &BTreeMap<String, String>,
) -> Result<(Box<dyn TerminalIo>, Pid)> {
    let winsize = request.terminal.size.as_ref().map(|size| Winsize {
        ws_row: size.rows.max(1) as u16,
        ws_col: size.cols.max(1) as u16,
        ws_xpixel: 0,
        ws_ypixel: 0,
    });

    match openpty(&winsize, None) {
        Ok(pty) => {
            let slave_fd = pty.slave.as_raw_fd();
            match unsafe { fork() }.context("fork for pty child")? {
                ForkResult::Child => {
                    drop(pty.master);
                    let _ = enter_pty_slave(slave_fd);
                    exec_child(request, env);
                }
                ForkResult::Parent { child } => {
                    drop(pty.slave);
                    Ok((Box::new(PtyIo { master: pty.master, eof: false }), child))
                }
            }
        }
        Err(err) => {
            tracing::warn!(session_id, error = %err, "pty unavailable, falling back to pipes");
            append_stream_event(config, session_id, EventRecord::PtyFallbackToPipes { ts: now_ts() })?;
            let mut command = request.command.clone();
            downgrade_interactive_flags(&mut command);
            let mut request_for_pipes = request.clone();
            request_for_pipes.command = command;
            spawn_child_with_pipes(&request_for_pipes, env)
        }
    }
}

fn spawn_child_with_pipes(
    request: &RequestRecord,
    env: &BTreeMap<String, String>,
) -> Result<(Box<dyn TerminalIo>, Pid)> {
    let (stdin_r, stdin_w) = pipe().context("creating stdin pipe")?;
    let (stdout_r, stdout_w) = pipe().context("creating stdout pipe")?;
    let (stderr_r, stderr_w) = pipe().context("creating stderr pipe")?;

    match unsafe { fork() }.context("fork for pipe child")? {
        ForkResult::Child => {
            drop(stdin_w);
            drop(stdout_r);
            drop(stderr_r);
            // dup2 onto the standard fds, then forget the borrowed OwnedFd
            // handles so they aren't closed out from under the process.
            let mut fd0 = unsafe { OwnedFd::from_raw_fd(0) };
            let mut fd1 = unsafe { OwnedFd::from_raw_fd(1) };
            let mut fd2 = unsafe { OwnedFd::from_raw_fd(2) };
            let _ = dup2(&stdin_r, &mut fd0);
            let _ = dup2(&stdout_w, &mut fd1);
            let _ = dup2(&stderr_w, &mut fd2);
            std::mem::forget(fd0);
            std::mem::forget(fd1);
            std::mem::forget(fd2);
            setsid().ok();
            exec_child(request, env);
        }
        ForkResult::Parent { child } => {
            drop(stdin_r);
            drop(stdout_w);
            drop(stderr_w);
            Ok((
                Box::new(PipesIo {
                    stdin_w: Some(stdin_w),
                    stdout_r,
                    stderr_r,
                    stdout_eof: false,
                    stderr_eof: false,
                }),
                child,
            ))
        }
    }
}

fn append_stream_event(config: &PigeonConfig, session_id: &str, event: EventRecord) -> Result<()> {
    crate::codec::append_jsonl(&stream_path(config, session_id), &StreamRecord::Event(event))
}

fn forward_loop(config: &PigeonConfig, session_id: &str, io: &mut dyn TerminalIo, child: Pid) -> Result<i32> {
    let stream = stream_path(config, session_id);
    let stdin_log = stdin_path(config, session_id);
    let control_log = control_path(config, session_id);

    let mut stdin_offset = 0u64;
    let mut control_offset = 0u64;
    let mut seq: u64 = 0;
    let mut child_exited: Option<i32> = None;

    loop {
        let (new_offset, records) = tail_jsonl(&stdin_log, stdin_offset)?;
        stdin_offset = new_offset;
        for value in records {
            if let Ok(record) = serde_json::from_value::<StdinRecord>(value) {
                match record {
                    StdinRecord::Stdin { data_b64, .. } => {
                        if let Ok(bytes) = decode_bytes(&data_b64) {
                            io.write_stdin(&bytes)?;
                        }
                    }
                    StdinRecord::StdinEof { .. } => io.send_eof()?,
                }
            }
        }

        let (new_offset, records) = tail_jsonl(&control_log, control_offset)?;
        control_offset = new_offset;
        for value in records {
            if let Ok(record) = serde_json::from_value::<ControlRecord>(value) {
                match record {
                    ControlRecord::Signal { signal, .. } => {
                        if let Ok(sig) = Signal::try_from(signal) {
                            let _ = killpg(child, sig);
                        }
                    }
                    ControlRecord::Resize { cols, rows, .. } => {
                        io.resize(cols, rows)?;
                    }
                }
            }
        }

        if let Some((channel, bytes)) = io.read_output(POLL_INTERVAL)? {
            if !bytes.is_empty() {
                crate::codec::append_jsonl(
                    &stream,
                    &StreamRecord::Output {
                        seq,
                        ts: now_ts(),
                        channel,
                        data_b64: encode_bytes(&bytes),
                    },
                )?;
                seq += 1;
            }
        }

        if child_exited.is_none() {
            match waitpid(child, Some(nix::sys::wait::WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, status)) => child_exited = Some(status),
                Ok(WaitStatus::Signaled(_, signal, _)) => child_exited = Some(-(signal as i32)),
                _ => {}
            }
        }

        if child_exited.is_some() && io.is_eof() {
            return Ok(child_exited.unwrap());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipes_io_send_eof_closes_write_end_and_is_idempotent() {
        let (stdin_r, stdin_w) = pipe().unwrap();
        let (stdout_r, stdout_w) = pipe().unwrap();
        let (stderr_r, stderr_w) = pipe().unwrap();
        let mut io = PipesIo {
            stdin_w: Some(stdin_w),
            stdout_r,
            stderr_r,
            stdout_eof: false,
            stderr_eof: false,
        };
        drop(stdout_w);
        drop(stderr_w);

        io.send_eof().unwrap();
        assert!(io.stdin_w.is_none());

        let mut buf = [0u8; 8];
        assert_eq!(read(&stdin_r, &mut buf).unwrap(), 0);

        io.send_eof().unwrap();
        assert!(io.stdin_w.is_none());
    }

    #[test]
    fn downgrade_interactive_flags_strips_i_from_clusters() {
        let mut argv = vec!["bash".to_string(), "-ic".to_string(), "echo hi".to_string()];
        downgrade_interactive_flags(&mut argv);
        assert_eq!(argv[1], "-c");
    }

    #[test]
    fn downgrade_interactive_flags_handles_ilc() {
        let mut argv = vec!["bash".to_string(), "-ilc".to_string(), "echo hi".to_string()];
        downgrade_interactive_flags(&mut argv);
        assert_eq!(argv[1], "-lc");
    }

    #[test]
    fn downgrade_interactive_flags_preserves_non_interactive_tokens() {
        let mut argv = vec!["bash".to_string(), "-c".to_string(), "echo hi".to_string()];
        downgrade_interactive_flags(&mut argv);
        assert_eq!(argv[1], "-c");
        assert_eq!(argv[2], "echo hi");
    }

    #[test]
    fn downgrade_interactive_flags_ignores_long_options() {
        let mut argv = vec!["prog".to_string(), "--interactive".to_string()];
        downgrade_interactive_flags(&mut argv);
        assert_eq!(argv[1], "--interactive");
    }

    #[test]
    fn build_env_overlays_and_unsets() {
        std::env::set_var("PIGEON_TEST_RUNNER_KEEP", "1");
        std::env::set_var("PIGEON_TEST_RUNNER_DROP", "1");
        let request = RequestRecord {
            session_id: "s".into(),
            command: vec!["true".into()],
            cwd: "/tmp".into(),
            route: None,
            created_at: utc_iso_now(),
            requester: crate::model::RequesterInfo {
                host: "h".into(),
                pid: 1,
                user: "u".into(),
            },
            env: BTreeMap::from([("PIGEON_TEST_RUNNER_OVERRIDE".to_string(), "2".to_string())]),
            unset_env: vec!["PIGEON_TEST_RUNNER_DROP".to_string()],
            terminal: crate::model::TerminalInfo {
                stdin_isatty: false,
                stdout_isatty: false,
                size: None,
            },
        };
        let env = build_env(&request);
        assert_eq!(env.get("PIGEON_TEST_RUNNER_KEEP").map(String::as_str), Some("1"));
        assert_eq!(env.get("PIGEON_TEST_RUNNER_OVERRIDE").map(String::as_str), Some("2"));
        assert!(!env.contains_key("PIGEON_TEST_RUNNER_DROP"));
        std::env::remove_var("PIGEON_TEST_RUNNER_KEEP");
        std::env::remove_var("PIGEON_TEST_RUNNER_DROP");
    }
}
