//! The requester side: builds a session request, waits for a worker, pumps
//! stdin, traps SIGINT/SIGWINCH, and drains the output stream until the
//! session reaches a terminal state.

use std::collections::BTreeMap;
use std::io::{IsTerminal, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::libc::{VMIN, VTIME};
use nix::sys::termios::{self, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg, Termios};
use signal_hook::consts::{SIGINT, SIGWINCH};
use signal_hook::iterator::{Handle, Signals};

use crate::codec::{append_jsonl, decode_bytes, encode_bytes, read_json, tail_jsonl};
use crate::config::PigeonOptions;
use crate::error::ExitKind;
use crate::ids::{host_name, new_session_id};
use crate::model::{
    ControlRecord, RequestRecord, RequesterInfo, SessionState, StatusRecord, StdinRecord,
    StreamRecord, TerminalInfo, TerminalSize,
};
use crate::paths::{control_path, status_path, stdin_path, stream_path, PigeonConfig};
use crate::registry::{discover_active_workers, DEFAULT_STALE_AFTER_SECS};
use crate::store;
use crate::time::{now_ts, utc_iso_now};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const DRAIN_TICKS: u32 = 3;

/// Tokens that make a command ambiguous as a plain argv vector: they only
/// mean something to a shell, never to `execvp`.
const AMBIGUOUS_OPERATORS: &[&str] = &["|", "||", ";", "&&", "&", ">", ">>", "<", "<<", "(", ")"];

const SHELLS: &[&str] = &["bash", "/bin/bash", "sh", "/bin/sh", "zsh", "/bin/zsh"];

/// How the caller expressed the command, before normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMode {
    Argv,
    ShellSnippet,
    Interactive,
}

/// Rejects tokens that are only meaningful to a shell in `argv` mode.
pub fn validate_argv(command: &[String]) -> Result<(), ExitKind> {
    for token in command {
        if AMBIGUOUS_OPERATORS.contains(&token.as_str()) {
            return Err(ExitKind::Usage);
        }
    }
    Ok(())
}

fn is_shell_lc(command: &[String]) -> bool {
    command.len() >= 3 && SHELLS.contains(&command[0].as_str()) && command[1] == "-c"
        || (command.len() >= 3 && SHELLS.contains(&command[0].as_str()) && command[1].contains('c') && command[1].starts_with('-'))
}

/// Reads present-and-string values of the terminal-identity environment
/// variables into `env`, and records which of the color-control keys the
/// caller did *not* set into `unset_env` so the worker clears any value it
/// inherited from its own environment.
fn terminal_env_patch(env: &mut BTreeMap<String, String>, unset_env: &mut Vec<String>) {
    const COPIED: &[&str] = &[
        "TERM",
        "COLORTERM",
        "TERM_PROGRAM",
        "TERM_PROGRAM_VERSION",
        "LANG",
        "LC_ALL",
        "LC_CTYPE",
        "LS_COLORS",
        "NO_COLOR",
        "FORCE_COLOR",
    ];
    for key in COPIED {
        if let Ok(value) = std::env::var(key) {
            env.insert((*key).to_string(), value);
        }
    }
    for key in ["NO_COLOR", "FORCE_COLOR"] {
        if !env.contains_key(key) {
            unset_env.push(key.to_string());
        }
    }
}

/// Builds the optional shell prelude: sources `~/.bashrc` when asked, and
/// installs color aliases when color output looks appropriate locally.
fn build_prelude(interactive_source_bashrc: bool) -> String {
    let mut lines = Vec::new();
    if interactive_source_bashrc {
        lines.push(
            "if [ -r ~/.bashrc ]; then . ~/.bashrc >/dev/null 2>&1 || true; fi".to_string(),
        );
    }
    let no_color_unset = std::env::var("NO_COLOR").is_err();
    if no_color_unset && std::io::stdout().is_terminal() {
        lines.push("shopt -s expand_aliases".to_string());
        lines.push("alias ls='ls --color=auto'".to_string());
        lines.push("alias grep='grep --color=auto'".to_string());
        lines.push("alias egrep='egrep --color=auto'".to_string());
        lines.push("alias fgrep='fgrep --color=auto'".to_string());
    }
    if lines.is_empty() {
        String::new()
    } else {
        let mut joined = lines.join("\n");
        joined.push('\n');
        joined
    }
}

fn looks_like_dollar_var(token: &str) -> bool {
    token.starts_with("${") && token.ends_with('}') || token.starts_with('$') && token.len() > 1
}

/// Repairs tokens the caller's local shell may have pre-expanded: if a
/// non-assignment token equals the local value of a name in `remote_env`
/// (or of an inline `NAME=VAL` assignment seen earlier in the same
/// command), rewrite it so the remote shell re-expands it under the
/// overridden environment instead of the caller's already-substituted
/// value.
fn repair_local_expansion(tokens: &[String], remote_env: &BTreeMap<String, String>) -> Vec<String> {
    let mut inline_assignments: BTreeMap<String, String> = BTreeMap::new();
    let mut past_assignments = false;
    let mut out = Vec::with_capacity(tokens.len());

    for token in tokens {
        if !past_assignments {
            if let Some((name, value)) = token.split_once('=') {
                if is_valid_env_name(name) {
                    inline_assignments.insert(name.to_string(), value.to_string());
                    out.push(token.clone());
                    continue;
                }
            }
            past_assignments = true;
        }

        if looks_like_dollar_var(token) {
            out.push(token.clone());
            continue;
        }

        let mut rewritten = None;
        for name in remote_env.keys().chain(inline_assignments.keys()) {
            if let Ok(local_value) = std::env::var(name) {
                if &local_value == token {
                    rewritten = Some(if inline_assignments.contains_key(name) {
                        inline_assignments[name].clone()
                    } else {
                        format!("${name}")
                    });
                    break;
                }
            }
        }

        match rewritten {
            Some(replacement) if replacement.starts_with('$') => out.push(replacement),
            Some(replacement) => out.push(shell_words::quote(&replacement).into_owned()),
            None => out.push(shell_words::quote(token).into_owned()),
        }
    }

    out
}

fn is_valid_env_name(name: &str) -> bool {
    !name.is_empty()
        && name.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Normalizes a caller-supplied command into the argv the worker will
/// actually `execvp`, per the command-mode rules.
pub fn normalize_command(
    mode: CommandMode,
    command: &[String],
    remote_env: &BTreeMap<String, String>,
    options: &PigeonOptions,
) -> Result<Vec<String>, ExitKind> {
    let prelude = build_prelude(options.interactive_source_bashrc);

    match mode {
        CommandMode::Interactive => {
            let base = shell_words::split(&options.interactive_command).map_err(|_| ExitKind::Usage)?;
            if base.is_empty() {
                return Err(ExitKind::Usage);
            }
            if options.interactive_source_bashrc {
                let quoted = shell_words::join(base.iter().map(String::as_str));
                Ok(vec![
                    "bash".into(),
                    "--noprofile".into(),
                    "--norc".into(),
                    "-c".into(),
                    format!(
                        "if [ -r ~/.bashrc ]; then . ~/.bashrc >/dev/null 2>&1 || true; fi\nexec {quoted}"
                    ),
                ])
            } else {
                Ok(base)
            }
        }
        CommandMode::ShellSnippet => {
            if command.is_empty() {
                return Err(ExitKind::Usage);
            }
            let snippet = command.join(" ");
            Ok(vec![
                "bash".into(),
                "--noprofile".into(),
                "--norc".into(),
                "-c".into(),
                format!("{prelude}{snippet}"),
            ])
        }
        CommandMode::Argv => {
            if command.is_empty() {
                return Err(ExitKind::Usage);
            }
            validate_argv(command)?;
            if is_shell_lc(command) {
                return Ok(command.to_vec());
            }
            if command.len() == 1 {
                return Ok(vec![
                    "bash".into(),
                    "--noprofile".into(),
                    "--norc".into(),
                    "-c".into(),
                    format!("{prelude}{}", command[0]),
                ]);
            }
            let rewritten = repair_local_expansion(command, remote_env);
            let joined = rewritten.join(" ");
            Ok(vec![
                "bash".into(),
                "--noprofile".into(),
                "--norc".into(),
                "-c".into(),
                format!("{prelude}{joined}"),
            ])
        }
    }
}

fn read_terminal_size() -> Option<TerminalSize> {
    if !std::io::stdin().is_terminal() {
        return None;
    }
    nix::ioctl_read_bad!(get_winsize, nix::libc::TIOCGWINSZ, nix::pty::Winsize);
    let mut size: nix::pty::Winsize = unsafe { std::mem::zeroed() };
    let fd = std::io::stdin().as_raw_fd();
    if unsafe { get_winsize(fd, &mut size) }.is_err() {
        return None;
    }
    Some(TerminalSize {
        cols: u32::from(size.ws_col),
        rows: u32::from(size.ws_row),
    })
}

fn set_raw_like(attrs: &mut Termios) {
    attrs.input_flags.remove(
        InputFlags::BRKINT | InputFlags::ICRNL | InputFlags::INPCK | InputFlags::ISTRIP | InputFlags::IXON,
    );
    attrs.output_flags.remove(OutputFlags::OPOST);
    attrs.control_flags.insert(ControlFlags::CS8);
    attrs
        .local_flags
        .remove(LocalFlags::ECHO | LocalFlags::ICANON | LocalFlags::IEXTEN);
    attrs.control_chars[VMIN as usize] = 1;
    attrs.control_chars[VTIME as usize] = 0;
}

/// Switches stdin to near-raw mode on construction if it is a TTY, and
/// restores the original attributes on every exit path, including panics.
struct RawModeGuard {
    original: Option<Termios>,
}

impl RawModeGuard {
    fn enter(fd: BorrowedFd<'_>) -> Self {
        if !std::io::stdin().is_terminal() {
            return Self { original: None };
        }
        let Ok(original) = termios::tcgetattr(fd) else {
            return Self { original: None };
        };
        let mut raw = original.clone();
        set_raw_like(&mut raw);
        let _ = termios::tcsetattr(fd, SetArg::TCSAFLUSH, &raw);
        Self {
            original: Some(original),
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Some(original) = &self.original {
            let _ = termios::tcsetattr(std::io::stdin(), SetArg::TCSADRAIN, original);
        }
    }
}

/// Background task appending `stdin`/`stdin_eof` records from local stdin.
struct StdinPump {
    join: Option<std::thread::JoinHandle<()>>,
}

impl StdinPump {
    fn spawn(config: PigeonConfig, session_id: String) -> Self {
        let join = std::thread::spawn(move || {
            let path = stdin_path(&config, &session_id);
            let mut seq: u64 = 0;
            let mut buf = [0u8; 1024];
            let mut stdin = std::io::stdin();
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) => {
                        let _ = append_jsonl(
                            &path,
                            &StdinRecord::StdinEof {
                                seq,
                                ts: now_ts(),
                            },
                        );
                        break;
                    }
                    Ok(n) => {
                        let _ = append_jsonl(
                            &path,
                            &StdinRecord::Stdin {
                                seq,
                                ts: now_ts(),
                                data_b64: encode_bytes(&buf[..n]),
                            },
                        );
                        seq += 1;
                    }
                    Err(_) => std::thread::sleep(POLL_INTERVAL),
                }
            }
        });
        Self { join: Some(join) }
    }
}

impl Drop for StdinPump {
    fn drop(&mut self) {
        // The pump blocks on a read syscall that only returns on EOF or
        // data; nothing to signal here, matching the daemon-thread shape
        // of the original implementation.
        if let Some(join) = self.join.take() {
            drop(join);
        }
    }
}

/// Installs SIGINT/SIGWINCH handling that appends `control.jsonl` records,
/// restoring default disposition when dropped.
struct SignalPump {
    handle: Handle,
    join: Option<std::thread::JoinHandle<()>>,
}

impl SignalPump {
    fn spawn(config: PigeonConfig, session_id: String, seq: Arc<AtomicU64>) -> Result<Self> {
        let mut signals = Signals::new([SIGINT, SIGWINCH])?;
        let handle = signals.handle();
        let path = control_path(&config, &session_id);
        let join = std::thread::spawn(move || {
            for sig in &mut signals {
                let next_seq = seq.fetch_add(1, Ordering::SeqCst);
                let record = match sig {
                    SIGINT => Some(ControlRecord::Signal {
                        seq: next_seq,
                        ts: now_ts(),
                        signal: sig,
                    }),
                    SIGWINCH => read_terminal_size().map(|size| ControlRecord::Resize {
                        seq: next_seq,
                        ts: now_ts(),
                        cols: size.cols,
                        rows: size.rows,
                    }),
                    _ => None,
                };
                if let Some(record) = record {
                    let _ = append_jsonl(&path, &record);
                } else {
                    seq.fetch_sub(1, Ordering::SeqCst);
                }
            }
        });
        Ok(Self {
            handle,
            join: Some(join),
        })
    }
}

impl Drop for SignalPump {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Polls worker liveness until at least one matching heartbeat is fresh, or
/// `deadline` elapses.
fn wait_for_worker(config: &PigeonConfig, route: Option<&str>, deadline: Duration) -> Result<(), ExitKind> {
    let started = Instant::now();
    loop {
        let now = now_ts();
        let active = discover_active_workers(config, route, now, DEFAULT_STALE_AFTER_SECS)
            .unwrap_or_default();
        if !active.is_empty() {
            return Ok(());
        }
        if started.elapsed() >= deadline {
            return Err(ExitKind::NoWorker);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn write_stdout_or_stderr(channel_is_stderr: bool, data: &[u8]) {
    if channel_is_stderr {
        let mut stderr = std::io::stderr();
        let _ = stderr.write_all(data);
        let _ = stderr.flush();
    } else {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(data);
        let _ = stdout.flush();
    }
}

fn drain_stream_once(path: &std::path::Path, offset: u64, exit_code: &Mutex<Option<i32>>) -> Result<(u64, bool)> {
    let (new_offset, records) = tail_jsonl(path, offset)?;
    let mut drained_any = false;
    for value in records {
        drained_any = true;
        let Ok(record) = serde_json::from_value::<StreamRecord>(value) else {
            continue;
        };
        match record {
            StreamRecord::Output {
                channel, data_b64, ..
            } => {
                if let Ok(bytes) = decode_bytes(&data_b64) {
                    let is_stderr = matches!(channel, crate::model::Channel::Stderr);
                    write_stdout_or_stderr(is_stderr, &bytes);
                }
            }
            StreamRecord::Event(crate::model::EventRecord::Exit { exit_code: code, .. }) => {
                *exit_code.lock().unwrap() = Some(code);
            }
            StreamRecord::Event(_) => {}
        }
    }
    Ok((new_offset, drained_any))
}

/// Runs one remote command end to end: builds the request, waits for a
/// worker, proxies the terminal, and returns the exit code to report to
/// the local shell.
pub fn run_command(
    options: &PigeonOptions,
    mode: CommandMode,
    command: Vec<String>,
) -> Result<i32> {
    match normalize_command(mode, &command, &options.remote_env, options) {
        Ok(argv) => run_normalized(options, argv),
        Err(kind) => Err(anyhow::Error::new(kind)),
    }
}

fn run_normalized(options: &PigeonOptions, argv: Vec<String>) -> Result<i32> {
    let config = PigeonConfig::new(&options.cache_root, &options.namespace);
    config.ensure_dirs()?;

    let wait_deadline = Duration::from_secs_f64(options.wait_worker);
    wait_for_worker(&config, options.request_route.as_deref(), wait_deadline)
        .map_err(anyhow::Error::new)?;

    let session_id = new_session_id();
    let cwd = std::env::current_dir()
        .context("resolving current working directory")?
        .to_string_lossy()
        .into_owned();
    let created_at = utc_iso_now();

    let mut env = options.remote_env.clone();
    let mut unset_env = Vec::new();
    terminal_env_patch(&mut env, &mut unset_env);

    let request = RequestRecord {
        session_id: session_id.clone(),
        command: argv,
        cwd,
        route: options.request_route.clone(),
        created_at: created_at.clone(),
        requester: RequesterInfo {
            host: host_name(),
            pid: std::process::id() as i32,
            user: options.requester_user.clone(),
        },
        env,
        unset_env,
        terminal: TerminalInfo {
            stdin_isatty: std::io::stdin().is_terminal(),
            stdout_isatty: std::io::stdout().is_terminal(),
            size: read_terminal_size(),
        },
    };
    let status = StatusRecord::pending(session_id.clone(), created_at);
    store::create_session(&config, &request, &status)?;

    let stdin = std::io::stdin();
    let raw_guard = RawModeGuard::enter(stdin.as_fd());
    let control_seq = Arc::new(AtomicU64::new(0));
    let stdin_pump = StdinPump::spawn(config.clone(), session_id.clone());
    let signal_pump = SignalPump::spawn(config.clone(), session_id.clone(), Arc::clone(&control_seq))?;

    let result = output_loop(options, &config, &session_id);

    drop(signal_pump);
    drop(stdin_pump);
    drop(raw_guard);

    result
}

fn output_loop(options: &PigeonOptions, config: &PigeonConfig, session_id: &str) -> Result<i32> {
    let stream_path = stream_path(config, session_id);
    let status_path = status_path(config, session_id);
    let exit_code = Mutex::new(None);
    let mut offset = 0u64;
    let mut last_state: Option<SessionState> = None;
    let mut no_worker_deadline: Option<Instant> = None;

    loop {
        let (new_offset, _) = drain_stream_once(&stream_path, offset, &exit_code)?;
        offset = new_offset;

        let status: StatusRecord = read_json(&status_path)?;
        if let Some(code) = status.exit_code {
            *exit_code.lock().unwrap() = Some(code);
        }

        if last_state != Some(status.state) {
            if options.verbose {
                eprintln!("\n[pigeon] session={session_id} state={:?}", status.state);
            }
            last_state = Some(status.state);
        }

        if status.state == SessionState::Pending {
            let active = discover_active_workers(
                config,
                options.request_route.as_deref(),
                now_ts(),
                DEFAULT_STALE_AFTER_SECS,
            )
            .unwrap_or_default();
            if active.is_empty() {
                let deadline = no_worker_deadline.get_or_insert_with(|| {
                    Instant::now() + Duration::from_secs_f64(options.wait_worker)
                });
                if Instant::now() >= *deadline {
                    return Err(anyhow::Error::new(ExitKind::NoWorker));
                }
            } else {
                no_worker_deadline = None;
            }
        }

        if status.state.is_terminal() {
            for _ in 0..DRAIN_TICKS {
                std::thread::sleep(POLL_INTERVAL);
                let (next_offset, drained_any) = drain_stream_once(&stream_path, offset, &exit_code)?;
                offset = next_offset;
                if !drained_any {
                    break;
                }
            }
            return Ok(exit_code.lock().unwrap().unwrap_or(1));
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}
