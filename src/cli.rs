//! Command-line surface: a hand-rolled scanner over `std::env::args` — no
//! external arg parsing framework for a crate with this few flags.

use anyhow::{anyhow, bail, Result};

use crate::config::CliOverrides;
use crate::requester::CommandMode;

pub const HELP: &str = "\
Usage:
  pigeon [OPTIONS] -- <command>...      Run a command on a worker (argv mode)
  pigeon [OPTIONS] --shell <snippet>    Run a shell snippet on a worker
  pigeon [OPTIONS] --interactive        Start an interactive remote shell
  pigeon worker [WORKER OPTIONS]        Run a worker in this process

Options:
  --cache <path>          Cache root (or PIGEON_CACHE)
  --namespace <name>      Namespace (or PIGEON_NAMESPACE)
  --route <route>         Request route (or PIGEON_ROUTE)
  --wait-worker <secs>    Seconds to wait for an active worker (or PIGEON_WAIT_WORKER)
  --config <path>         Config file path (or PIGEON_CONFIG)
  --shell <snippet>       Run <snippet> as a shell snippet instead of argv
  --interactive           Start an interactive remote shell
  -v, --verbose           Emit session state changes to stderr
  -h, --help              Show this help message

Worker options:
  --max-jobs <n>          Bounded concurrent session count (default 4)
  --poll-interval <secs>  Scheduler poll interval in seconds (default 0.05)
  --route <route>         Worker route (or PIGEON_WORKER_ROUTE)
";

/// The parsed command line, dispatched on by `main`.
pub enum Invocation {
    Help,
    Worker(CliOverrides),
    Requester {
        overrides: CliOverrides,
        mode: CommandMode,
        command: Vec<String>,
    },
}

struct Scanner {
    args: std::vec::IntoIter<String>,
}

impl Scanner {
    fn new() -> Self {
        Self {
            args: std::env::args().skip(1).collect::<Vec<_>>().into_iter(),
        }
    }

    fn next_value(&mut self, flag: &str) -> Result<String> {
        self.args.next().ok_or_else(|| anyhow!("{flag} requires a value"))
    }
}

/// Parses `std::env::args()` into an [`Invocation`]. Recognizes `pigeon
/// worker ...` as the worker subcommand; everything else is requester
/// invocation, with `--shell`/`--interactive`/a trailing command vector
/// selecting the command mode.
pub fn parse() -> Result<Invocation> {
    let mut scanner = Scanner::new();

    let mut overrides = CliOverrides::default();
    let mut shell_snippet: Option<String> = None;
    let mut interactive = false;
    let mut command = Vec::new();
    let mut past_separator = false;
    let mut is_worker = false;
    let mut first = true;

    while let Some(arg) = scanner.args.next() {
        if first && arg == "worker" {
            is_worker = true;
            first = false;
            continue;
        }
        first = false;

        if past_separator {
            command.push(arg);
            continue;
        }

        match arg.as_str() {
            "--" => past_separator = true,
            "-h" | "--help" => return Ok(Invocation::Help),
            "-v" | "--verbose" => overrides.verbose = true,
            "--cache" => overrides.cache = Some(scanner.next_value("--cache")?),
            "--namespace" => overrides.namespace = Some(scanner.next_value("--namespace")?),
            "--config" => overrides.config_path = Some(scanner.next_value("--config")?),
            "--route" if is_worker => {
                overrides.worker_route = Some(scanner.next_value("--route")?);
            }
            "--route" => overrides.request_route = Some(scanner.next_value("--route")?),
            "--wait-worker" => {
                let raw = scanner.next_value("--wait-worker")?;
                overrides.wait_worker = Some(
                    raw.parse()
                        .map_err(|_| anyhow!("--wait-worker expects a number of seconds, got {raw:?}"))?,
                );
            }
            "--max-jobs" => {
                let raw = scanner.next_value("--max-jobs")?;
                overrides.worker_max_jobs = Some(
                    raw.parse()
                        .map_err(|_| anyhow!("--max-jobs expects a positive integer, got {raw:?}"))?,
                );
            }
            "--poll-interval" => {
                let raw = scanner.next_value("--poll-interval")?;
                overrides.worker_poll_interval = Some(
                    raw.parse()
                        .map_err(|_| anyhow!("--poll-interval expects a number of seconds, got {raw:?}"))?,
                );
            }
            "--shell" => shell_snippet = Some(scanner.next_value("--shell")?),
            "--interactive" => interactive = true,
            other if other.starts_with('-') && other.len() > 1 => {
                bail!("unrecognized option: {other}");
            }
            other => command.push(other.to_string()),
        }
    }

    if is_worker {
        return Ok(Invocation::Worker(overrides));
    }

    if interactive {
        return Ok(Invocation::Requester {
            overrides,
            mode: CommandMode::Interactive,
            command: Vec::new(),
        });
    }
    if let Some(snippet) = shell_snippet {
        return Ok(Invocation::Requester {
            overrides,
            mode: CommandMode::ShellSnippet,
            command: vec![snippet],
        });
    }
    if command.is_empty() {
        return Ok(Invocation::Requester {
            overrides,
            mode: CommandMode::Interactive,
            command: Vec::new(),
        });
    }
    Ok(Invocation::Requester {
        overrides,
        mode: CommandMode::Argv,
        command,
    })
}
