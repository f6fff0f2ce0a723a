mod cli;
mod codec;
mod config;
mod error;
mod ids;
mod lock;
mod model;
mod paths;
mod registry;
mod requester;
mod runner;
mod scheduler;
mod store;
mod time;

use std::process::ExitCode;

use cli::Invocation;
use config::PigeonOptions;
use error::ExitKind;

fn init_tracing(worker_debug: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if worker_debug { "pigeon=debug" } else { "pigeon=info" })
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> ExitCode {
    let invocation = match cli::parse() {
        Ok(inv) => inv,
        Err(err) => {
            eprintln!("pigeon: {err}");
            eprint!("{}", cli::HELP);
            return ExitCode::from(2);
        }
    };

    match invocation {
        Invocation::Help => {
            print!("{}", cli::HELP);
            ExitCode::SUCCESS
        }
        Invocation::Worker(overrides) => {
            init_tracing(overrides.verbose);
            match scheduler::run_worker(&overrides) {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    eprintln!("pigeon worker: {err:#}");
                    ExitCode::FAILURE
                }
            }
        }
        Invocation::Requester {
            overrides,
            mode,
            command,
        } => {
            init_tracing(overrides.verbose);
            let options = match PigeonOptions::load(&overrides) {
                Ok(opts) => opts,
                Err(err) => {
                    eprintln!("pigeon: {err:#}");
                    return ExitCode::from(2);
                }
            };
            run_requester(&options, mode, command)
        }
    }
}

fn run_requester(options: &PigeonOptions, mode: requester::CommandMode, command: Vec<String>) -> ExitCode {
    match requester::run_command(options, mode, command) {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(err) => {
            if let Some(kind) = err.downcast_ref::<ExitKind>() {
                if *kind == ExitKind::NoWorker {
                    eprintln!(
                        "pigeon: no active worker is available (waited {:.1}s)",
                        options.wait_worker
                    );
                } else {
                    eprintln!("pigeon: {kind}: {err:#}");
                }
                ExitCode::from(kind.code() as u8)
            } else {
                eprintln!("pigeon: {err:#}");
                ExitCode::FAILURE
            }
        }
    }
}
