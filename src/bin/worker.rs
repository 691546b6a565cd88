//! Worker-node entry point.
//!
//! ```text
//! usage: worker <server_host> <server_port> [threads] [-v|--verbose]
//! ```
//!
//! Exit codes: 0 for normal termination (including a broadcast STOP),
//! 1 for usage, configuration, or handshake failures.

use std::env;
use std::process::ExitCode;

use crackle::{WorkerConfig, WorkerNode};
use tracing_subscriber::EnvFilter;

fn usage(exe: &str) {
    eprintln!("usage: {exe} <server_host> <server_port> [threads] [-v|--verbose]");
}

fn parse_args(args: env::Args) -> Result<WorkerConfig, String> {
    let mut positional: Vec<String> = Vec::new();
    let mut verbose = false;

    for arg in args {
        match arg.as_str() {
            "-v" | "--verbose" => verbose = true,
            flag if flag.starts_with('-') => return Err(format!("unknown flag: {flag}")),
            _ => positional.push(arg),
        }
    }

    let (host, port) = match positional.as_slice() {
        [host, port] | [host, port, _] => (host.clone(), port.as_str()),
        _ => return Err("expected <server_host> <server_port> [threads]".into()),
    };
    let port: u16 = port
        .parse()
        .ok()
        .filter(|p| *p >= 1)
        .ok_or_else(|| format!("server_port must be in [1, 65535], got {port:?}"))?;

    let threads = match positional.get(2) {
        Some(raw) => raw
            .parse::<usize>()
            .ok()
            .filter(|t| *t >= 1)
            .ok_or_else(|| format!("threads must be a positive integer, got {raw:?}"))?,
        None => num_cpus::get().max(1),
    };

    Ok(WorkerConfig {
        server_host: host,
        server_port: port,
        threads,
        verbose,
    })
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "error" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let mut args = env::args();
    let exe = args.next().unwrap_or_else(|| "worker".into());

    let config = match parse_args(args) {
        Ok(config) => config,
        Err(reason) => {
            eprintln!("worker: {reason}");
            usage(&exe);
            return ExitCode::from(1);
        }
    };

    init_tracing(config.verbose);
    tracing::debug!(
        host = %config.server_host,
        port = config.server_port,
        threads = config.threads,
        "starting worker node"
    );

    let code = WorkerNode::new(config).run();
    ExitCode::from(code.clamp(0, u8::MAX as i32) as u8)
}
