//! Worker child process entry point.
//!
//! Launched by a parent `Worker` with `--pipe <path>`; connects back to
//! that unix-domain socket and serves evaluation requests with the bundled
//! expression evaluator until it is told to shut down. All logging goes to
//! stdout so the parent's output redirector captures one stream of truth.

use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::process::ExitCode;

use taskutil::worker::{serve_requests, ExprEvaluator};

#[derive(Parser, Debug)]
#[command(name = "taskutil-worker", version, about = "Taskutil worker child process")]
struct Args {
    /// Unix socket path to connect back to.
    #[arg(long = "pipe")]
    pipe: PathBuf,

    /// Log level: trace, debug, info, warn, error
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,

    /// Color output: auto, always, never
    #[arg(long = "color", default_value = "never")]
    color: String,

    /// Suppress non-essential output
    #[arg(short = 'q', long = "quiet", action = ArgAction::SetTrue)]
    quiet: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        _ if args.quiet => tracing::Level::ERROR,
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };
    let ansi = match args.color.as_str() {
        "always" => true,
        "auto" => std::io::IsTerminal::is_terminal(&std::io::stdout()),
        _ => false,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(ansi)
        .with_writer(std::io::stdout)
        .with_target(false)
        .init();

    match serve_requests(&args.pipe, ExprEvaluator::new()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, pipe = %args.pipe.display(), "worker serve loop failed");
            ExitCode::FAILURE
        }
    }
}
