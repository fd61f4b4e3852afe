//! p3x-app-shepherd - in-container supervisor for one platform task.
//!
//! Launches the given command, streams its stdout/stderr to the application
//! service as named blocks, samples resource utilization of the whole
//! descendant tree, and reports a final execution summary.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{CommandFactory, Parser};
use tracing::{Level, debug, info, warn};
use tracing_subscriber::EnvFilter;

use p3x_shepherd::client::{AppServiceClient, BlockWriter, ConsoleWriter};
use p3x_shepherd::collector::{RealFs, SnapshotSource};
use p3x_shepherd::history::ProcessHistory;
use p3x_shepherd::supervisor::{Supervisor, SupervisorOptions};

/// Application execution shepherd.
#[derive(Parser)]
#[command(
    name = "p3x-app-shepherd",
    about = "Application execution shepherd",
    version
)]
struct Args {
    /// Application service URL.
    #[arg(long)]
    app_service: Option<String>,

    /// Task ID.
    #[arg(long, default_value = "")]
    task_id: String,

    /// File to which standard output is to be written (reserved).
    #[arg(long)]
    stdout_file: Option<PathBuf>,

    /// File to which standard error is to be written (reserved).
    #[arg(long)]
    stderr_file: Option<PathBuf>,

    /// Resource measurement interval in seconds.
    #[arg(long, default_value = "10")]
    measurement_interval: u64,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,

    /// Command and parameters to supervise.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

/// Initializes the tracing subscriber with the appropriate log level.
/// All shepherd diagnostics go to its own standard error; standard output
/// stays clean for the console writer's stream forwarding.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("p3x_shepherd={}", level).parse().unwrap())
        .add_directive(format!("p3x_app_shepherd={}", level).parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if args.command.is_empty() {
        let mut cmd = Args::command();
        let _ = cmd.print_help();
        return ExitCode::SUCCESS;
    }

    if args.stdout_file.is_some() || args.stderr_file.is_some() {
        debug!("--stdout-file/--stderr-file are reserved and not yet written");
    }

    let command = args.command[0].clone();
    let parameters = args.command[1..].to_vec();

    let mut opts = SupervisorOptions::new(command, parameters);
    opts.measurement_interval = if args.measurement_interval == 0 {
        warn!("measurement interval 0 clamped to 1s");
        Duration::from_secs(1)
    } else {
        Duration::from_secs(args.measurement_interval)
    };

    // The FIFO must disappear even on an interrupt; normal teardown unlinks
    // it in the supervisor.
    let fifo_path = opts.fifo_path.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = std::fs::remove_file(&fifo_path);
        std::process::exit(130);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let writer: Box<dyn BlockWriter> = match &args.app_service {
        Some(url) => {
            info!("shipping blocks to {} (task {})", url, args.task_id);
            Box::new(AppServiceClient::new(url, &args.task_id))
        }
        None => Box::new(ConsoleWriter::new()),
    };

    let history = ProcessHistory::new(SnapshotSource::new(RealFs::new(), "/proc"));
    let mut supervisor = Supervisor::new(opts, writer, history);

    match supervisor.run() {
        Ok(code) => {
            info!("child finished with exit code {}", code);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
