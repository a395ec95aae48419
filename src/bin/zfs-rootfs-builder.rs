use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use zfs_rootfs_builder::validate::validate_build_name;
use zfs_rootfs_builder::{executor_for, signals, Config, Error, ExitCode, Orchestrator};

mod workflows;

/// Resumable ZFS-backed root filesystem builds
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Report what would change without changing anything
    #[arg(short = 'n', long, global = true)]
    dry_run: bool,

    /// Log at trace level
    #[arg(long, global = true)]
    debug: bool,

    /// Restart a build from scratch, or act on a build that is in progress
    #[arg(short, long, global = true)]
    force: bool,

    /// Configuration file path
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a build, or resume it where it stopped
    Create {
        name: String,

        /// Hostname inside the build (defaults to the container name)
        #[arg(long)]
        hostname: Option<String>,
    },

    /// Remove the container, datasets and state of a build
    Destroy { name: String },

    /// List known builds
    List {
        #[arg(long)]
        json: bool,
    },

    /// Show the current state of a build
    Status {
        name: String,

        #[arg(long)]
        json: bool,
    },

    /// Show the status history of a build
    History {
        name: String,

        /// Only the last N entries
        #[arg(long, value_name = "N")]
        tail: Option<usize>,
    },

    /// Forget the status, log and markers of a build
    Clean { name: String },

    /// Roll a build back to the snapshot taken after a stage
    Rollback { name: String, stage: String },
}

impl Commands {
    /// Commands that get a per-build log file.
    fn logged_build(&self) -> Option<&str> {
        match self {
            Commands::Create { name, .. } | Commands::Rollback { name, .. } => Some(name.as_str()),
            _ => None,
        }
    }
}

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            init_logging(&cli, None);
            return report(&anyhow::Error::new(err).context("loading configuration"));
        }
    };

    let orchestrator =
        Orchestrator::new(config, executor_for(cli.dry_run)).with_interrupt_flag(signals::flag());

    let log_file = cli
        .command
        .logged_build()
        .filter(|name| !cli.dry_run && validate_build_name(name).is_ok())
        .map(|name| orchestrator.store().log_path(name));
    let _guard = init_logging(&cli, log_file.as_deref());

    // Other commands keep the default SIGINT/SIGTERM behaviour.
    if matches!(cli.command, Commands::Create { .. }) {
        signals::install_handlers();
    }

    match dispatch(&cli, &orchestrator) {
        Ok(()) => ExitCode::Success.code(),
        Err(err) => report(&err),
    }
}

fn dispatch(cli: &Cli, orchestrator: &Orchestrator) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Create { name, hostname } => {
            workflows::create(orchestrator, name, hostname.clone(), cli.force)
        }
        Commands::Destroy { name } => workflows::destroy(orchestrator, name, cli.force),
        Commands::List { json } => workflows::list(orchestrator, *json),
        Commands::Status { name, json } => workflows::status(orchestrator, name, *json),
        Commands::History { name, tail } => workflows::history(orchestrator, name, *tail),
        Commands::Clean { name } => workflows::clean(orchestrator, name, cli.force),
        Commands::Rollback { name, stage } => workflows::rollback(orchestrator, name, stage),
    }
}

/// Print the failure and pick the exit code from the library error, if any.
fn report(err: &anyhow::Error) -> i32 {
    let library_error = err.chain().find_map(|cause| cause.downcast_ref::<Error>());
    let code = library_error.map_or(ExitCode::GeneralError, Error::exit_code);

    eprintln!("Error: {:#}", err);
    if let Some(signum) = signals::last_signal() {
        eprintln!("  received signal {}; the cleanup stack has been run", signum);
    }
    eprintln!("  ({}, exit code {})", code.label(), code.code());
    if let Some(hint) = library_error.and_then(Error::recovery_hint) {
        eprintln!("  hint: {}", hint);
    }
    code.code()
}

fn init_logging(cli: &Cli, log_file: Option<&Path>) -> Option<WorkerGuard> {
    let level = if cli.debug {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let console = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let (file_layer, guard) = match log_file.and_then(open_log_file) {
        Some((writer, guard)) => (
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(writer),
            ),
            Some(guard),
        ),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .init();
    guard
}

fn open_log_file(path: &Path) -> Option<(NonBlocking, WorkerGuard)> {
    let opened = (|| -> anyhow::Result<RollingFileAppender> {
        let dir = path.parent().context("log path has no parent directory")?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .context("log path has no file name")?;
        fs::create_dir_all(dir)
            .with_context(|| format!("creating log directory '{}'", dir.display()))?;
        RollingFileAppender::builder()
            .rotation(Rotation::NEVER)
            .filename_prefix(name)
            .build(dir)
            .with_context(|| format!("opening log file '{}'", path.display()))
    })();

    match opened {
        Ok(appender) => Some(tracing_appender::non_blocking(appender)),
        Err(err) => {
            eprintln!("Warning: build log disabled: {:#}", err);
            None
        }
    }
}
