//! stagehand - pipeline worker supervisor
//!
//! Launches the sequential document worker and a pool of parallel render
//! workers, restarts them when their output shows they are stuck, and takes
//! operator commands on stdin.
//!
//! ## Usage
//!
//! ```bash
//! # Run with ~/.stagehand/config.yaml (or built-in defaults)
//! stagehand
//!
//! # Four render workers, no document worker
//! stagehand --parallel 4 --no-sequential
//!
//! # Explicit config and verbose logging
//! stagehand --config ./stagehand.yaml -v
//! ```

mod console;

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use console::Command;
use stagehand_core::{LogGuard, StagehandConfig, init_logging};
use stagehand_queue::DirectorySource;
use stagehand_worker::{Supervisor, cleanup};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// Pipeline worker supervisor
///
/// Keeps the document and render workers running, restarts them on
/// failure and scales the render pool on demand.
#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to ~/.stagehand/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of parallel render workers to start with
    #[arg(short, long)]
    parallel: Option<u32>,

    /// Do not run the sequential document worker
    #[arg(long)]
    no_sequential: bool,

    /// Enable verbose logging (increases log level)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Directory for log files (defaults to ~/.stagehand/logs/)
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match setup_logging(&cli) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::from(1);
        }
    };

    info!("Starting stagehand");

    match run(&cli).await {
        Ok(()) => {
            info!("stagehand exited normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("stagehand error: {}", e);
            eprintln!("{}", console::describe_error(&e));
            ExitCode::from(if e.is_config_error() { 2 } else { 1 })
        }
    }
}

/// Set up logging based on CLI arguments.
fn setup_logging(cli: &Cli) -> stagehand_core::Result<LogGuard> {
    init_logging(cli.log_dir.clone(), cli.verbose > 0)
}

/// Load the configuration file and apply command-line overrides.
fn load_config(cli: &Cli) -> stagehand_core::Result<StagehandConfig> {
    let mut config = StagehandConfig::load(cli.config.as_deref())?;
    if let Some(parallel) = cli.parallel {
        config.workers.parallel = parallel;
    }
    if cli.no_sequential {
        config.workers.sequential = false;
    }
    config.validate()?;
    Ok(config)
}

async fn run(cli: &Cli) -> stagehand_core::Result<()> {
    let config = load_config(cli)?;
    let supervisor = Supervisor::new(config.clone(), cleanup::from_config(&config.cleanup))?;

    supervisor.start_all().await?;

    let discovery = config.discovery.projects_dir.clone().map(|dir| {
        let mut source = DirectorySource::new(dir);
        if let Some(channel) = &config.discovery.channel {
            source = source.with_channel(channel.clone());
        }
        supervisor.spawn_discovery(Arc::new(source))
    });

    let reply = console::dispatch(&supervisor, Command::Status).await;
    println!("{}\n\nType 'help' for commands.", reply.text);

    run_console(&supervisor).await;
    supervisor.shutdown().await;

    if let Some(handle) = discovery
        && let Err(e) = handle.await
    {
        warn!(error = %e, "discovery task ended abnormally");
    }
    Ok(())
}

/// Read commands from stdin until quit, EOF, Ctrl-C or pool shutdown.
async fn run_console(supervisor: &Supervisor) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                return;
            }
            _ = supervisor.wait_for_shutdown() => {
                info!("worker pool stopped, closing console");
                return;
            }
        };

        match line {
            Ok(Some(line)) => {
                let reply = console::dispatch(supervisor, Command::parse(&line)).await;
                if !reply.text.is_empty() {
                    println!("{}", reply.text);
                }
                if reply.quit {
                    return;
                }
            }
            Ok(None) => {
                info!("console input closed, shutting down");
                return;
            }
            Err(e) => {
                error!(error = %e, "failed to read console input");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cli_parses_overrides() {
        let cli = Cli::parse_from([
            "stagehand",
            "--parallel",
            "4",
            "--no-sequential",
            "-vv",
            "--config",
            "/etc/stagehand.yaml",
        ]);
        assert_eq!(cli.parallel, Some(4));
        assert!(cli.no_sequential);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/stagehand.yaml")));
    }

    #[test]
    fn test_load_config_applies_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "workers:\n  parallel: 2\n").unwrap();

        let cli = Cli::parse_from([
            "stagehand",
            "--config",
            path.to_str().unwrap(),
            "--parallel",
            "5",
            "--no-sequential",
        ]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.workers.parallel, 5);
        assert!(!config.workers.sequential);
    }

    #[test]
    fn test_parallel_override_is_validated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "workers:\n  max_parallel: 3\n  parallel: 2\n").unwrap();

        let cli = Cli::parse_from(["stagehand", "--config", path.to_str().unwrap(), "-p", "9"]);
        let err = load_config(&cli).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_missing_config_is_reported() {
        let cli = Cli::parse_from(["stagehand", "--config", "/nonexistent/stagehand.yaml"]);
        let err = load_config(&cli).unwrap_err();
        assert!(err.is_config_error());
        assert!(console::describe_error(&err).contains("hint:"));
    }
}
