//! CLI entry point for the rdl tool.

use std::io::{self, IsTerminal};
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use resumable_dl::{DownloadEngine, EngineConfig};
use tracing::{debug, info};

mod app;
mod cli;
mod commands;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let config = EngineConfig {
        max_concurrent: usize::from(args.concurrency),
        request_retries: u32::from(args.retries),
        ..EngineConfig::default()
    };
    let engine = match args.db_path() {
        Some(path) => {
            debug!(db = %path.display(), "Opening task database");
            DownloadEngine::with_sqlite(config, &path).await?
        }
        None => DownloadEngine::in_memory(config).await?,
    };

    let show_progress = !args.quiet && io::stderr().is_terminal();
    let success = match &args.command {
        Command::Get(get) => {
            commands::run_get_command(&engine, get, show_progress)
                .await?
                .success()
        }
        Command::Resume(filter) => {
            commands::run_resume_command(&engine, filter, show_progress)
                .await?
                .success()
        }
        Command::Retry(filter) => {
            commands::run_retry_command(&engine, filter, show_progress)
                .await?
                .success()
        }
        Command::List(filter) => {
            commands::run_list_command(&engine, filter);
            true
        }
        Command::Remove { ids } => {
            commands::run_remove_command(&engine, ids);
            true
        }
        Command::Clear => {
            commands::run_clear_command(&engine);
            true
        }
    };

    engine.shutdown().await;
    info!("rdl finished");

    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
