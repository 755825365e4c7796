//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

use resumable_dl::engine::DEFAULT_MAX_CONCURRENT;

/// Default task database, relative to the working directory.
pub const DEFAULT_DB_PATH: &str = ".rdl/tasks.db";

/// Resumable downloads from the command line.
///
/// Tasks are stored in a small SQLite database, so an interrupted download
/// picks up where it stopped on the next `rdl resume` or `rdl get`.
#[derive(Parser, Debug)]
#[command(name = "rdl")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Task database file
    #[arg(long, value_name = "PATH", global = true, conflicts_with = "ephemeral")]
    pub db: Option<PathBuf>,

    /// Keep tasks in memory only
    #[arg(long, global = true)]
    pub ephemeral: bool,

    /// Maximum concurrent downloads (1-100)
    #[arg(short = 'c', long, global = true, default_value_t = DEFAULT_MAX_CONCURRENT as u8, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: u8,

    /// Extra attempts for requests that fail before the server answers (0-10)
    #[arg(short = 'r', long, global = true, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub retries: u8,

    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    /// Database path, if tasks are persisted.
    pub fn db_path(&self) -> Option<PathBuf> {
        if self.ephemeral {
            None
        } else {
            Some(
                self.db
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            )
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download URLs and wait until they finish
    Get(GetArgs),

    /// Show stored tasks
    List(TagFilter),

    /// Continue paused downloads
    Resume(TagFilter),

    /// Restart failed downloads from scratch
    Retry(TagFilter),

    /// Delete tasks and their partial files
    Remove {
        /// Task ids as printed by `rdl list`
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Delete every task
    Clear,
}

#[derive(ClapArgs, Debug)]
pub struct GetArgs {
    /// URLs to download
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Directory to save files in
    #[arg(short = 'o', long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Tag to group the tasks under
    #[arg(long)]
    pub tag: Option<String>,
}

#[derive(ClapArgs, Debug, Default)]
pub struct TagFilter {
    /// Only tasks with this tag
    #[arg(long)]
    pub tag: Option<String>,
}
