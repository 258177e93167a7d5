use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use fieldcache::Config;
use tracing::level_filters::LevelFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Outputs the raw snapshot envelopes as JSON.
    Json,
    /// Outputs a table.
    Pretty,
}

/// Inspects and maintains the snapshot directory of a field cache.
///
/// The directory is taken from `--dir`, or from the `cache` section of the configuration
/// file passed with `--config`. Do not run `prune` or `clear` on a directory that a live
/// cache is syncing to.
#[derive(Clone, Parser, Debug)]
#[command(author, version, about, long_about)]
pub struct Cli {
    /// The snapshot directory.
    #[arg(long, short, global = true)]
    pub dir: Option<PathBuf>,

    /// Path to a YAML configuration file.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// The output format.
    #[arg(long, value_enum, default_value = "pretty", global = true)]
    pub format: OutputFormat,

    /// The severity level of logging output.
    ///
    /// Possible values:
    /// off, error, warn, info, debug, trace
    #[arg(long, global = true)]
    pub log_level: Option<LevelFilter>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Commands {
    /// Lists all snapshots, ordered by key.
    List,
    /// Shows the persisted fields of a single key.
    Show {
        /// The cache key.
        key: String,
    },
    /// Removes expired and unreadable snapshots, orphaned sidecars and temporary files.
    Prune {
        /// Only report what would be removed.
        #[arg(long)]
        dry_run: bool,
    },
    /// Removes all snapshots.
    Clear,
}

/// The resolved command line together with the loaded configuration.
#[derive(Clone, Debug)]
pub struct Settings {
    pub dir: PathBuf,
    pub config: Config,
    pub format: OutputFormat,
    pub command: Commands,
}

impl Settings {
    pub fn get() -> Result<Self> {
        Self::from_cli(Cli::parse())
    }

    pub fn from_cli(cli: Cli) -> Result<Self> {
        let mut config = Config::get(cli.config.as_deref())?;
        if let Some(level) = cli.log_level {
            config.logging.level = level;
        }

        let dir = cli
            .dir
            .unwrap_or_else(|| config.cache.resolved_disk_path());

        Ok(Settings {
            dir,
            config,
            format: cli.format,
            command: cli.command,
        })
    }
}
