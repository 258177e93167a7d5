use anyhow::{Context, Result};
use chrono::Utc;
use fieldcache::disk::maintenance;

use settings::{Commands, OutputFormat, Settings};

mod output;
mod settings;

fn main() -> Result<()> {
    let settings = Settings::get()?;

    // SAFETY: We are still single-threaded at this point.
    unsafe { fieldcache::logging::init_logging(&settings.config.logging) };

    if let Some(statsd) = &settings.config.metrics.statsd {
        fieldcache::metrics::configure_statsd(&settings.config.metrics.prefix, statsd.as_str())?;
    }

    match run(settings) {
        Ok(()) => Ok(()),
        Err(error) => {
            fieldcache::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}

fn run(settings: Settings) -> Result<()> {
    let dir = settings.dir.as_path();
    let now = Utc::now();

    match settings.command {
        Commands::List => {
            let snapshots = maintenance::list_snapshots(dir)?;
            match settings.format {
                OutputFormat::Json => {
                    let files: Vec<_> = snapshots.iter().map(|info| &info.snapshot).collect();
                    println!("{}", serde_json::to_string_pretty(&files)?);
                }
                OutputFormat::Pretty => output::print_snapshots(&snapshots, now),
            }
        }
        Commands::Show { key } => {
            let info = maintenance::find_snapshot(dir, &key)?
                .with_context(|| format!("no snapshot for key `{key}`"))?;
            match settings.format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&info.snapshot)?)
                }
                OutputFormat::Pretty => output::print_fields(&info, now),
            }
        }
        Commands::Prune { dry_run } => {
            let stats = maintenance::prune(dir, now, dry_run)?;
            output::print_prune_stats(&stats, dry_run);
        }
        Commands::Clear => {
            maintenance::clear_dir(dir)
                .with_context(|| format!("failed to clear `{}`", dir.display()))?;
            tracing::info!("Cleared snapshot directory `{}`", dir.display());
        }
    }

    Ok(())
}
