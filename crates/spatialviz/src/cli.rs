//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use spatialviz_service::caching;
use spatialviz_service::config::Config;
use spatialviz_service::metrics;

use crate::logging;
use crate::server;

/// Spatialviz commands.
#[derive(Subcommand)]
enum Command {
    /// Run the web server.
    Run,

    /// Rebuild the cache index from disk and enforce the cache limits once.
    Cleanup {
        /// Only report what would be removed, without deleting anything.
        #[arg(long)]
        dry_run: bool,
    },
}

/// Command line interface parser.
#[derive(Parser)]
#[command(name = "spatialviz", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long = "config", short = 'c', global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: Some(env!("CARGO_PKG_VERSION").into()),
        ..Default::default()
    });

    // SAFETY: we are still single-threaded, no runtime has been started yet.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd,
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure statsd")?;
    }

    match cli.command {
        Command::Run => server::run(config).context("failed to start the server")?,
        Command::Cleanup { dry_run } => {
            let stats = caching::cleanup(&config, dry_run).context("failed to clean up caches")?;
            tracing::info!(
                dry_run,
                "Cleanup removed {} of {} bytes, {} bytes remain",
                stats.removed_bytes,
                stats.before_bytes,
                stats.after_bytes,
            );
        }
    }

    Ok(())
}
