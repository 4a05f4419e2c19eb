//! # strata_app
//!
//! Drives the entity runtime through a scripted session: builds the type
//! libraries, spawns entities across the global, world, and sector pools,
//! and runs a fixed number of ticks.
//!
//! Configuration is read from a JSON file (see [`config::AppConfig`]); a
//! missing file means defaults. `RUST_LOG` overrides `--log`.

mod config;
mod session;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::AppConfig;
use session::Session;

#[derive(Parser)]
#[command(name = "strata", about = "Scripted session over the Strata entity runtime")]
struct Args {
    /// Path to the JSON session config
    #[arg(short, long, default_value = "strata.json")]
    config: PathBuf,

    /// Override the number of ticks to run
    #[arg(short, long)]
    ticks: Option<u64>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "strata=info")]
    log: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log)),
        )
        .init();

    let mut config = AppConfig::load(&args.config)?;
    if let Some(ticks) = args.ticks {
        config = config.with_ticks(ticks);
    }
    info!(worlds = ?config.worlds, ticks = config.ticks, "session starting");

    let mut session = Session::new(config)?;
    let report = session.run()?;
    info!(
        ticks = report.ticks,
        active = report.active_entities,
        destroyed = report.destroyed,
        next_id = session.manager().next_id(),
        "session finished"
    );
    Ok(())
}
