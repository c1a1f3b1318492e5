//! Stratus command-line driver
//!
//! Reconstructs the extinction of a drifting cloud from multi-view,
//! multi-time radiance measurements.
//!
//! Commands:
//! - `carve`: occupancy masks and advection velocity only
//! - `optimize`: carve, then minimise (optionally with basin hopping)
//! - `inspect`: summarise a checkpoint file

mod config;
mod error;
mod runner;

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{Overrides, RunConfig};

/// Stratus - dynamic cloud tomography
#[derive(Parser, Debug)]
#[command(name = "stratus")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Carve occupancy masks and estimate the cloud velocity
    Carve {
        /// Run configuration (JSON)
        config: PathBuf,
        /// Output directory (defaults to the measurement directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Reconstruct the extinction field
    Optimize {
        /// Run configuration (JSON)
        config: PathBuf,
        /// Resume from a checkpoint
        #[arg(long)]
        reload_path: Option<PathBuf>,
        /// Wrap the local optimiser in basin hopping
        #[arg(long)]
        globalopt: bool,
        /// Output directory (defaults to the measurement directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print a checkpoint summary as JSON
    Inspect {
        checkpoint: PathBuf,
    },
}

fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .init();
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging(&args.log_level);

    match args.command {
        Command::Carve { config, output } => {
            let mut config = RunConfig::load(&config)?;
            config.apply(Overrides {
                output,
                ..Overrides::default()
            });
            let summary = runner::carve(&config)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Optimize {
            config,
            reload_path,
            globalopt,
            output,
        } => {
            let mut config = RunConfig::load(&config)?;
            config.apply(Overrides {
                reload_path,
                globalopt,
                output,
            });
            let summary = runner::optimize(&config)?;
            info!("------------------ Optimization Finished ------------------");
            if let Some(hops) = summary.hops {
                info!("Number global iterations: {}", hops);
            }
            info!("Success: {}", summary.converged);
            info!("Message: {}", summary.message);
            info!("Final loss: {:.6e}", summary.loss);
            info!("Number iterations: {}", summary.iterations);
            info!("Final state: {}", summary.final_state.display());
        }
        Command::Inspect { checkpoint } => {
            let summary = runner::inspect(&checkpoint)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    Ok(())
}
