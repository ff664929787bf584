//! docsync CLI
//!
//! Command-line tools for exercising docsync replication.
//!
//! # Commands
//!
//! - `simulate` - Replicate a seeded in-memory master into a fork and report
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use docsync_testkit::SimulationConfig;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// docsync command-line tools.
#[derive(Parser)]
#[command(name = "docsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a replication simulation on in-memory stores
    Simulate {
        /// Documents seeded on master
        #[arg(short, long, default_value = "1000")]
        docs: usize,

        /// Documents per pulled page
        #[arg(long, default_value = "100")]
        pull_batch: usize,

        /// Documents per pushed batch
        #[arg(long, default_value = "50")]
        push_batch: usize,

        /// Documents edited on both sides before the first sync
        #[arg(short, long, default_value = "10")]
        conflicts: usize,

        /// Random writes issued while replicating live
        #[arg(short, long, default_value = "100")]
        live_writes: usize,

        /// Seed for the live writes
        #[arg(long, default_value = "7")]
        seed: u64,

        /// Seconds to wait for convergence
        #[arg(short, long, default_value = "10")]
        timeout: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Simulate {
            docs,
            pull_batch,
            push_batch,
            conflicts,
            live_writes,
            seed,
            timeout,
            format,
        } => {
            if pull_batch == 0 || push_batch == 0 {
                return Err("batch sizes must be at least 1".into());
            }
            let config = SimulationConfig {
                documents: docs,
                pull_batch_size: pull_batch,
                push_batch_size: push_batch,
                conflicts,
                live_writes,
                seed,
                timeout: Duration::from_secs(timeout),
            };
            commands::simulate::run(config, &format)?;
        }
        Commands::Version => {
            println!("docsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("docsync replication v{}", docsync_replication::VERSION);
        }
    }

    Ok(())
}
