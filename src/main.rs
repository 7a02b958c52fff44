//! projectgc - cascading garbage collection across project partitions
//!
//! Watches object metadata in the root cluster and every configured project
//! cluster, deletes objects whose owners are gone and honors orphan and
//! foreground deletion.

use anyhow::Result;
use clap::{Parser, Subcommand};
use projectgc::cli::{self, ConfigSubcommand, RunOptions};
use std::path::PathBuf;

/// Cascading garbage collector for multi-partition control planes
#[derive(Parser, Debug)]
#[command(name = "projectgc")]
#[command(about = "Cascading garbage collector for multi-partition control planes", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

/// Main commands
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the garbage collector
    Run {
        /// Config file layered over the root config
        #[arg(long)]
        config: Option<PathBuf>,
        /// Workers per queue
        #[arg(long)]
        workers: Option<usize>,
        /// Address for the debug graph endpoint
        #[arg(long)]
        debug_address: Option<String>,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Run {
            config,
            workers,
            debug_address,
        } => {
            cli::run(RunOptions {
                config,
                workers,
                debug_address,
            })
            .await
        }
        Command::Config { subcommand } => cli::handle_config_command(subcommand),
        Command::Version => {
            cli::display_version();
            Ok(())
        }
    }
}
