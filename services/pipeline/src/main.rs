//! Chanscan - image stream classification service
//!
//! `chanscan run` starts one shard process per partition group and keeps
//! them running until Ctrl+C or SIGTERM. `chanscan plan` prints the
//! partition assignment without starting anything.

use anyhow::{Context, Result};
use chanscan_pipeline::prelude::*;
use chanscan_pipeline::telemetry::init_tracing;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "chanscan", version, about = "Image stream channel classification")]
struct Cli {
    /// Configuration file; defaults to config/chanscan.* or /etc/chanscan/chanscan.*
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start all shards and supervise them
    Run,
    /// Run a single shard in this process
    Shard {
        #[arg(long)]
        index: u32,
        /// Stop when stdin is closed
        #[arg(long, hide = true)]
        stop_on_stdin_eof: bool,
    },
    /// Print the partition assignment
    Plan,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Run => {
            let _guard = init_tracing(&config.service, None)?;
            info!(
                service = %config.service.name,
                shards = config.orchestrator.process_num,
                topic = %config.kafka.topic,
                "Starting chanscan"
            );
            Orchestrator::new(&config, cli.config.as_deref())?.run().await?;
            info!("Chanscan stopped");
        }
        Command::Shard {
            index,
            stop_on_stdin_eof,
        } => {
            let _guard = init_tracing(&config.service, Some(index))?;
            run_shard_process(config, index, stop_on_stdin_eof).await?;
        }
        Command::Plan => {
            let assignment = PartitionAssignment::compute(
                config.kafka.partition_start,
                config.kafka.partition_end,
                config.orchestrator.process_num,
            );
            for (shard, partitions) in assignment.iter() {
                println!("shard {shard}: {partitions:?}");
            }
        }
    }

    Ok(())
}
