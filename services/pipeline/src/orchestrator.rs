//! Spawns one shard process per non-empty partition set and stops them on
//! shutdown by closing their stdin.

use crate::config::Config;
use crate::sharding::PartitionAssignment;
use crate::signals::shutdown_signal;
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

/// A started shard process
struct ShardProcess {
    index: u32,
    child: Child,
}

pub struct Orchestrator {
    executable: PathBuf,
    config_path: Option<PathBuf>,
    assignment: PartitionAssignment,
}

impl Orchestrator {
    pub fn new(config: &Config, config_path: Option<&Path>) -> Result<Self> {
        let executable = std::env::current_exe().context("Failed to locate own executable")?;
        Ok(Self::with_executable(config, config_path, executable))
    }

    /// Orchestrate shards run by `executable`, which must accept
    /// `shard --index N [--config PATH] --stop-on-stdin-eof`
    pub fn with_executable(config: &Config, config_path: Option<&Path>, executable: PathBuf) -> Self {
        Self {
            executable,
            config_path: config_path.map(Path::to_path_buf),
            assignment: PartitionAssignment::compute(
                config.kafka.partition_start,
                config.kafka.partition_end,
                config.orchestrator.process_num,
            ),
        }
    }

    pub fn assignment(&self) -> &PartitionAssignment {
        &self.assignment
    }

    /// Start the shards, wait for a shutdown signal, stop them and wait for
    /// every one to exit
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    #[instrument(skip_all, fields(shards = self.assignment.shard_count()))]
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let mut stdins: Vec<ChildStdin> = Vec::new();
        let mut exits = JoinSet::new();

        for (index, partitions) in self.assignment.iter() {
            if partitions.is_empty() {
                warn!(shard = index, "No partitions assigned, shard not started");
                continue;
            }

            let mut shard = self.spawn(index)?;
            info!(shard = index, pid = shard.child.id(), ?partitions, "Shard started");
            if let Some(stdin) = shard.child.stdin.take() {
                stdins.push(stdin);
            }
            exits.spawn(async move { (shard.index, shard.child.wait().await) });
        }

        if exits.is_empty() {
            bail!("No shard has partitions to consume");
        }

        tokio::pin!(shutdown);
        let mut stopping = false;
        let mut failed = 0usize;

        loop {
            tokio::select! {
                _ = &mut shutdown, if !stopping => {
                    info!(shards = exits.len(), "Stopping shards");
                    stopping = true;
                    stdins.clear();
                }
                joined = exits.join_next() => match joined {
                    None => break,
                    Some(Ok((index, Ok(status)))) => {
                        if !report_exit(index, status, stopping) {
                            failed += 1;
                        }
                    }
                    Some(Ok((index, Err(e)))) => {
                        error!(shard = index, error = %e, "Failed to wait for shard");
                        failed += 1;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Shard watcher failed");
                        failed += 1;
                    }
                }
            }
        }

        info!("All shards exited");
        if failed > 0 {
            bail!("{failed} shard(s) exited abnormally");
        }
        Ok(())
    }

    fn spawn(&self, index: u32) -> Result<ShardProcess> {
        let mut command = Command::new(&self.executable);
        command
            .arg("shard")
            .arg("--index")
            .arg(index.to_string())
            .arg("--stop-on-stdin-eof");
        if let Some(path) = &self.config_path {
            command.arg("--config").arg(path);
        }
        command.stdin(Stdio::piped());

        let child = command
            .spawn()
            .with_context(|| format!("Failed to start shard {index}"))?;
        Ok(ShardProcess { index, child })
    }
}

/// Log a shard exit; false when it counts as a failure
fn report_exit(index: u32, status: ExitStatus, stopping: bool) -> bool {
    match (status.success(), stopping) {
        (true, true) => {
            info!(shard = index, "Shard exited");
            true
        }
        (true, false) => {
            warn!(shard = index, "Shard exited before shutdown was requested");
            true
        }
        (false, _) => {
            error!(shard = index, %status, "Shard exited with failure");
            false
        }
    }
}
