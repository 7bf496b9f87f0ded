use anyhow::{bail, Context};
use async_trait::async_trait;
use tracing::{info, warn};

/// Performs the safe system shutdown.
#[async_trait]
pub trait ShutdownHandler: Send + Sync {
    async fn shutdown(&self) -> anyhow::Result<()>;
}

/// Runs the configured command, e.g. `sudo shutdown -h now`.
#[derive(Debug, Clone)]
pub struct SystemShutdown {
    command: Vec<String>,
}

impl SystemShutdown {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl ShutdownHandler for SystemShutdown {
    async fn shutdown(&self) -> anyhow::Result<()> {
        let Some((program, args)) = self.command.split_first() else {
            bail!("shutdown command is empty");
        };
        info!("shutdown: running {:?}", self.command);
        let status = tokio::process::Command::new(program)
            .args(args)
            .status()
            .await
            .with_context(|| format!("failed to run {}", program))?;
        if !status.success() {
            bail!("{} exited with {}", program, status);
        }
        Ok(())
    }
}

/// Used with the keyboard mock: only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunShutdown;

#[async_trait]
impl ShutdownHandler for DryRunShutdown {
    async fn shutdown(&self) -> anyhow::Result<()> {
        warn!("shutdown: dry run, not powering off");
        Ok(())
    }
}
