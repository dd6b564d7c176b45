use clap::Args;

use cumulus_daemon::process;
use cumulus_daemon::state::{AppState, StateError};
use cumulus_daemon::DaemonError;

#[derive(Args, Debug, Clone)]
pub struct Run {
    /// Override the log directive (default from config)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Write daily log files under the state directory
    #[arg(long)]
    pub log_to_file: bool,

    /// Override milliseconds between engine rounds
    #[arg(long)]
    pub tick_ms: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("engine failed: {0}")]
    Daemon(#[from] DaemonError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Run {
    type Error = RunError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let mut state = AppState::load(ctx.config_path.clone())?;
        if let Some(level) = &self.log_level {
            state.config.log_level = level.clone();
        }
        if self.log_to_file {
            state.config.log_to_file = true;
        }
        if let Some(tick_ms) = self.tick_ms {
            state.config.tick_ms = tick_ms;
        }

        let _guards = process::init_logging(&state.config.log_level, state.log_dir());
        process::run(state).await?;
        Ok("engine stopped".to_string())
    }
}
