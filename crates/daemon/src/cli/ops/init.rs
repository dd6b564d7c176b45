use clap::Args;

use cumulus_daemon::state::{AppConfig, AppState, StateError, SyncPair};

#[derive(Args, Debug, Clone)]
pub struct Init {
    /// Folder pair to keep in sync, as LOCAL=REMOTE (repeatable)
    #[arg(long = "sync", value_name = "LOCAL=REMOTE")]
    pub syncs: Vec<SyncPair>,

    /// Default log directive
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Also write daily log files under the state directory
    #[arg(long)]
    pub log_to_file: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("init failed: {0}")]
    StateFailed(#[from] StateError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Init {
    type Error = InitError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let config = AppConfig {
            log_level: self.log_level.clone(),
            log_to_file: self.log_to_file,
            syncs: self.syncs.clone(),
            ..AppConfig::default()
        };

        let state = AppState::init(ctx.config_path.clone(), Some(config))?;

        let mut output = format!(
            "Initialized cumulus directory at: {}\n\
             - Key: {}\n\
             - Cache: {}\n\
             - Mirror: {}\n\
             - Config: {}",
            state.state_dir.display(),
            state.key_path.display(),
            state.store_path.display(),
            state.mirror_path.display(),
            state.config_path.display(),
        );
        if state.config.syncs.is_empty() {
            output.push_str("\n- Syncs: none (add [[syncs]] entries to the config)");
        }
        for pair in &state.config.syncs {
            output.push_str(&format!("\n- Sync: {} <-> /{}", pair.local.display(), pair.remote));
        }

        Ok(output)
    }
}
