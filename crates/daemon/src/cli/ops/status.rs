use clap::Args;

use common::persistence::{sync_table, StateStore, StoreError, NODES_TABLE};
use cumulus_daemon::state::{AppState, StateError};
use cumulus_daemon::FileStateStore;

/// Show the configured syncs and what the local cache holds
#[derive(Args, Debug, Clone)]
pub struct Status;

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("cache error: {0}")]
    Store(#[from] StoreError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Status {
    type Error = StatusError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = AppState::load(ctx.config_path.clone())?;
        let keyring = state.load_keyring()?;
        let mirror = state.load_mirror()?;
        let store = FileStateStore::open(&state.store_path)?;

        let cursor = store.cursor()?;
        let mut lines = vec![
            format!("State directory: {}", state.state_dir.display()),
            format!("Mirror nodes: {}", mirror.len()),
            format!("Cached nodes: {}", store.len(NODES_TABLE)),
            format!("Event cursor: {}", cursor.as_deref().unwrap_or("none")),
        ];

        for pair in &state.config.syncs {
            match mirror.lookup(&mirror.root(), &pair.remote, &keyring) {
                Some(handle) => lines.push(format!(
                    "{} <-> /{} [{}]: {} cached entries",
                    pair.local.display(),
                    pair.remote,
                    handle,
                    store.len(&sync_table(&handle)),
                )),
                None => lines.push(format!(
                    "{} <-> /{}: remote folder not created yet",
                    pair.local.display(),
                    pair.remote,
                )),
            }
        }

        Ok(lines.join("\n"))
    }
}
