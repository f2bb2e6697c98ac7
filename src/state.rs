//! Durable run-state storage.
//!
//! The [`RunState`] record is read once when a run starts and written once
//! when it ends. [`FileRunStateStore`] keeps it as a JSON file and replaces
//! it with write-to-temp, fsync, rename, so a run killed mid-write leaves
//! the previous record in place rather than half of a new one.

use crate::errors::StateError;
use crate::models::RunState;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

/// Key-value persistence for the worker's run state.
pub trait RunStateStore {
    /// `None` before the first completed run.
    async fn load(&self) -> Result<Option<RunState>, StateError>;

    /// Replace the stored record in one step.
    async fn save(&self, state: &RunState) -> Result<(), StateError>;
}

#[derive(Debug, Clone)]
pub struct FileRunStateStore {
    path: PathBuf,
}

impl FileRunStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "run_state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl RunStateStore for FileRunStateStore {
    #[instrument(level = "debug", skip_all, fields(path = %self.path.display()))]
    async fn load(&self) -> Result<Option<RunState>, StateError> {
        match fs::read(&self.path).await {
            Ok(bytes) => {
                let state: RunState = serde_json::from_slice(&bytes)?;
                debug!(version = state.version, horizon = state.horizon.len(), "Loaded run state");
                Ok(Some(state))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No run state yet; starting fresh");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(level = "debug", skip_all, fields(path = %self.path.display(), version = state.version))]
    async fn save(&self, state: &RunState) -> Result<(), StateError> {
        let json = serde_json::to_vec_pretty(state)?;
        let tmp = self.temp_path();

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &self.path).await?;
        debug!(bytes = json.len(), "Wrote run state");
        Ok(())
    }
}
