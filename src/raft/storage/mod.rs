//! OpenRaft storage adapters (storage v2).
//!
//! - [`FileLogStore`] implements `RaftLogStorage`: the replicated log, vote and committed id,
//!   persisted as JSON files under `<data_dir>/raft/wal`.
//! - [`KvStateMachine`] implements `RaftStateMachine` on top of [`crate::store::Store`]. Entries
//!   are applied in memory; snapshots are written under `<data_dir>/raft/snapshots` and
//!   re-installed on open, after which openraft replays the remaining log.

mod log_store;
mod state_machine;

use std::path::{Path, PathBuf};

use openraft::{ErrorSubject, ErrorVerb};

use crate::raft::types::NodeId;

pub use log_store::FileLogStore;
pub use state_machine::{KvSnapshotBuilder, KvStateMachine};

#[derive(Debug, Clone)]
pub struct StorePaths {
    pub wal_dir: PathBuf,
    pub snapshot_dir: PathBuf,
}

impl StorePaths {
    pub fn new(data_dir: &Path) -> Self {
        let raft_dir = data_dir.join("raft");
        Self {
            wal_dir: raft_dir.join("wal"),
            snapshot_dir: raft_dir.join("snapshots"),
        }
    }

    pub fn log_json(&self) -> PathBuf {
        self.wal_dir.join("log.json")
    }

    pub fn vote_json(&self) -> PathBuf {
        self.wal_dir.join("vote.json")
    }

    pub fn committed_json(&self) -> PathBuf {
        self.wal_dir.join("committed.json")
    }

    pub fn snapshot_meta_json(&self) -> PathBuf {
        self.snapshot_dir.join("current_meta.json")
    }

    pub fn snapshot_data_json(&self, snapshot_id: &str) -> PathBuf {
        self.snapshot_dir.join(format!("{snapshot_id}.json"))
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.wal_dir)?;
        std::fs::create_dir_all(&self.snapshot_dir)?;
        Ok(())
    }
}

fn io_err(
    subject: ErrorSubject<NodeId>,
    verb: ErrorVerb,
    err: std::io::Error,
) -> openraft::StorageError<NodeId> {
    openraft::StorageError::from_io_error(subject, verb, err)
}

async fn blocking<T, F>(f: F) -> std::io::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(std::io::Error::other)?
}

async fn read_json<T: serde::de::DeserializeOwned + Send + 'static>(
    path: &Path,
) -> std::io::Result<Option<T>> {
    let path = path.to_path_buf();
    blocking(move || {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)?;
        let v = serde_json::from_slice(&bytes).map_err(std::io::Error::other)?;
        Ok(Some(v))
    })
    .await
}

async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let path = path.to_path_buf();
    let bytes = serde_json::to_vec(value).map_err(std::io::Error::other)?;
    blocking(move || {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(tmp, path)
    })
    .await
}
