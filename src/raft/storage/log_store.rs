use std::{collections::BTreeMap, fmt::Debug, ops::RangeBounds, path::Path, sync::Arc};

use openraft::{
    ErrorSubject, ErrorVerb, LogId, LogState, RaftLogReader, Vote, storage::RaftLogStorage,
};
use tokio::sync::Mutex;

use super::{StorePaths, io_err, read_json, write_json};
use crate::raft::types::{NodeId, TypeConfig};

type Entry = openraft::impls::Entry<TypeConfig>;

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct PersistedLog {
    #[serde(default)]
    last_purged_log_id: Option<LogId<NodeId>>,
    #[serde(default)]
    entries: Vec<Entry>,
}

#[derive(Debug, Default)]
struct LogInner {
    last_purged_log_id: Option<LogId<NodeId>>,
    entries: BTreeMap<u64, Entry>,
    vote: Option<Vote<NodeId>>,
    committed: Option<LogId<NodeId>>,
}

impl LogInner {
    fn last_log_id(&self) -> Option<LogId<NodeId>> {
        self.entries
            .values()
            .next_back()
            .map(|ent| ent.log_id)
            .or(self.last_purged_log_id)
    }

    fn persisted(&self) -> PersistedLog {
        PersistedLog {
            last_purged_log_id: self.last_purged_log_id,
            entries: self.entries.values().cloned().collect(),
        }
    }
}

/// Raft log, vote and committed id kept in memory and rewritten to JSON on every change.
#[derive(Debug, Clone)]
pub struct FileLogStore {
    paths: StorePaths,
    inner: Arc<Mutex<LogInner>>,
}

impl FileLogStore {
    pub async fn open(data_dir: &Path) -> Result<Self, openraft::StorageError<NodeId>> {
        let paths = StorePaths::new(data_dir);
        paths
            .ensure_dirs()
            .map_err(|e| io_err(ErrorSubject::Store, ErrorVerb::Write, e))?;

        let log = read_json::<PersistedLog>(&paths.log_json())
            .await
            .map_err(|e| io_err(ErrorSubject::Logs, ErrorVerb::Read, e))?
            .unwrap_or_default();
        let vote = read_json::<Vote<NodeId>>(&paths.vote_json())
            .await
            .map_err(|e| io_err(ErrorSubject::Vote, ErrorVerb::Read, e))?;
        let committed = read_json::<LogId<NodeId>>(&paths.committed_json())
            .await
            .map_err(|e| io_err(ErrorSubject::Store, ErrorVerb::Read, e))?;

        tracing::debug!(
            entries = log.entries.len(),
            last_purged = ?log.last_purged_log_id,
            "opened raft log"
        );

        Ok(Self {
            paths,
            inner: Arc::new(Mutex::new(LogInner {
                last_purged_log_id: log.last_purged_log_id,
                entries: log
                    .entries
                    .into_iter()
                    .map(|ent| (ent.log_id.index, ent))
                    .collect(),
                vote,
                committed,
            })),
        })
    }

    async fn flush_log(&self, inner: &LogInner) -> Result<(), openraft::StorageError<NodeId>> {
        write_json(&self.paths.log_json(), &inner.persisted())
            .await
            .map_err(|e| io_err(ErrorSubject::Logs, ErrorVerb::Write, e))
    }
}

impl RaftLogReader<TypeConfig> for FileLogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + openraft::OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry>, openraft::StorageError<NodeId>> {
        let inner = self.inner.lock().await;
        Ok(inner.entries.range(range).map(|(_, ent)| ent.clone()).collect())
    }
}

impl RaftLogStorage<TypeConfig> for FileLogStore {
    type LogReader = FileLogStore;

    async fn get_log_state(
        &mut self,
    ) -> Result<LogState<TypeConfig>, openraft::StorageError<NodeId>> {
        let inner = self.inner.lock().await;
        Ok(LogState {
            last_purged_log_id: inner.last_purged_log_id,
            last_log_id: inner.last_log_id(),
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(
        &mut self,
        vote: &Vote<NodeId>,
    ) -> Result<(), openraft::StorageError<NodeId>> {
        let mut inner = self.inner.lock().await;
        inner.vote = Some(*vote);
        write_json(&self.paths.vote_json(), vote)
            .await
            .map_err(|e| io_err(ErrorSubject::Vote, ErrorVerb::Write, e))
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, openraft::StorageError<NodeId>> {
        Ok(self.inner.lock().await.vote)
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), openraft::StorageError<NodeId>> {
        let mut inner = self.inner.lock().await;
        inner.committed = committed;
        if let Some(committed) = &inner.committed {
            write_json(&self.paths.committed_json(), committed)
                .await
                .map_err(|e| io_err(ErrorSubject::Store, ErrorVerb::Write, e))?;
        }
        Ok(())
    }

    async fn read_committed(
        &mut self,
    ) -> Result<Option<LogId<NodeId>>, openraft::StorageError<NodeId>> {
        Ok(self.inner.lock().await.committed)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: openraft::storage::LogFlushed<TypeConfig>,
    ) -> Result<(), openraft::StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry> + openraft::OptionalSend,
        I::IntoIter: openraft::OptionalSend,
    {
        let mut inner = self.inner.lock().await;
        for ent in entries {
            inner.entries.insert(ent.log_id.index, ent);
        }

        let res = self.flush_log(&inner).await;
        callback.log_io_completed(
            res.as_ref()
                .map(|_| ())
                .map_err(|e| std::io::Error::other(e.to_string())),
        );
        res
    }

    async fn truncate(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), openraft::StorageError<NodeId>> {
        let mut inner = self.inner.lock().await;
        inner.entries.split_off(&log_id.index);
        self.flush_log(&inner).await
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), openraft::StorageError<NodeId>> {
        let mut inner = self.inner.lock().await;
        inner.entries = inner.entries.split_off(&(log_id.index + 1));
        inner.last_purged_log_id = Some(log_id);
        self.flush_log(&inner).await
    }
}
