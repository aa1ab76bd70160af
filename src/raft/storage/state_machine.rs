use std::{io::Cursor, path::Path, sync::Arc};

use openraft::entry::RaftPayload as _;
use openraft::{
    EntryPayload, ErrorSubject, ErrorVerb, LogId, Snapshot, SnapshotMeta, StoredMembership,
    storage::RaftStateMachine,
};
use tokio::sync::Mutex;

use super::{StorePaths, blocking, io_err, read_json, write_json};
use crate::{
    raft::types::{ClientResponse, NodeId, NodeMeta, TypeConfig},
    store::{FileSnapshotSink, SnapshotSink as _, Store},
};

#[derive(Debug, Default)]
struct AppliedState {
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, NodeMeta>,
}

/// Raft state machine backed by the shared [`Store`].
///
/// `applied` is held across each store mutation and each snapshot copy, so a snapshot's
/// `last_log_id` always matches the map it was taken from. `published` is the `last_log_id` of
/// the snapshot `current_meta.json` points at; it is held while a snapshot's files are written
/// and published, so builds and installs never touch the directory at the same time.
#[derive(Debug, Clone)]
pub struct KvStateMachine {
    store: Arc<Store>,
    paths: StorePaths,
    applied: Arc<Mutex<AppliedState>>,
    published: Arc<Mutex<Option<LogId<NodeId>>>>,
}

impl KvStateMachine {
    /// Open the state machine and re-install the latest on-disk snapshot, if any.
    pub async fn open(
        data_dir: &Path,
        store: Arc<Store>,
    ) -> Result<Self, openraft::StorageError<NodeId>> {
        let paths = StorePaths::new(data_dir);
        paths
            .ensure_dirs()
            .map_err(|e| io_err(ErrorSubject::StateMachine, ErrorVerb::Write, e))?;

        let mut applied = AppliedState::default();
        let mut published = None;
        if let Some((meta, bytes)) = read_current_snapshot(&paths).await? {
            store
                .restore(bytes.as_slice())
                .await
                .map_err(|e| snapshot_err(Some(&meta), ErrorVerb::Read, e))?;
            tracing::info!(
                snapshot_id = %meta.snapshot_id,
                last_log_id = ?meta.last_log_id,
                "restored state machine from snapshot"
            );
            published = meta.last_log_id;
            applied.last_applied = meta.last_log_id;
            applied.last_membership = meta.last_membership;
        }

        Ok(Self {
            store,
            paths,
            applied: Arc::new(Mutex::new(applied)),
            published: Arc::new(Mutex::new(published)),
        })
    }
}

/// Builds snapshots from a frozen copy of the store.
#[derive(Debug)]
pub struct KvSnapshotBuilder {
    store: Arc<Store>,
    paths: StorePaths,
    applied: Arc<Mutex<AppliedState>>,
    published: Arc<Mutex<Option<LogId<NodeId>>>>,
}

impl openraft::RaftSnapshotBuilder<TypeConfig> for KvSnapshotBuilder {
    async fn build_snapshot(
        &mut self,
    ) -> Result<Snapshot<TypeConfig>, openraft::StorageError<NodeId>> {
        let (snapshot, last_applied, last_membership) = {
            let applied = self.applied.lock().await;
            let snapshot = self.store.snapshot().await;
            (
                snapshot,
                applied.last_applied,
                applied.last_membership.clone(),
            )
        };

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership,
            snapshot_id: format!(
                "snapshot-{}",
                last_applied.as_ref().map(|l| l.index).unwrap_or(0)
            ),
        };

        let data_path = self.paths.snapshot_data_json(&meta.snapshot_id);
        let keys = snapshot.state().len();
        let mut published = self.published.lock().await;
        let bytes = blocking(move || {
            let mut sink = FileSnapshotSink::create(&data_path)?;
            let persisted = snapshot.persist(&mut sink);
            snapshot.release();
            persisted.map_err(std::io::Error::other)?;
            std::fs::read(&data_path)
        })
        .await
        .map_err(|e| io_err(ErrorSubject::Snapshot(Some(meta.signature())), ErrorVerb::Write, e))?;

        if !publish_snapshot_meta(&self.paths, &mut published, &meta).await? {
            let stale = self.paths.snapshot_data_json(&meta.snapshot_id);
            if let Err(e) = blocking(move || std::fs::remove_file(stale)).await {
                tracing::warn!(error = %e, "remove stale snapshot data");
            }
        }
        drop(published);

        tracing::info!(
            snapshot_id = %meta.snapshot_id,
            last_log_id = ?meta.last_log_id,
            keys,
            "built snapshot"
        );

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(bytes)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for KvStateMachine {
    type SnapshotBuilder = KvSnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<
        (Option<LogId<NodeId>>, StoredMembership<NodeId, NodeMeta>),
        openraft::StorageError<NodeId>,
    > {
        let applied = self.applied.lock().await;
        Ok((applied.last_applied, applied.last_membership.clone()))
    }

    async fn apply<I>(
        &mut self,
        entries: I,
    ) -> Result<Vec<ClientResponse>, openraft::StorageError<NodeId>>
    where
        I: IntoIterator<Item = openraft::impls::Entry<TypeConfig>> + openraft::OptionalSend,
        I::IntoIter: openraft::OptionalSend,
    {
        let mut responses = Vec::new();

        for entry in entries {
            let log_id = entry.log_id;
            let mut applied = self.applied.lock().await;

            if let Some(membership) = entry.get_membership() {
                applied.last_membership = StoredMembership::new(Some(log_id), membership.clone());
            }

            let resp = match entry.payload {
                EntryPayload::Normal(req) => {
                    let resp = ClientResponse::from_apply(self.store.apply(&req.0).await);
                    match &resp {
                        ClientResponse::Ok { .. } => {
                            tracing::debug!(index = log_id.index, "applied entry");
                        }
                        ClientResponse::Err { code, message } => {
                            tracing::warn!(
                                index = log_id.index,
                                code = %code,
                                error = %message,
                                "rejected committed entry"
                            );
                        }
                    }
                    resp
                }
                EntryPayload::Membership(_) | EntryPayload::Blank => {
                    ClientResponse::Ok { applied: None }
                }
            };

            applied.last_applied = Some(log_id);
            responses.push(resp);
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        KvSnapshotBuilder {
            store: self.store.clone(),
            paths: self.paths.clone(),
            applied: self.applied.clone(),
            published: self.published.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<
        Box<<TypeConfig as openraft::RaftTypeConfig>::SnapshotData>,
        openraft::StorageError<NodeId>,
    > {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, NodeMeta>,
        snapshot: Box<<TypeConfig as openraft::RaftTypeConfig>::SnapshotData>,
    ) -> Result<(), openraft::StorageError<NodeId>> {
        let bytes = (*snapshot).into_inner();

        {
            let mut applied = self.applied.lock().await;
            self.store
                .restore(bytes.as_slice())
                .await
                .map_err(|e| snapshot_err(Some(meta), ErrorVerb::Read, e))?;
            applied.last_applied = meta.last_log_id;
            applied.last_membership = meta.last_membership.clone();
        }

        let mut published = self.published.lock().await;
        let data_path = self.paths.snapshot_data_json(&meta.snapshot_id);
        blocking(move || {
            let mut sink = FileSnapshotSink::create(&data_path)?;
            if let Err(e) = sink.write_all(&bytes) {
                let _ = sink.cancel();
                return Err(e);
            }
            sink.close()
        })
        .await
        .map_err(|e| io_err(ErrorSubject::Snapshot(Some(meta.signature())), ErrorVerb::Write, e))?;
        publish_snapshot_meta(&self.paths, &mut published, meta).await?;
        drop(published);

        tracing::info!(
            snapshot_id = %meta.snapshot_id,
            last_log_id = ?meta.last_log_id,
            "installed snapshot"
        );
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, openraft::StorageError<NodeId>> {
        Ok(read_current_snapshot(&self.paths)
            .await?
            .map(|(meta, bytes)| Snapshot {
                meta,
                snapshot: Box::new(Cursor::new(bytes)),
            }))
    }
}

/// Point `current_meta.json` at a fully written data file, then drop older data files.
///
/// Returns `false` without touching the directory when `meta` is older than the snapshot
/// already published. In-progress `*.tmp` files are never removed.
async fn publish_snapshot_meta(
    paths: &StorePaths,
    published: &mut Option<LogId<NodeId>>,
    meta: &SnapshotMeta<NodeId, NodeMeta>,
) -> Result<bool, openraft::StorageError<NodeId>> {
    if meta.last_log_id < *published {
        tracing::info!(
            snapshot_id = %meta.snapshot_id,
            last_log_id = ?meta.last_log_id,
            published = ?published,
            "skip publishing stale snapshot"
        );
        return Ok(false);
    }

    write_json(&paths.snapshot_meta_json(), meta)
        .await
        .map_err(|e| io_err(ErrorSubject::Snapshot(Some(meta.signature())), ErrorVerb::Write, e))?;
    *published = meta.last_log_id;

    let keep = paths.snapshot_data_json(&meta.snapshot_id);
    let dir = paths.snapshot_dir.clone();
    let meta_path = paths.snapshot_meta_json();
    let cleanup = blocking(move || {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let in_progress = path.extension().is_some_and(|ext| ext == "tmp");
            if path != keep && path != meta_path && !in_progress {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    })
    .await;
    if let Err(e) = cleanup {
        tracing::warn!(error = %e, "remove stale snapshot files");
    }
    Ok(true)
}

async fn read_current_snapshot(
    paths: &StorePaths,
) -> Result<Option<(SnapshotMeta<NodeId, NodeMeta>, Vec<u8>)>, openraft::StorageError<NodeId>> {
    let meta = read_json::<SnapshotMeta<NodeId, NodeMeta>>(&paths.snapshot_meta_json())
        .await
        .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?;
    let Some(meta) = meta else {
        return Ok(None);
    };

    let data_path = paths.snapshot_data_json(&meta.snapshot_id);
    let bytes = blocking(move || std::fs::read(data_path))
        .await
        .map_err(|e| io_err(ErrorSubject::Snapshot(Some(meta.signature())), ErrorVerb::Read, e))?;
    Ok(Some((meta, bytes)))
}

fn snapshot_err(
    meta: Option<&SnapshotMeta<NodeId, NodeMeta>>,
    verb: ErrorVerb,
    err: impl std::error::Error + Send + Sync + 'static,
) -> openraft::StorageError<NodeId> {
    io_err(
        ErrorSubject::Snapshot(meta.map(|m| m.signature())),
        verb,
        std::io::Error::other(err),
    )
}
