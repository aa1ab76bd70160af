//! Replicated key-value state machine.
//!
//! All state transitions happen through [`Store::apply`], which the Raft state machine adapter
//! calls once per committed log entry, in commit order. Reads go through [`Store::get`] and only
//! ever observe committed state.
//!
//! Invariants:
//! - `apply` is deterministic: the same entry sequence yields the same map on every replica.
//! - Input is fully decoded before the write lock is taken; a rejected entry never mutates.
//! - `restore` replaces the whole map or nothing.

use std::{
    collections::BTreeMap,
    io::{self, Write as _},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt as _},
    sync::RwLock,
};

use crate::command::{Command, CommandError};

pub type KvMap = BTreeMap<String, String>;

/// In-memory key-value map guarded by a single readers-writer lock.
///
/// `tokio::sync::RwLock` queues waiters fairly, so a steady stream of readers cannot starve a
/// pending `apply` and a burst of writes cannot starve readers.
#[derive(Debug, Default)]
pub struct Store {
    map: RwLock<KvMap>,
}

/// Outcome of a successfully applied command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Applied {
    Set { key: String },
    Deleted { key: String, existed: bool },
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one committed log entry.
    pub async fn apply(&self, raw: &[u8]) -> Result<Applied, CommandError> {
        let cmd = Command::decode(raw)?;
        Ok(self.apply_command(cmd).await)
    }

    async fn apply_command(&self, cmd: Command) -> Applied {
        let mut map = self.map.write().await;
        match cmd {
            Command::Set { key, value } => {
                map.insert(key.clone(), value);
                Applied::Set { key }
            }
            Command::Delete { key } => {
                let existed = map.remove(&key).is_some();
                Applied::Deleted { key, existed }
            }
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.map.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.map.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.map.read().await.is_empty()
    }

    /// Freeze the current map. Writers wait only for the copy; other readers proceed.
    pub async fn snapshot(&self) -> Snapshot {
        let state = self.map.read().await.clone();
        Snapshot { state }
    }

    /// Replace the whole map with the one serialized in `reader`.
    ///
    /// The stream is read and decoded before the write lock is taken, so any failure leaves the
    /// current map untouched.
    pub async fn restore<R>(&self, mut reader: R) -> Result<(), RestoreError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(RestoreError::Read)?;
        let state: KvMap = serde_json::from_slice(&buf).map_err(RestoreError::Decode)?;

        let mut map = self.map.write().await;
        *map = state;
        Ok(())
    }
}

/// Immutable point-in-time copy of a [`Store`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    state: KvMap,
}

impl Snapshot {
    pub fn state(&self) -> &KvMap {
        &self.state
    }

    /// Serialize the frozen map into `sink`.
    ///
    /// A failed write cancels the sink before the error is returned; a successful one closes it.
    pub fn persist<S: SnapshotSink + ?Sized>(&self, sink: &mut S) -> Result<(), PersistError> {
        let bytes = match serde_json::to_vec(&self.state) {
            Ok(bytes) => bytes,
            Err(e) => {
                cancel_quietly(sink);
                return Err(PersistError::Encode(e));
            }
        };

        if let Err(e) = sink.write_all(&bytes) {
            cancel_quietly(sink);
            return Err(PersistError::Write(e));
        }

        if let Err(e) = sink.close() {
            cancel_quietly(sink);
            return Err(PersistError::Close(e));
        }
        Ok(())
    }

    /// The snapshot holds no external resources; dropping the copy is all there is to do.
    pub fn release(self) {
        tracing::trace!(keys = self.state.len(), "snapshot released");
    }
}

fn cancel_quietly<S: SnapshotSink + ?Sized>(sink: &mut S) {
    if let Err(e) = sink.cancel() {
        tracing::warn!(error = %e, "snapshot sink cancel failed");
    }
}

/// Destination of a persisted snapshot.
///
/// `close` marks the artifact complete; `cancel` discards whatever was written so far.
pub trait SnapshotSink {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;

    fn cancel(&mut self) -> io::Result<()>;
}

/// Sink that writes next to `path` and renames into place on close.
#[derive(Debug)]
pub struct FileSnapshotSink {
    path: PathBuf,
    tmp: PathBuf,
    file: Option<std::fs::File>,
}

impl FileSnapshotSink {
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        let file = std::fs::File::create(&tmp)?;
        Ok(Self {
            path,
            tmp,
            file: Some(file),
        })
    }
}

impl SnapshotSink for FileSnapshotSink {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("snapshot sink already finished"))?;
        file.write_all(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        let file = self
            .file
            .take()
            .ok_or_else(|| io::Error::other("snapshot sink already finished"))?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&self.tmp, &self.path)
    }

    fn cancel(&mut self) -> io::Result<()> {
        self.file = None;
        match std::fs::remove_file(&self.tmp) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug)]
pub enum PersistError {
    Encode(serde_json::Error),
    Write(io::Error),
    Close(io::Error),
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "encode snapshot: {e}"),
            Self::Write(e) => write!(f, "write snapshot: {e}"),
            Self::Close(e) => write!(f, "close snapshot: {e}"),
        }
    }
}

impl std::error::Error for PersistError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Encode(e) => Some(e),
            Self::Write(e) | Self::Close(e) => Some(e),
        }
    }
}

#[derive(Debug)]
pub enum RestoreError {
    Read(io::Error),
    Decode(serde_json::Error),
}

impl std::fmt::Display for RestoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read(e) => write!(f, "read snapshot: {e}"),
            Self::Decode(e) => write!(f, "decode snapshot: {e}"),
        }
    }
}

impl std::error::Error for RestoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Read(e) => Some(e),
            Self::Decode(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, sync::Arc};

    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Debug, Default)]
    struct MemorySink {
        buf: Vec<u8>,
        fail_writes: bool,
        closed: bool,
        cancelled: bool,
    }

    impl SnapshotSink for MemorySink {
        fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            if self.fail_writes {
                return Err(io::Error::other("disk full"));
            }
            self.buf.extend_from_slice(buf);
            Ok(())
        }

        fn close(&mut self) -> io::Result<()> {
            self.closed = true;
            Ok(())
        }

        fn cancel(&mut self) -> io::Result<()> {
            self.cancelled = true;
            self.buf.clear();
            Ok(())
        }
    }

    async fn apply_all(store: &Store, cmds: &[Command]) {
        for cmd in cmds {
            store.apply(&cmd.encode()).await.unwrap();
        }
    }

    async fn contents(store: &Store) -> KvMap {
        store.snapshot().await.state().clone()
    }

    #[tokio::test]
    async fn overwrite_then_delete() {
        let store = Store::new();
        apply_all(
            &store,
            &[Command::set("k1", "v1"), Command::set("k1", "v2")],
        )
        .await;
        assert_eq!(store.get("k1").await.as_deref(), Some("v2"));

        let applied = store.apply(&Command::delete("k1").encode()).await.unwrap();
        assert_eq!(
            applied,
            Applied::Deleted {
                key: "k1".to_string(),
                existed: true
            }
        );
        assert_eq!(store.get("k1").await, None);

        let applied = store.apply(&Command::delete("k1").encode()).await.unwrap();
        assert_eq!(
            applied,
            Applied::Deleted {
                key: "k1".to_string(),
                existed: false
            }
        );
    }

    #[tokio::test]
    async fn replaying_the_same_sequence_is_deterministic() {
        let cmds = [
            Command::set("a", "1"),
            Command::set("b", "2"),
            Command::delete("a"),
            Command::set("c", "3"),
            Command::set("b", "20"),
            Command::delete("missing"),
        ];
        let first = Store::new();
        let second = Store::new();
        apply_all(&first, &cmds).await;
        apply_all(&second, &cmds).await;

        assert_eq!(contents(&first).await, contents(&second).await);
        assert_eq!(first.len().await, 2);
    }

    #[tokio::test]
    async fn malformed_entry_does_not_mutate() {
        let store = Store::new();
        apply_all(&store, &[Command::set("k", "v")]).await;

        let err = store.apply(b"{\"op\":\"set\"").await.unwrap_err();
        assert!(matches!(err, CommandError::Decode { .. }));

        let err = store
            .apply(br#"{"op":"truncate","key":"k"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::UnsupportedOperation { .. }));

        assert_eq!(
            contents(&store).await,
            KvMap::from([("k".to_string(), "v".to_string())])
        );
    }

    #[tokio::test]
    async fn snapshot_is_isolated_from_later_writes() {
        let store = Store::new();
        apply_all(&store, &[Command::set("a", "1"), Command::set("b", "2")]).await;

        let snapshot = store.snapshot().await;
        apply_all(&store, &[Command::set("a", "changed"), Command::delete("b")]).await;

        let mut sink = MemorySink::default();
        snapshot.persist(&mut sink).unwrap();
        snapshot.release();
        assert!(sink.closed);
        assert!(!sink.cancelled);

        let restored = Store::new();
        restored.restore(Cursor::new(sink.buf)).await.unwrap();
        assert_eq!(
            contents(&restored).await,
            KvMap::from([
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ])
        );
        assert_eq!(store.get("a").await.as_deref(), Some("changed"));
    }

    #[tokio::test]
    async fn restore_replaces_whole_map() {
        let store = Store::new();
        apply_all(&store, &[Command::set("old", "x")]).await;

        store
            .restore(Cursor::new(br#"{"new":"y"}"#.to_vec()))
            .await
            .unwrap();

        assert_eq!(store.get("old").await, None);
        assert_eq!(store.get("new").await.as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn malformed_restore_leaves_store_untouched() {
        let store = Store::new();
        apply_all(&store, &[Command::set("k", "v")]).await;
        let before = contents(&store).await;

        for raw in [
            &b""[..],
            b"{\"a\":\"1\"",
            b"[\"a\",\"b\"]",
            br#"{"a":1}"#,
            br#"{"a":"1"} trailing"#,
        ] {
            let err = store.restore(Cursor::new(raw.to_vec())).await.unwrap_err();
            assert!(matches!(err, RestoreError::Decode(_)), "{raw:?}");
        }

        assert_eq!(contents(&store).await, before);
    }

    #[tokio::test]
    async fn failed_persist_cancels_sink() {
        let store = Store::new();
        apply_all(&store, &[Command::set("k", "v")]).await;
        let snapshot = store.snapshot().await;

        let mut sink = MemorySink {
            fail_writes: true,
            ..Default::default()
        };
        let err = snapshot.persist(&mut sink).unwrap_err();
        snapshot.release();

        assert!(matches!(err, PersistError::Write(_)));
        assert!(sink.cancelled);
        assert!(!sink.closed);
        assert!(sink.buf.is_empty());
    }

    #[test]
    fn file_sink_renames_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap").join("current.json");
        let snapshot = Snapshot {
            state: KvMap::from([("k".to_string(), "v".to_string())]),
        };

        let mut sink = FileSnapshotSink::create(&path).unwrap();
        snapshot.persist(&mut sink).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), br#"{"k":"v"}"#);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn file_sink_cancel_leaves_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("current.json");

        let mut sink = FileSnapshotSink::create(&path).unwrap();
        sink.write_all(b"{\"partial\":").unwrap();
        sink.cancel().unwrap();

        assert!(!path.exists());
        assert!(!path.with_extension("tmp").exists());
        assert!(sink.write_all(b"more").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reads_during_snapshot_see_a_single_point() {
        let store = Arc::new(Store::new());
        for i in 0..1_000 {
            store
                .apply(&Command::set(format!("k{i:04}"), "0").encode())
                .await
                .unwrap();
        }

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for round in 1..=20 {
                    store
                        .apply(&Command::set("round", round.to_string()).encode())
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            readers.push(tokio::spawn(async move {
                let mut last = 0u32;
                for _ in 0..50 {
                    let seen = store
                        .get("round")
                        .await
                        .map(|v| v.parse::<u32>().unwrap())
                        .unwrap_or(0);
                    assert!(seen >= last, "reads went backwards: {seen} < {last}");
                    last = seen;
                }
            }));
        }

        let snapshots: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.snapshot().await })
            })
            .collect();

        for reader in readers {
            reader.await.unwrap();
        }
        writer.await.unwrap();
        for snapshot in snapshots {
            let snapshot = snapshot.await.unwrap();
            assert!(snapshot.state().len() >= 1_000);
            snapshot.release();
        }
        assert_eq!(store.get("round").await.as_deref(), Some("20"));
    }
}
