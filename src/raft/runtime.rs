use std::{path::Path, sync::Arc};

use anyhow::Context;

use crate::{
    raft::{
        app::RealRaft,
        network_http::HttpNetworkFactory,
        storage::{FileLogStore, KvStateMachine},
        types::{NodeId, TypeConfig},
    },
    store::Store,
};

pub const CLUSTER_NAME: &str = "choo";

/// Open the log and state machine under `data_dir` and start the Raft engine.
///
/// A snapshot is built every `snapshot_logs` applied entries. Cluster initialization is left to
/// the caller since it depends on whether this node bootstraps or joins.
pub async fn start_raft(
    data_dir: &Path,
    node_id: NodeId,
    store: Arc<Store>,
    network: HttpNetworkFactory,
    snapshot_logs: u64,
) -> anyhow::Result<RealRaft> {
    let config = openraft::Config {
        cluster_name: CLUSTER_NAME.to_string(),
        heartbeat_interval: 250,
        election_timeout_min: 1_000,
        election_timeout_max: 2_000,
        install_snapshot_timeout: 10_000,
        snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(snapshot_logs),
        ..Default::default()
    }
    .validate()
    .map_err(|e| anyhow::anyhow!("raft config validate: {e}"))?;

    let log_store = FileLogStore::open(data_dir)
        .await
        .map_err(|e| anyhow::anyhow!("open log store: {e}"))?;
    let state_machine = KvStateMachine::open(data_dir, store)
        .await
        .map_err(|e| anyhow::anyhow!("open state machine: {e}"))?;

    let raft = openraft::Raft::<TypeConfig>::new(
        node_id,
        Arc::new(config),
        network,
        log_store,
        state_machine,
    )
    .await
    .context("start raft")?;

    Ok(RealRaft::new(raft))
}
