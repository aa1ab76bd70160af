use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use serde::Serialize;
use tokio::sync::watch;

use crate::{
    raft::types::{ClientRequest, ClientResponse, NodeId, NodeMeta, TypeConfig},
    store::Store,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type Metrics = openraft::RaftMetrics<NodeId, NodeMeta>;

/// The consensus engine as seen by the dispatcher and the HTTP layer.
pub trait RaftFacade: Send + Sync + 'static {
    fn metrics(&self) -> watch::Receiver<Metrics>;

    /// Append an encoded command to the replicated log and wait until it is applied locally, or
    /// until `timeout` elapses.
    fn submit(
        &self,
        bytes: Vec<u8>,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<ClientResponse, SubmitError>>;

    /// Add `node_id` at `addr` as a learner, then promote it to voter.
    fn add_member(&self, node_id: NodeId, addr: String) -> BoxFuture<'_, anyhow::Result<()>>;

    fn status(&self) -> ClusterStatus {
        ClusterStatus::from_metrics(&self.metrics().borrow())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// This node cannot accept writes; retry against the leader, if one is known.
    NotLeader {
        leader_id: Option<NodeId>,
        leader_addr: Option<String>,
    },
    /// The wait elapsed. The entry may still commit later: the outcome is unknown.
    Timeout(Duration),
    /// Any other engine failure (no quorum, shutting down, storage error).
    Raft(String),
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotLeader {
                leader_id: Some(id),
                leader_addr,
            } => {
                write!(f, "not leader; current leader is node {id}")?;
                if let Some(addr) = leader_addr {
                    write!(f, " at {addr}")?;
                }
                Ok(())
            }
            Self::NotLeader {
                leader_id: None, ..
            } => write!(f, "not leader; no leader is currently known"),
            Self::Timeout(timeout) => write!(
                f,
                "timed out after {}ms waiting for commit; outcome unknown",
                timeout.as_millis()
            ),
            Self::Raft(message) => write!(f, "raft: {message}"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Node identity, leadership and health as reported by `INFO`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterStatus {
    pub node_id: NodeId,
    pub leader_id: Option<NodeId>,
    pub state: String,
    pub healthy: bool,
    pub current_term: u64,
    pub last_log_index: Option<u64>,
    pub last_applied_index: Option<u64>,
    pub voters: Vec<NodeId>,
    pub members: BTreeMap<NodeId, String>,
}

impl ClusterStatus {
    pub fn from_metrics(metrics: &Metrics) -> Self {
        Self {
            node_id: metrics.id,
            leader_id: metrics.current_leader,
            state: format!("{:?}", metrics.state),
            healthy: metrics.running_state.is_ok(),
            current_term: metrics.current_term,
            last_log_index: metrics.last_log_index,
            last_applied_index: metrics.last_applied.map(|l| l.index),
            voters: metrics.membership_config.voter_ids().collect(),
            members: metrics
                .membership_config
                .nodes()
                .map(|(id, node)| (*id, node.addr.clone()))
                .collect(),
        }
    }
}

#[derive(Clone)]
pub struct RealRaft {
    raft: openraft::Raft<TypeConfig>,
    metrics: watch::Receiver<Metrics>,
}

impl RealRaft {
    pub fn new(raft: openraft::Raft<TypeConfig>) -> Self {
        let metrics = raft.metrics();
        Self { raft, metrics }
    }

    pub fn raft(&self) -> openraft::Raft<TypeConfig> {
        self.raft.clone()
    }

    pub async fn initialize_single_node_if_needed(
        &self,
        node_id: NodeId,
        node_meta: NodeMeta,
    ) -> anyhow::Result<()> {
        let initialized = self
            .raft
            .is_initialized()
            .await
            .context("raft is_initialized")?;
        if initialized {
            return Ok(());
        }
        let nodes = BTreeMap::from([(node_id, node_meta)]);
        self.raft
            .initialize(nodes)
            .await
            .map_err(|e| anyhow::anyhow!("raft initialize: {e}"))?;
        tracing::info!(node_id, "initialized single-node cluster");
        Ok(())
    }
}

impl RaftFacade for RealRaft {
    fn metrics(&self) -> watch::Receiver<Metrics> {
        self.metrics.clone()
    }

    fn submit(
        &self,
        bytes: Vec<u8>,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<ClientResponse, SubmitError>> {
        Box::pin(async move {
            // Dropping the write future on timeout only abandons the wait; an entry that was
            // already appended keeps replicating.
            let res = tokio::time::timeout(timeout, self.raft.client_write(ClientRequest(bytes)))
                .await
                .map_err(|_| SubmitError::Timeout(timeout))?;
            match res {
                Ok(resp) => Ok(resp.data),
                Err(err) => {
                    if let Some(openraft::error::ClientWriteError::ForwardToLeader(forward)) =
                        err.api_error()
                    {
                        let metrics = self.metrics.borrow().clone();
                        return Err(SubmitError::NotLeader {
                            leader_id: forward.leader_id,
                            leader_addr: leader_addr_from_forward(forward, &metrics),
                        });
                    }
                    Err(SubmitError::Raft(err.to_string()))
                }
            }
        })
    }

    fn add_member(&self, node_id: NodeId, addr: String) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.raft
                .add_learner(node_id, NodeMeta { addr: addr.clone() }, true)
                .await
                .map_err(|e| anyhow::anyhow!("raft add_learner: {e}"))?;
            self.raft
                .change_membership(
                    openraft::ChangeMembers::AddVoterIds(BTreeSet::from([node_id])),
                    true,
                )
                .await
                .map_err(|e| anyhow::anyhow!("raft change_membership(add_voters): {e}"))?;
            tracing::info!(node_id, addr = %addr, "added voter");
            Ok(())
        })
    }
}

fn leader_addr_from_forward(
    forward: &openraft::error::ForwardToLeader<NodeId, NodeMeta>,
    metrics: &Metrics,
) -> Option<String> {
    if let Some(node) = forward.leader_node.as_ref()
        && !node.addr.is_empty()
    {
        return Some(node.addr.clone());
    }
    let leader_id = forward.leader_id.or(metrics.current_leader)?;
    metrics
        .membership_config
        .nodes()
        .find(|(id, _node)| **id == leader_id)
        .map(|(_id, node)| node.addr.clone())
        .filter(|addr| !addr.is_empty())
}

/// A Raft facade that applies commands straight to a local store, for tests and tooling that
/// need the dispatch path without a running cluster.
#[derive(Clone)]
pub struct LocalRaft {
    store: Arc<Store>,
    metrics: watch::Receiver<Metrics>,
}

impl LocalRaft {
    pub fn new(store: Arc<Store>, metrics: watch::Receiver<Metrics>) -> Self {
        Self { store, metrics }
    }
}

impl RaftFacade for LocalRaft {
    fn metrics(&self) -> watch::Receiver<Metrics> {
        self.metrics.clone()
    }

    fn submit(
        &self,
        bytes: Vec<u8>,
        _timeout: Duration,
    ) -> BoxFuture<'_, Result<ClientResponse, SubmitError>> {
        Box::pin(async move { Ok(ClientResponse::from_apply(self.store.apply(&bytes).await)) })
    }

    fn add_member(&self, _node_id: NodeId, _addr: String) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move { Ok(()) })
    }
}

/// Metrics of a healthy single-voter cluster led by `node_id`, for driving [`LocalRaft`].
pub fn leader_metrics(node_id: NodeId, addr: &str) -> Metrics {
    let mut metrics = openraft::RaftMetrics::new_initial(node_id);
    metrics.current_term = 3;
    metrics.state = openraft::ServerState::Leader;
    metrics.current_leader = Some(node_id);
    let nodes = BTreeMap::from([(
        node_id,
        NodeMeta {
            addr: addr.to_string(),
        },
    )]);
    let membership = openraft::Membership::new(vec![BTreeSet::from([node_id])], nodes);
    metrics.membership_config = Arc::new(openraft::StoredMembership::new(None, membership));
    metrics
}
