use std::{sync::Arc, time::Duration};

use crate::{
    command::Command,
    query::Query,
    raft::{
        app::{ClusterStatus, RaftFacade, SubmitError},
        types::ClientResponse,
    },
    store::Store,
};

pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// The command committed and was applied by the local state machine.
    Written { op: &'static str, key: String },
    Found { key: String, value: String },
    NotFound { key: String },
    Info(ClusterStatus),
    Failed(DispatchError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    Submit(SubmitError),
    /// The entry committed but the state machine refused it; nothing was mutated.
    Rejected { code: String, message: String },
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Submit(err) => write!(f, "{err}"),
            Self::Rejected { code, message } => write!(f, "rejected ({code}): {message}"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Submit(err) => Some(err),
            Self::Rejected { .. } => None,
        }
    }
}

impl From<SubmitError> for DispatchError {
    fn from(err: SubmitError) -> Self {
        Self::Submit(err)
    }
}

/// Routes parsed queries: writes go through consensus, reads are served from the local store.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<Store>,
    raft: Arc<dyn RaftFacade>,
    submit_timeout: Duration,
}

impl Dispatcher {
    pub fn new(store: Arc<Store>, raft: Arc<dyn RaftFacade>, submit_timeout: Duration) -> Self {
        Self {
            store,
            raft,
            submit_timeout,
        }
    }

    pub fn raft(&self) -> &Arc<dyn RaftFacade> {
        &self.raft
    }

    pub async fn dispatch(&self, query: Query) -> Response {
        match query {
            Query::Set { key, value } => self.write(Command::set(key, value)).await,
            Query::Delete { key } => self.write(Command::delete(key)).await,
            // Served locally; a follower may lag the leader.
            Query::Get { key } => match self.store.get(&key).await {
                Some(value) => Response::Found { key, value },
                None => Response::NotFound { key },
            },
            Query::Info => Response::Info(self.raft.status()),
        }
    }

    async fn write(&self, command: Command) -> Response {
        let op = command.op();
        let key = command.key().to_string();
        match self.raft.submit(command.encode(), self.submit_timeout).await {
            Ok(ClientResponse::Ok { .. }) => {
                tracing::debug!(op, key = %key, "write committed");
                Response::Written { op, key }
            }
            Ok(ClientResponse::Err { code, message }) => {
                Response::Failed(DispatchError::Rejected { code, message })
            }
            Err(err) => {
                tracing::warn!(op, key = %key, error = %err, "write not committed");
                Response::Failed(err.into())
            }
        }
    }
}
