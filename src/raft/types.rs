use std::io::Cursor;

use serde::{Deserialize, Serialize};

use crate::{
    command::CommandError,
    store::Applied,
};

/// Raft node identifier type for this project.
pub type NodeId = u64;

/// Raft node metadata stored in the membership config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    /// Base URL serving both the client API and the Raft RPC routes.
    pub addr: String,
}

/// State-machine command submitted to Raft: an encoded [`crate::command::Command`].
///
/// The log carries the encoded bytes rather than the decoded command so that every replica runs
/// the same decode-and-validate step when the entry commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest(pub Vec<u8>);

/// State-machine response to a committed `ClientRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClientResponse {
    /// The entry was applied. Blank and membership entries carry no result.
    Ok { applied: Option<Applied> },
    /// The entry committed but the state machine rejected it without mutating.
    Err { code: String, message: String },
}

impl ClientResponse {
    pub fn from_apply(result: Result<Applied, CommandError>) -> Self {
        match result {
            Ok(applied) => Self::Ok {
                applied: Some(applied),
            },
            Err(err) => {
                let code = match err {
                    CommandError::Decode { .. } => "decode_error",
                    CommandError::UnsupportedOperation { .. } => "unsupported_operation",
                };
                Self::Err {
                    code: code.to_string(),
                    message: err.to_string(),
                }
            }
        }
    }
}

/// OpenRaft type configuration for this project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TypeConfig;

impl openraft::RaftTypeConfig for TypeConfig {
    type D = ClientRequest;
    type R = ClientResponse;

    type NodeId = NodeId;
    type Node = NodeMeta;

    type Entry = openraft::impls::Entry<TypeConfig>;
    type Responder = openraft::impls::OneshotResponder<TypeConfig>;
    type AsyncRuntime = openraft::impls::TokioRuntime;

    // Requires tokio `io-util` feature for AsyncRead/Write/Seek impls on Cursor.
    type SnapshotData = Cursor<Vec<u8>>;
}
