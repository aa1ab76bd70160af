//! Consensus glue: openraft type config, storage adapters, HTTP transport and the facade the
//! dispatcher submits through.

pub mod app;
pub mod http_rpc;
pub mod network_http;
pub mod runtime;
pub mod storage;
pub mod types;

pub use types::{NodeId, NodeMeta, TypeConfig};
