pub mod command;
pub mod config;
pub mod dispatch;
pub mod http;
pub mod query;
pub mod raft;
pub mod shell;
pub mod store;
