use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::raft::types::NodeId;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "choo",
    about = "Replicated key-value store",
    version,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start a node: client API and Raft RPC on one HTTP listener (default).
    Run,

    /// Interactive query shell against a running node.
    Shell(ShellArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ShellArgs {
    #[arg(
        long,
        env = "CHOO_SERVER",
        value_name = "URL",
        default_value = "http://127.0.0.1:8080"
    )]
    pub server: String,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "CHOO_NODE_ID",
        value_name = "ID",
        default_value_t = 1
    )]
    pub node_id: NodeId,

    #[arg(
        long,
        global = true,
        env = "CHOO_BIND",
        value_name = "ADDR",
        default_value = "127.0.0.1:8080"
    )]
    pub bind: SocketAddr,

    /// Base URL peers and clients use to reach this node. Defaults to `http://<bind>`.
    #[arg(long, global = true, env = "CHOO_ADVERTISE_URL", value_name = "URL")]
    pub advertise_url: Option<String>,

    #[arg(
        long,
        global = true,
        env = "CHOO_DATA_DIR",
        value_name = "PATH",
        default_value = "./data"
    )]
    pub data_dir: PathBuf,

    /// Initialize a single-node cluster if this node has no Raft state yet.
    #[arg(
        long,
        global = true,
        env = "CHOO_BOOTSTRAP",
        value_name = "BOOL",
        default_value_t = false,
        num_args = 0..=1,
        default_missing_value = "true",
        action = clap::ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub bootstrap: bool,

    #[arg(
        long = "submit-timeout-ms",
        global = true,
        env = "CHOO_SUBMIT_TIMEOUT_MS",
        value_name = "MS",
        default_value_t = 5_000,
        value_parser = clap::value_parser!(u64).range(1..=60_000)
    )]
    pub submit_timeout_ms: u64,

    /// Build a snapshot after this many applied entries.
    #[arg(
        long = "snapshot-logs",
        global = true,
        env = "CHOO_SNAPSHOT_LOGS",
        value_name = "N",
        default_value_t = 1_000,
        value_parser = clap::value_parser!(u64).range(1..=1_000_000)
    )]
    pub snapshot_logs: u64,
}

impl Config {
    pub fn advertise_url(&self) -> String {
        match &self.advertise_url {
            Some(url) if !url.trim().is_empty() => url.trim_end_matches('/').to_string(),
            _ => format!("http://{}", self.bind),
        }
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_apply_when_flags_absent() {
        let cli = Cli::try_parse_from(["choo"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config.node_id, 1);
        assert_eq!(cli.config.bind, SocketAddr::from(([127, 0, 0, 1], 8080)));
        assert_eq!(cli.config.advertise_url(), "http://127.0.0.1:8080");
        assert_eq!(cli.config.data_dir, PathBuf::from("./data"));
        assert!(!cli.config.bootstrap);
        assert_eq!(cli.config.submit_timeout(), Duration::from_secs(5));
        assert_eq!(cli.config.snapshot_logs, 1_000);
    }

    #[test]
    fn bootstrap_accepts_bare_flag_and_bool_value() {
        let cli = Cli::try_parse_from(["choo", "run", "--bootstrap"]).unwrap();
        assert!(cli.config.bootstrap);
        let cli = Cli::try_parse_from(["choo", "--bootstrap", "false"]).unwrap();
        assert!(!cli.config.bootstrap);
    }

    #[test]
    fn advertise_url_is_trimmed() {
        let cli =
            Cli::try_parse_from(["choo", "--advertise-url", "http://10.0.0.2:9000/"]).unwrap();
        assert_eq!(cli.config.advertise_url(), "http://10.0.0.2:9000");
    }

    #[test]
    fn rejects_invalid_submit_timeout_ms() {
        let err = Cli::try_parse_from(["choo", "--submit-timeout-ms", "0"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--submit-timeout-ms"));
        assert!(msg.contains("1..=60000"));
    }

    #[test]
    fn shell_takes_server_url() {
        let cli = Cli::try_parse_from(["choo", "shell", "--server", "http://n2:8080"]).unwrap();
        match cli.command {
            Some(Command::Shell(args)) => assert_eq!(args.server, "http://n2:8080"),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
