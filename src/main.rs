use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = choo::config::Cli::parse();
    let cmd = cli.command.clone().unwrap_or(choo::config::Command::Run);

    match cmd {
        choo::config::Command::Run => run_server(cli.config).await,
        choo::config::Command::Shell(args) => choo::shell::run(&args.server).await,
    }
}

async fn run_server(config: choo::config::Config) -> Result<()> {
    let advertise_url = config.advertise_url();
    let store = Arc::new(choo::store::Store::new());

    let raft = choo::raft::runtime::start_raft(
        &config.data_dir,
        config.node_id,
        store.clone(),
        choo::raft::network_http::HttpNetworkFactory::new(),
        config.snapshot_logs,
    )
    .await?;

    if config.bootstrap {
        let node_meta = choo::raft::NodeMeta {
            addr: advertise_url.clone(),
        };
        raft.initialize_single_node_if_needed(config.node_id, node_meta)
            .await?;
    }

    let raft_rpc = raft.raft();
    let raft_facade: Arc<dyn choo::raft::app::RaftFacade> = Arc::new(raft);
    let dispatcher =
        choo::dispatch::Dispatcher::new(store, raft_facade, config.submit_timeout());

    let app = choo::http::build_router(dispatcher, Some(raft_rpc.clone()))
        .layer(TraceLayer::new_for_http());

    info!(
        node_id = config.node_id,
        bind = %config.bind,
        advertise_url = %advertise_url,
        data_dir = %config.data_dir.display(),
        "starting choo"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    raft_rpc
        .shutdown()
        .await
        .map_err(|e| anyhow::anyhow!("raft shutdown: {e}"))?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
