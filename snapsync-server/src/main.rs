use anyhow::Result;
use clap::Parser;
use snapsync_server::{
    AppState, ControlServer, MemoryStore, ReplicationContext, ReplicationWorkerPool, ServerConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "snapsync-server")]
#[command(about = "Snapshot server - streams full resync snapshots to replicas", long_about = None)]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override server host
    #[arg(long)]
    host: Option<String>,

    /// Override server port
    #[arg(short, long)]
    port: Option<u16>,
}

fn init_tracing(config: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));

    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate().map_err(anyhow::Error::msg)?;

    init_tracing(&config);
    info!("Starting Snapsync Server v{}", env!("CARGO_PKG_VERSION"));

    let store = Arc::new(MemoryStore::new());
    let context = Arc::new(ReplicationContext::new(
        store.clone(),
        config.replication.clone(),
    ));
    let pool = ReplicationWorkerPool::new(config.replication.workers);
    let state = Arc::new(AppState::new(
        store,
        context,
        pool,
        config.server.append_reply,
    ));

    let server = ControlServer::bind(&config.server_addr(), Arc::clone(&state)).await?;

    tokio::select! {
        result = server.serve() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            state.shutdown();
        }
    }

    info!("Snapsync Server stopped");
    Ok(())
}
