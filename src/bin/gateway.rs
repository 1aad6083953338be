//! Process entry point: loads `gateway.ini`, builds the runtime and
//! every long-lived component, starts the peer connector and the TCP
//! accept loop, and blocks until interrupted.

use std::env;
use std::fs;
use std::process::ExitCode;
use std::sync::Arc;

use ppc_gateway::async_runtime::Runtime;
use ppc_gateway::cache::RedisCache;
use ppc_gateway::config::GatewayConfig;
use ppc_gateway::gateway::Gateway;
use ppc_gateway::peer::tcp::{accept_loop, TcpTransport};
use ppc_gateway::peer::PeerConnector;
use ppc_gateway::task::{CachedTaskManager, TaskManager};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = env::args().nth(1).unwrap_or_else(|| "gateway.ini".to_owned());
    let config = match fs::read_to_string(&config_path).map_err(ppc_gateway::Error::from).and_then(|text| {
        GatewayConfig::from_str(&text)
    }) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = config_path.as_str(), error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match Runtime::new(config.thread_count) {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to build async runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run(config));

    if let Err(e) = result {
        tracing::error!(error = %e, "gateway exited with an error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(config: GatewayConfig) -> ppc_gateway::Result<()> {
    let tasks: Arc<dyn ppc_gateway::task::TaskRouting> = if config.disable_cache {
        Arc::new(TaskManager::new())
    } else {
        let cache = RedisCache::connect(&config.cache).await?;
        Arc::new(CachedTaskManager::new(Arc::new(cache)))
    };

    let transport = Arc::new(TcpTransport::new(config.agency_id.clone()));
    let peers = PeerConnector::new(transport, config.max_allow_msg_size, config.reconnect_time);

    let gateway = Gateway::new(tasks, peers.clone(), config.holding_msg_timeout);

    peers.start(config.agencies.clone(), gateway.ingress_handler()).await;

    let listener = tokio::net::TcpListener::bind(config.listen_addr())
        .await
        .map_err(ppc_gateway::Error::from)?;
    tracing::info!(addr = config.listen_addr().as_str(), "listening for peer connections");

    // the RPC front-end that would otherwise expose `GatewayApi` to
    // local fronts is out of scope; this binary only drives peer
    // connectivity.
    let accept_running = ppc_gateway::async_runtime::RunningFlag::new();
    tokio::spawn(accept_loop(listener, peers.clone(), gateway.ingress_handler(), accept_running.clone()));

    tokio::signal::ctrl_c().await.map_err(ppc_gateway::Error::from)?;
    tracing::info!("shutdown signal received");
    accept_running.stop();
    gateway.stop();

    Ok(())
}
