use std::net::SocketAddr;
use std::sync::Arc;

use pve_pool_common::PoolConfig;
use pve_pool_core::{CloneQueue, CloneWorker, PoolManager, ReplenishLoop, ReqwestPveClient};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use pve_pool_server::{create_app, AppState};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter("info,pve_pool_server=debug,pve_pool_core=debug")
        .init();

    let config = match PoolConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "fatal: invalid configuration");
            std::process::exit(1);
        }
    };

    let pve = match ReqwestPveClient::new(
        config.pve_api_url.clone(),
        config.pve_api_token.clone(),
        config.pve_node.clone(),
        config.pve_verify_tls,
    ) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "fatal: failed to build PVE HTTP client");
            std::process::exit(1);
        }
    };

    let (clone_queue, clone_rx) = CloneQueue::new();
    let manager = PoolManager::new(pve, config, clone_queue.clone());

    info!("running startup discovery against PVE");
    manager.discover().await;

    let cancel = CancellationToken::new();

    let worker = CloneWorker::new(manager.clone(), clone_queue, clone_rx);
    let worker_handle = tokio::spawn(worker.run(cancel.child_token()));

    let replenish = ReplenishLoop::new(manager.clone());
    let replenish_handle = tokio::spawn(replenish.run(cancel.child_token()));

    let state = AppState { manager };
    let app = create_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 8007));
    info!(%addr, "PVE sandbox pool service listening");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "fatal: failed to bind listener");
            std::process::exit(1);
        }
    };

    let shutdown_cancel = cancel.clone();
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown_cancel.cancel();
        })
        .await;

    if let Err(e) = serve_result {
        error!(error = %e, "HTTP server exited with error");
    }

    cancel.cancel();
    let _ = worker_handle.await;
    let _ = replenish_handle.await;
}
