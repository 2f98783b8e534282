use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use reqwest::Client;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use rbac_service::cache::Store;
use rbac_service::config::Config;
use rbac_service::metrics::RbacMetrics;
use rbac_service::policy::RoleScopesMap;
use rbac_service::rpc::RbacServer;
use rbac_service::token::Validator;
use rbac_service::upstream::{ClusterManagerClient, UserManagerClient};

const METRICS_SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "rbac-service", about = "llmo authorization decision service")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;
    config.validate()?;

    run(config).await
}

async fn run(config: Config) -> Result<()> {
    let http_client = Client::builder()
        .build()
        .context("Failed to build HTTP client")?;

    let store = Arc::new(Store::new(
        Arc::new(UserManagerClient::new(
            http_client.clone(),
            &config.cache.user_manager_server_internal_addr,
        )),
        Arc::new(ClusterManagerClient::new(
            http_client.clone(),
            &config.cache.cluster_manager_server_internal_addr,
        )),
    ));

    // The initial key fetch is synchronous; an unreachable JWKS endpoint at
    // startup is fatal.
    let validator = Validator::connect(
        http_client,
        config.jwks_url.clone(),
        config.jwks_refresh_interval,
    )
    .await
    .context("Failed to fetch the initial JWKS key set")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    {
        let store = store.clone();
        let shutdown = shutdown_rx.clone();
        let sync_interval = config.cache.sync_interval;
        tokio::spawn(async move { store.sync(sync_interval, shutdown).await });
    }
    {
        // The server starts before the first sync completes so that it never
        // hard-depends on the upstream managers.
        let store = store.clone();
        tokio::spawn(async move {
            store.wait_for_sync().await;
            info!("Initial cache sync complete");
        });
    }

    let metrics = RbacMetrics::new()?;
    {
        let metrics = metrics.clone();
        let store = store.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            metrics.run(store, METRICS_SAMPLE_INTERVAL, shutdown).await;
        });
    }

    let monitoring_addr = SocketAddr::from(([0, 0, 0, 0], config.monitoring_port));
    let monitoring = Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_endpoint))
        .with_state(metrics);
    let listener = TcpListener::bind(monitoring_addr)
        .await
        .with_context(|| format!("Failed to bind monitoring address {monitoring_addr}"))?;
    info!(%monitoring_addr, "Starting monitoring server");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, monitoring).await {
            warn!(error = %err, "Monitoring server exited");
        }
    });

    spawn_shutdown_signal(shutdown_tx, config.graceful_shutdown_delay);

    let server = RbacServer::new(
        store,
        validator,
        RoleScopesMap::new(config.role_scopes_map.clone()),
    );
    let grpc_addr = SocketAddr::from(([0, 0, 0, 0], config.internal_grpc_port));
    server
        .run(grpc_addr, shutdown_rx)
        .await
        .context("gRPC server failed")?;

    info!("Shut down cleanly");
    Ok(())
}

fn spawn_shutdown_signal(shutdown_tx: watch::Sender<bool>, delay: Duration) {
    tokio::spawn(async move {
        stop_signal().await;
        info!(?delay, "Received stop signal; draining after delay");
        // Keep serving while load balancers take this instance out of
        // rotation.
        tokio::time::sleep(delay).await;
        let _ = shutdown_tx.send(true);
    });
}

#[cfg(unix)]
async fn stop_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn stop_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics_endpoint(State(metrics): State<RbacMetrics>) -> Response {
    match metrics.render() {
        Ok(response) => response,
        Err(err) => {
            warn!(?err, "Failed to render metrics");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .header(CONTENT_TYPE, HeaderValue::from_static("text/plain"))
                .body(axum::body::Body::from("metrics unavailable"))
                .expect("failed to build metrics response")
        }
    }
}
