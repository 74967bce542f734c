mod config;
mod metrics;
mod proxy;

use std::path::Path;
use std::sync::Arc;

use axum::routing::{any, get};
use axum::Router;
use config::Config;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use metrics::{prometheus_handler, stats_handler, MetricsState, PrometheusObserver};
use proxy::{proxy_handler, AppState};
use splice_esi::Processor;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load config
    let config = if Path::new("config.toml").exists() {
        match Config::load(Path::new("config.toml")) {
            Ok(c) => {
                tracing::info!("loaded config from config.toml");
                c
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to load config.toml, using defaults");
                Config::default_config()
            }
        }
    } else {
        tracing::info!("no config.toml found, using defaults");
        Config::default_config()
    };

    // Install Prometheus metrics recorder
    let prom_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("prometheus recorder");

    // Build the ESI processor; its fragment cache is shared across requests.
    let esi_config = config.esi.to_esi_config();
    tracing::info!(
        minimum_cache_ttl = esi_config.minimum_cache_ttl,
        cache_ttl_jitter = esi_config.cache_ttl_jitter,
        base_url = esi_config.base_url.as_ref().map(|u| u.as_str()),
        custom_headers = esi_config.headers.len(),
        "ESI configuration applied"
    );
    let esi = Processor::with_observer(esi_config, Arc::new(PrometheusObserver));

    // Build HTTP client for upstream requests
    let client = Client::builder(TokioExecutor::new()).build_http();

    let state = Arc::new(AppState {
        esi,
        client,
        upstream_url: config.upstream.url.clone(),
    });

    // Shutdown token for graceful shutdown
    let shutdown = CancellationToken::new();

    let metrics_state = MetricsState {
        app: Arc::clone(&state),
        prometheus: prom_handle,
    };

    // Build metrics/admin router (separate port)
    let metrics_router = Router::new()
        .route("/metrics", get(prometheus_handler))
        .route("/api/stats", get(stats_handler))
        .with_state(metrics_state);

    // Build proxy router (main port)
    let proxy_router = Router::new()
        .route("/{*path}", any(proxy_handler))
        .route("/", any(proxy_handler))
        .with_state(Arc::clone(&state));

    let proxy_addr = config.server.listen_addr.clone();
    let metrics_addr = config.server.metrics_addr.clone();

    tracing::info!(
        proxy = %proxy_addr,
        metrics = %metrics_addr,
        upstream = %config.upstream.url,
        "splice proxy starting"
    );

    let proxy_listener = tokio::net::TcpListener::bind(&proxy_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind proxy to {proxy_addr}: {e}"));

    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind metrics to {metrics_addr}: {e}"));

    // Spawn shutdown signal handler
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal(shutdown_clone).await;
    });

    // Run both servers with graceful shutdown
    let proxy_shutdown = shutdown.clone();
    let metrics_shutdown = shutdown.clone();

    let proxy_future = axum::serve(proxy_listener, proxy_router)
        .with_graceful_shutdown(proxy_shutdown.cancelled_owned());

    let metrics_future = axum::serve(metrics_listener, metrics_router)
        .with_graceful_shutdown(metrics_shutdown.cancelled_owned());

    tokio::select! {
        result = proxy_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "proxy server error");
            }
        }
        result = metrics_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        }
    }

    tracing::info!("splice proxy shut down");
}

/// Listen for SIGINT (Ctrl+C) or SIGTERM and cancel the shutdown token.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    tracing::info!("shutdown signal received, draining connections...");
    token.cancel();
}
