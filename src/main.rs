use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

mod api;
mod artifact;
mod auth;
mod config;
mod control;
mod error;
mod executor;
mod features;
mod guardrail;
mod metrics;
mod oauth;
mod providers;
mod router;
mod selector;
mod triage;

pub use config::Config;
pub use error::{AppError, ErrorKind, RouteError};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a Docker HEALTHCHECK, hit /healthz and exit immediately.
    // This avoids needing any external tool (curl/wget) in the container image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "triage_gateway=info,tower_http=warn".into()),
        )
        .init();

    let config = Arc::new(load_config()?);

    info!(
        port = config.gateway.port,
        dashboard_port = config.gateway.dashboard_port,
        "triage-gateway starting"
    );

    let state = Arc::new(router::GatewayState::new(Arc::clone(&config)));

    // First artifact load happens before the listeners open so the very
    // first request already has a policy (possibly the emergency one).
    let initial = state.artifacts.load(false).await;
    info!(version = %initial.artifact.version, "initial artifact loaded");
    if state.oauth.is_some() {
        info!("google oauth flow enabled");
    }

    // Background machinery: artifact hot-reload, metric emission, control plane.
    let mut background = vec![
        tokio::spawn(artifact::reload_loop(
            Arc::clone(&state.artifacts),
            Duration::from_secs(config.artifact.reload_secs),
        )),
        tokio::spawn(metrics::emitter_loop(Arc::clone(&state.metrics))),
    ];
    background.extend(control::spawn_all(
        Arc::clone(&config),
        Arc::clone(&state.artifacts),
        Arc::clone(&state.metrics),
        Arc::clone(&state.canary),
        Arc::clone(&state.recommender),
        Arc::clone(&state.canary_slot),
    ));

    let gateway_addr: SocketAddr = format!("0.0.0.0:{}", config.gateway.port).parse()?;
    // Dashboard binds loopback only; expose it deliberately if you must.
    let dashboard_addr: SocketAddr =
        format!("127.0.0.1:{}", config.gateway.dashboard_port).parse()?;

    let gateway_listener = tokio::net::TcpListener::bind(gateway_addr).await?;
    let dashboard_listener = tokio::net::TcpListener::bind(dashboard_addr).await?;
    info!(%gateway_addr, "gateway API listening");
    info!(%dashboard_addr, "dashboard listening");

    let trace_layer = || {
        tower_http::trace::TraceLayer::new_for_http()
            .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
            .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO))
    };

    let gateway_app = api::gateway::router(Arc::clone(&state))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer());
    let dashboard_app = api::dashboard::router(Arc::clone(&state)).layer(trace_layer());

    tokio::select! {
        result = axum::serve(gateway_listener, gateway_app) => {
            result.context("gateway API server error")?;
        }
        result = axum::serve(dashboard_listener, dashboard_app) => {
            result.context("dashboard server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    for task in background {
        task.abort();
    }
    Ok(())
}

/// Load config from `TGW_CONFIG`, then `./config.toml`, then built-in
/// defaults. A present-but-invalid file is a hard error — silent fallback
/// would mask typos in production deployments.
fn load_config() -> anyhow::Result<Config> {
    if let Ok(path) = std::env::var("TGW_CONFIG") {
        let path = PathBuf::from(path);
        return Config::load(&path)
            .with_context(|| format!("loading config from {}", path.display()));
    }
    let local = PathBuf::from("config.toml");
    if local.exists() {
        return Config::load(&local).context("loading ./config.toml");
    }
    warn!("no config file found, using built-in defaults");
    let config = Config::default();
    config.validate()?;
    Ok(config)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /healthz and exit 0 on 200, 1 otherwise.
/// Invoked via `triage-gateway --healthcheck` from Docker HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("TGW_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8080);

    let url = format!("http://127.0.0.1:{port}/healthz");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}
