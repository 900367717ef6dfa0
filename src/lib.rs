mod commands;
mod config;
mod error;
mod state;
pub mod telemetry;

use axum::routing::{get, post, put};
use axum::Router;
use commands::{
    app_info::app_info,
    catalog::list_groups,
    health::health,
    history::query_history,
    session::{
        correlate_at, reconnect, series, session_events, session_status, set_metrics, set_window,
        start_session, stop_session, tooltip,
    },
    subscribe::subscribe_updates,
};
use config::DEFAULT_LOG_FILTER;
use state::AppState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub use config::ServiceConfig;
pub use error::AppError;

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/info", get(app_info))
        .route("/api/groups", get(list_groups))
        .route("/api/history", post(query_history))
        .route("/api/subscribe", get(subscribe_updates))
        .route("/api/session", post(start_session).delete(stop_session))
        .route("/api/session/status", get(session_status))
        .route("/api/session/window", put(set_window))
        .route("/api/session/metrics", put(set_metrics))
        .route("/api/session/reconnect", post(reconnect))
        .route("/api/session/series", get(series))
        .route("/api/session/correlate", get(correlate_at))
        .route("/api/session/tooltip", post(tooltip))
        .route("/api/session/events", get(session_events))
        .with_state(state)
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {error}");
        std::future::pending::<()>().await;
    }
}

pub async fn run() -> Result<(), AppError> {
    init_tracing();

    let config = ServiceConfig::from_env();
    let addr = config.socket_addr()?;
    if config.api_key.is_none() {
        warn!("ANYWHERESCADA_API_KEY is not set; only mock sessions will run");
    }

    let state = Arc::new(AppState::new(config));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "dashboard service listening");

    axum::serve(listener, router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let running = state.session.lock().await.take();
    if let Some(handle) = running {
        handle.stop().await;
    }
    info!("dashboard service stopped");
    Ok(())
}
