use crate::state::AppState;
use crate::telemetry::types::SessionState;
use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub api_key: &'static str,
    pub session: SessionState,
}

pub fn build_health_response(
    started_at: Instant,
    api_key_configured: bool,
    session: SessionState,
) -> HealthResponse {
    HealthResponse {
        status: "ok",
        uptime_ms: started_at.elapsed().as_millis(),
        api_key: if api_key_configured {
            "configured"
        } else {
            "missing"
        },
        session,
    }
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let session = state.shared.status.read().await.state;
    Json(build_health_response(
        state.started_at,
        state.config().api_key.is_some(),
        session,
    ))
}
