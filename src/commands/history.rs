use crate::error::AppError;
use crate::state::AppState;
use crate::telemetry::history::HistoryFetcher;
use crate::telemetry::types::{
    HistoryOptions, HistoryRequest, MetricHistory, MAX_HISTORY_SAMPLES, MIN_HISTORY_SAMPLES,
};
use crate::telemetry::window::ResolvedWindow;
use axum::extract::State;
use axum::Json;
use std::sync::Arc;
use tracing::debug;

fn validate_history_request(request: &HistoryRequest) -> Result<ResolvedWindow, AppError> {
    if request.metrics.is_empty() {
        return Err(AppError::InvalidArgument(
            "at least one metric must be requested".to_string(),
        ));
    }
    if request.start > request.end {
        return Err(AppError::InvalidArgument(
            "start must not be after end".to_string(),
        ));
    }
    if let Some(samples) = request.samples {
        if !(MIN_HISTORY_SAMPLES..=MAX_HISTORY_SAMPLES).contains(&samples) {
            return Err(AppError::InvalidArgument(format!(
                "samples must be between {MIN_HISTORY_SAMPLES} and {MAX_HISTORY_SAMPLES}"
            )));
        }
    }
    Ok(ResolvedWindow {
        start_ms: request.start.timestamp_millis(),
        end_ms: request.end.timestamp_millis(),
    })
}

pub async fn query_history(
    State(state): State<Arc<AppState>>,
    Json(request): Json<HistoryRequest>,
) -> Result<Json<Vec<MetricHistory>>, AppError> {
    let window = validate_history_request(&request)?;
    debug!(metrics = request.metrics.len(), "proxying history query");

    let options = HistoryOptions {
        interval: request.interval,
        samples: request.samples,
        raw: request.raw,
    };
    let fetcher = HistoryFetcher::new(state.client.clone());
    let listing = fetcher
        .fetch_listing(window, &request.metrics, &options)
        .await?;
    Ok(Json(listing))
}
