use crate::error::AppError;
use crate::state::AppState;
use crate::telemetry::bridge::{UpdateStream, UpdateTransport};
use crate::telemetry::METRIC_UPDATE_EVENT;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::{Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{info, warn};

const RELAY_ERROR_EVENT: &str = "error";

/// One platform subscription per client; dropping the response stream
/// (client disconnect) closes the upstream socket.
pub async fn subscribe_updates(
    State(state): State<Arc<AppState>>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let transport = state
        .client
        .live_transport()
        .map_err(|_| AppError::Configuration("API key not configured".to_string()))?;
    let updates = transport.connect().await?;
    info!("metricUpdate relay connected");

    Ok(Sse::new(relay_events(updates)).keep_alive(KeepAlive::default()))
}

fn relay_events(updates: UpdateStream) -> impl Stream<Item = Result<Event, Infallible>> {
    futures_util::stream::unfold(Some(updates), |state| async move {
        let mut updates = state?;
        loop {
            match updates.next().await {
                None => return None,
                Some(Ok(update)) => {
                    match Event::default().event(METRIC_UPDATE_EVENT).json_data(&update) {
                        Ok(event) => return Some((Ok(event), Some(updates))),
                        Err(error) => warn!("failed to encode metricUpdate event: {error}"),
                    }
                }
                Some(Err(error)) => {
                    warn!("metricUpdate relay ended: {error}");
                    let event = Event::default()
                        .event(RELAY_ERROR_EVENT)
                        .data(error.to_string());
                    return Some((Ok(event), None));
                }
            }
        }
    })
}
