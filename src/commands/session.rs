use crate::error::AppError;
use crate::state::{AppState, SessionHandle};
use crate::telemetry::correlator::{correlate, tooltip_at, ChartGeometry, Tooltip};
use crate::telemetry::engine::{SeriesEngine, SeriesPhase};
use crate::telemetry::identity::MetricKey;
use crate::telemetry::session::{
    run_dashboard_session, DashboardSources, SessionCommand, SessionEvent,
    SESSION_COMMAND_CAPACITY,
};
use crate::telemetry::types::{
    normalize_metrics, MetricInfo, Sample, SessionStartResult, SessionStatusSnapshot,
    SessionStopResult, StartSessionArgs,
};
use crate::telemetry::window::{ResolvedWindow, TimeRange};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn start_session(
    State(state): State<Arc<AppState>>,
    Json(args): Json<StartSessionArgs>,
) -> Result<Json<SessionStartResult>, AppError> {
    let config = args.normalize(&state.window_model)?;
    if !config.mock_mode {
        state.config().require_api_key()?;
    }

    let existing_handle = {
        let mut session_slot = state.session.lock().await;
        session_slot.take()
    };
    if let Some(handle) = existing_handle {
        handle.stop().await;
    }

    let cancellation_token = CancellationToken::new();
    let (commands, command_receiver) = mpsc::channel(SESSION_COMMAND_CAPACITY);
    let sources = DashboardSources::new(state.client.clone(), config.mock_mode);
    let history = sources.history();

    let join_handle = tokio::spawn(run_dashboard_session(
        config.clone(),
        history,
        sources,
        state.shared.clone(),
        command_receiver,
        cancellation_token.clone(),
    ));

    {
        let mut session_slot = state.session.lock().await;
        *session_slot = Some(SessionHandle {
            cancellation_token,
            join_handle,
            commands,
        });
    }

    info!(
        metrics = config.metrics.len(),
        mock_mode = config.mock_mode,
        "dashboard session started"
    );
    Ok(Json(SessionStartResult::from_config(&config)))
}

pub async fn stop_session(State(state): State<Arc<AppState>>) -> Json<SessionStopResult> {
    let existing_handle = {
        let mut session_slot = state.session.lock().await;
        session_slot.take()
    };

    let stopped = match existing_handle {
        Some(handle) => {
            handle.stop().await;
            true
        }
        None => false,
    };
    Json(SessionStopResult { stopped })
}

pub async fn session_status(State(state): State<Arc<AppState>>) -> Json<SessionStatusSnapshot> {
    Json(state.shared.status.read().await.clone())
}

pub async fn set_window(
    State(state): State<Arc<AppState>>,
    Json(range): Json<TimeRange>,
) -> Result<StatusCode, AppError> {
    let selection = state.window_model.select(&range)?;
    state
        .send_command(SessionCommand::SetWindow(selection))
        .await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
pub struct SetMetricsArgs {
    pub metrics: Vec<MetricInfo>,
}

pub async fn set_metrics(
    State(state): State<Arc<AppState>>,
    Json(args): Json<SetMetricsArgs>,
) -> Result<StatusCode, AppError> {
    let metrics = normalize_metrics(args.metrics)?;
    state
        .send_command(SessionCommand::SetMetrics(metrics))
        .await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn reconnect(State(state): State<Arc<AppState>>) -> Result<StatusCode, AppError> {
    state.send_command(SessionCommand::Reconnect).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesView {
    pub metric: MetricKey,
    pub phase: SeriesPhase,
    pub samples: Vec<Sample>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesResponse {
    pub revision: u64,
    pub window: Option<ResolvedWindow>,
    pub series: Vec<SeriesView>,
}

fn sorted_active_keys(engine: &SeriesEngine) -> Vec<MetricKey> {
    let mut keys: Vec<MetricKey> = engine.active_keys().cloned().collect();
    keys.sort();
    keys
}

fn build_series_response(engine: &SeriesEngine, window: Option<ResolvedWindow>) -> SeriesResponse {
    let series = sorted_active_keys(engine)
        .into_iter()
        .filter_map(|metric| {
            let phase = engine.phase(&metric)?;
            let samples = engine.snapshot_owned(&metric)?;
            Some(SeriesView {
                metric,
                phase,
                samples,
            })
        })
        .collect();
    SeriesResponse {
        revision: engine.revision(),
        window,
        series,
    }
}

pub async fn series(State(state): State<Arc<AppState>>) -> Json<SeriesResponse> {
    let window = state.shared.status.read().await.window;
    let response = build_series_response(&state.shared.engine.lock(), window);
    Json(response)
}

#[derive(Debug, Deserialize)]
pub struct CorrelateQuery {
    pub t: i64,
    pub visible: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationResponse {
    pub timestamp: i64,
    pub values: BTreeMap<MetricKey, Sample>,
}

/// Comma-separated keys; `None` or an empty list means every active series.
fn parse_visible(visible: Option<&str>) -> Option<Vec<MetricKey>> {
    let keys: Vec<MetricKey> = visible?
        .split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(MetricKey::from)
        .collect();
    (!keys.is_empty()).then_some(keys)
}

pub async fn correlate_at(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CorrelateQuery>,
) -> Json<CorrelationResponse> {
    let values = {
        let engine = state.shared.engine.lock();
        let visible =
            parse_visible(query.visible.as_deref()).unwrap_or_else(|| sorted_active_keys(&engine));
        correlate(&*engine, &visible, query.t)
    };
    Json(CorrelationResponse {
        timestamp: query.t,
        values,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TooltipArgs {
    pub cursor_x: f64,
    #[serde(flatten)]
    pub geometry: ChartGeometry,
    pub visible: Option<Vec<MetricKey>>,
}

pub async fn tooltip(
    State(state): State<Arc<AppState>>,
    Json(args): Json<TooltipArgs>,
) -> Result<Json<Tooltip>, AppError> {
    if !(args.geometry.width > 0.0 && args.geometry.height > 0.0) {
        return Err(AppError::InvalidArgument(
            "chart width and height must be positive".to_string(),
        ));
    }
    let window = state
        .shared
        .status
        .read()
        .await
        .window
        .ok_or_else(|| AppError::State("no window has been resolved yet".to_string()))?;

    let tooltip = {
        let engine = state.shared.engine.lock();
        let visible = args
            .visible
            .filter(|keys| !keys.is_empty())
            .unwrap_or_else(|| sorted_active_keys(&engine));
        tooltip_at(&*engine, &visible, window, args.geometry, args.cursor_x)
    };
    Ok(Json(tooltip))
}

fn session_event_to_sse(event: &SessionEvent) -> Option<Event> {
    let sse_event = Event::default().event(event.name());
    let encoded = match event {
        SessionEvent::SeriesChanged(changed) => sse_event.json_data(changed),
        SessionEvent::Status(status) => sse_event.json_data(status),
    };
    match encoded {
        Ok(sse_event) => Some(sse_event),
        Err(error) => {
            warn!("failed to encode {} event: {error}", event.name());
            None
        }
    }
}

/// Change notifications for chart observers; the current status goes first.
pub async fn session_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.shared.events.subscribe();
    let current = SessionEvent::Status(state.shared.status.read().await.clone());

    let updates = BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(event) => session_event_to_sse(&event),
            Err(error) => {
                warn!("session event observer lagged: {error}");
                None
            }
        }
    });
    let stream = futures_util::stream::iter(session_event_to_sse(&current))
        .chain(updates)
        .map(Ok::<_, Infallible>);

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::types::SeriesChanged;

    fn key(name: &str) -> MetricKey {
        MetricKey::from(format!("plant/edge/pump/{name}"))
    }

    #[test]
    fn parses_visible_key_lists() {
        assert_eq!(
            parse_visible(Some("plant/edge/pump/a, plant/edge/pump/b,")),
            Some(vec![key("a"), key("b")])
        );
        assert_eq!(parse_visible(Some(" , ")), None);
        assert_eq!(parse_visible(None), None);
    }

    #[test]
    fn series_response_lists_active_buffers_in_key_order() {
        let mut engine = SeriesEngine::new();
        engine.activate(key("b"));
        engine.activate(key("a"));
        engine
            .seed(&key("a"), vec![Sample::new(1.0, 10)])
            .expect("seed should succeed");

        let response = build_series_response(&engine, None);

        let metrics: Vec<&MetricKey> = response.series.iter().map(|view| &view.metric).collect();
        assert_eq!(metrics, vec![&key("a"), &key("b")]);
        assert_eq!(response.series[0].phase, SeriesPhase::Seeded);
        assert_eq!(response.series[0].samples, vec![Sample::new(1.0, 10)]);
        assert_eq!(response.series[1].phase, SeriesPhase::Uninitialized);
    }

    #[test]
    fn tooltip_args_accept_flat_geometry() {
        let args: TooltipArgs = serde_json::from_str(
            r#"{"cursorX":12.5,"width":800,"height":300,"visible":["plant/edge/pump/a"]}"#,
        )
        .expect("tooltip args should decode");

        assert_eq!(args.cursor_x, 12.5);
        assert_eq!(args.geometry.width, 800.0);
        assert_eq!(args.visible, Some(vec![key("a")]));
    }

    #[test]
    fn session_events_map_to_named_sse_events() {
        let changed = SessionEvent::SeriesChanged(SeriesChanged {
            revision: 3,
            metrics: vec![key("a")],
        });
        assert_eq!(changed.name(), "seriesChanged");
        assert!(session_event_to_sse(&changed).is_some());
    }
}
