use crate::state::AppState;
use crate::telemetry::window::{TimeRangePreset, WindowModel};
use crate::telemetry::{METRIC_UPDATE_EVENT, SERIES_CHANGED_EVENT, SESSION_STATUS_EVENT};
use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

const PRODUCT_NAME: &str = "AnywhereScada Dashboard";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetInfo {
    pub preset: TimeRangePreset,
    pub label: &'static str,
    pub duration_ms: i64,
    pub realtime: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfoResponse {
    pub product_name: &'static str,
    pub version: &'static str,
    pub presets: Vec<PresetInfo>,
    pub events: [&'static str; 3],
}

fn describe_presets(model: &WindowModel) -> Vec<PresetInfo> {
    model
        .presets()
        .iter()
        .map(|preset| PresetInfo {
            preset: *preset,
            label: preset.label(),
            duration_ms: preset.duration_ms(),
            realtime: model.is_realtime_allowed(*preset),
        })
        .collect()
}

pub async fn app_info(State(state): State<Arc<AppState>>) -> Json<AppInfoResponse> {
    Json(AppInfoResponse {
        product_name: PRODUCT_NAME,
        version: env!("CARGO_PKG_VERSION"),
        presets: describe_presets(&state.window_model),
        events: [METRIC_UPDATE_EVENT, SERIES_CHANGED_EVENT, SESSION_STATUS_EVENT],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_report_labels_and_realtime_eligibility() {
        let presets = describe_presets(&WindowModel::default());

        assert_eq!(presets.len(), TimeRangePreset::ALL.len());
        let first = &presets[0];
        assert_eq!(first.preset, TimeRangePreset::M5);
        assert_eq!(first.label, "Last 5 minutes");
        assert!(first.realtime);

        let realtime: Vec<&str> = presets
            .iter()
            .filter(|info| info.realtime)
            .map(|info| info.preset.as_str())
            .collect();
        assert_eq!(realtime, vec!["5m", "15m", "30m", "1h"]);
    }
}
