use crate::error::AppError;
use crate::state::AppState;
use crate::telemetry::types::{flatten_catalog, MetricInfo, MetricKind};
use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    #[serde(flatten)]
    pub metric: MetricInfo,
    pub kind: MetricKind,
}

impl From<MetricInfo> for CatalogEntry {
    fn from(metric: MetricInfo) -> Self {
        Self {
            kind: metric.kind(),
            metric,
        }
    }
}

pub async fn list_groups(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<CatalogEntry>>, AppError> {
    let groups = state.client.fetch_groups().await?;
    let entries = flatten_catalog(&groups)
        .into_iter()
        .map(CatalogEntry::from)
        .collect();
    Ok(Json(entries))
}
