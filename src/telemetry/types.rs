use crate::error::AppError;
use crate::telemetry::identity::{MetricIdentifier, MetricKey};
use crate::telemetry::window::{ChartMode, ResolvedWindow, TimeRange, WindowModel, WindowSelection};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const DEFAULT_EMIT_INTERVAL_MS: u64 = 250;
pub const DEFAULT_WINDOW_TICK_MS: u64 = 1_000;
pub const DEFAULT_MOCK_MODE: bool = false;
pub const MIN_EMIT_INTERVAL_MS: u64 = 16;
pub const MAX_EMIT_INTERVAL_MS: u64 = 1_000;
pub const MIN_WINDOW_TICK_MS: u64 = 250;
pub const MAX_WINDOW_TICK_MS: u64 = 10_000;
pub const MIN_HISTORY_SAMPLES: u32 = 1;
pub const MAX_HISTORY_SAMPLES: u32 = 10_000;

const BOOLEAN_TYPE_NAMES: [&str; 4] = ["Bool", "Boolean", "boolean", "11"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Boolean,
    Numeric,
}

impl MetricKind {
    pub fn from_type_name(type_name: &str) -> Self {
        if BOOLEAN_TYPE_NAMES.contains(&type_name) {
            Self::Boolean
        } else {
            Self::Numeric
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetricInfo {
    #[serde(flatten)]
    pub identifier: MetricIdentifier,
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

impl MetricInfo {
    pub fn key(&self) -> MetricKey {
        self.identifier.key()
    }

    pub fn kind(&self) -> MetricKind {
        MetricKind::from_type_name(&self.type_name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub value: f64,
    pub timestamp: i64,
}

impl Sample {
    pub fn new(value: f64, timestamp: i64) -> Self {
        Self { value, timestamp }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub metrics: Vec<MetricIdentifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub samples: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryOptions {
    pub interval: Option<String>,
    pub samples: Option<u32>,
    pub raw: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricHistory {
    #[serde(flatten)]
    pub identifier: MetricIdentifier,
    pub history: Vec<Sample>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryPointWire {
    pub value: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct MetricHistoryWire {
    #[serde(flatten)]
    pub identifier: MetricIdentifier,
    #[serde(default)]
    pub history: Vec<HistoryPointWire>,
}

/// Live values arrive as strings on the platform, but numbers and
/// booleans are accepted as well.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum WireValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl WireValue {
    pub fn to_f64(&self) -> Result<f64, AppError> {
        let value = match self {
            Self::Number(number) => *number,
            Self::Bool(flag) => bool_to_f64(*flag),
            Self::Text(text) => {
                let trimmed = text.trim();
                if trimmed.eq_ignore_ascii_case("true") {
                    1.0
                } else if trimmed.eq_ignore_ascii_case("false") {
                    0.0
                } else {
                    trimmed.parse::<f64>().map_err(|error| {
                        AppError::InvalidArgument(format!(
                            "metric value '{trimmed}' is not numeric: {error}"
                        ))
                    })?
                }
            }
        };
        if !value.is_finite() {
            return Err(AppError::InvalidArgument(
                "metric value must be finite".to_string(),
            ));
        }
        Ok(value)
    }
}

fn bool_to_f64(flag: bool) -> f64 {
    if flag {
        1.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricUpdate {
    #[serde(flatten)]
    pub identifier: MetricIdentifier,
    pub value: WireValue,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveEvent {
    pub key: MetricKey,
    pub sample: Sample,
}

impl TryFrom<&MetricUpdate> for LiveEvent {
    type Error = AppError;

    fn try_from(value: &MetricUpdate) -> Result<Self, Self::Error> {
        Ok(Self {
            key: value.identifier.key(),
            sample: Sample::new(value.value.to_f64()?, value.timestamp),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SparkplugMetricWire {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub scan_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparkplugDeviceWire {
    pub id: String,
    #[serde(default)]
    pub metrics: Vec<SparkplugMetricWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparkplugNodeWire {
    pub id: String,
    #[serde(default)]
    pub metrics: Vec<SparkplugMetricWire>,
    #[serde(default)]
    pub devices: Vec<SparkplugDeviceWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparkplugGroupWire {
    pub id: String,
    #[serde(default)]
    pub nodes: Vec<SparkplugNodeWire>,
}

pub fn flatten_catalog(groups: &[SparkplugGroupWire]) -> Vec<MetricInfo> {
    let mut metrics = Vec::new();
    for group in groups {
        for node in &group.nodes {
            for metric in &node.metrics {
                metrics.push(catalog_entry(&group.id, &node.id, "", metric));
            }
            for device in &node.devices {
                for metric in &device.metrics {
                    metrics.push(catalog_entry(&group.id, &node.id, &device.id, metric));
                }
            }
        }
    }
    metrics
}

fn catalog_entry(
    group_id: &str,
    node_id: &str,
    device_id: &str,
    metric: &SparkplugMetricWire,
) -> MetricInfo {
    MetricInfo {
        identifier: MetricIdentifier::new(group_id, node_id, device_id, metric.id.clone()),
        name: metric.name.clone(),
        type_name: metric.type_name.clone(),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Loading,
    Live,
    Historical,
    Error,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusSnapshot {
    pub state: SessionState,
    pub mode: Option<ChartMode>,
    pub window: Option<ResolvedWindow>,
    pub metric_count: usize,
    pub generation: u64,
    pub stream_open: bool,
    pub reason: Option<String>,
}

impl SessionStatusSnapshot {
    pub fn idle(reason: Option<String>) -> Self {
        Self {
            state: SessionState::Idle,
            mode: None,
            window: None,
            metric_count: 0,
            generation: 0,
            stream_open: false,
            reason,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionArgs {
    pub metrics: Option<Vec<MetricInfo>>,
    pub range: Option<TimeRange>,
    pub emit_interval_ms: Option<u64>,
    pub window_tick_ms: Option<u64>,
    pub mock_mode: Option<bool>,
    pub interval: Option<String>,
    pub samples: Option<u32>,
    pub raw: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub metrics: Vec<MetricInfo>,
    pub window: WindowSelection,
    pub emit_interval_ms: u64,
    pub window_tick_ms: u64,
    pub mock_mode: bool,
    pub history: HistoryOptions,
}

impl StartSessionArgs {
    pub fn normalize(self, model: &WindowModel) -> Result<SessionConfig, AppError> {
        let metrics = normalize_metrics(self.metrics.unwrap_or_default())?;

        let range = self.range.ok_or_else(|| {
            AppError::InvalidArgument("range is required to start a session".to_string())
        })?;
        let window = model.select(&range)?;

        let emit_interval_ms = self.emit_interval_ms.unwrap_or(DEFAULT_EMIT_INTERVAL_MS);
        if !(MIN_EMIT_INTERVAL_MS..=MAX_EMIT_INTERVAL_MS).contains(&emit_interval_ms) {
            return Err(AppError::InvalidArgument(format!(
                "emitIntervalMs must be between {MIN_EMIT_INTERVAL_MS} and {MAX_EMIT_INTERVAL_MS}"
            )));
        }

        let window_tick_ms = self.window_tick_ms.unwrap_or(DEFAULT_WINDOW_TICK_MS);
        if !(MIN_WINDOW_TICK_MS..=MAX_WINDOW_TICK_MS).contains(&window_tick_ms) {
            return Err(AppError::InvalidArgument(format!(
                "windowTickMs must be between {MIN_WINDOW_TICK_MS} and {MAX_WINDOW_TICK_MS}"
            )));
        }

        if let Some(samples) = self.samples {
            if !(MIN_HISTORY_SAMPLES..=MAX_HISTORY_SAMPLES).contains(&samples) {
                return Err(AppError::InvalidArgument(format!(
                    "samples must be between {MIN_HISTORY_SAMPLES} and {MAX_HISTORY_SAMPLES}"
                )));
            }
        }

        Ok(SessionConfig {
            metrics,
            window,
            emit_interval_ms,
            window_tick_ms,
            mock_mode: self.mock_mode.unwrap_or(DEFAULT_MOCK_MODE),
            history: HistoryOptions {
                interval: self.interval.filter(|value| !value.trim().is_empty()),
                samples: self.samples,
                raw: self.raw,
            },
        })
    }
}

pub fn normalize_metrics(metrics: Vec<MetricInfo>) -> Result<Vec<MetricInfo>, AppError> {
    if metrics.is_empty() {
        return Err(AppError::InvalidArgument(
            "at least one metric must be requested".to_string(),
        ));
    }

    let mut seen = HashSet::with_capacity(metrics.len());
    let mut unique = Vec::with_capacity(metrics.len());
    for metric in metrics {
        if metric.identifier.metric_id.trim().is_empty() {
            return Err(AppError::InvalidArgument(
                "metricId must be non-empty".to_string(),
            ));
        }
        if seen.insert(metric.key()) {
            unique.push(metric);
        }
    }
    Ok(unique)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartResult {
    pub running: bool,
    pub mode: ChartMode,
    pub metrics: Vec<MetricKey>,
    pub emit_interval_ms: u64,
    pub window_tick_ms: u64,
    pub mock_mode: bool,
}

impl SessionStartResult {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            running: true,
            mode: config.window.mode(),
            metrics: config.metrics.iter().map(MetricInfo::key).collect(),
            emit_interval_ms: config.emit_interval_ms,
            window_tick_ms: config.window_tick_ms,
            mock_mode: config.mock_mode,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStopResult {
    pub stopped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeriesChanged {
    pub revision: u64,
    pub metrics: Vec<MetricKey>,
}
