use crate::error::AppError;
use crate::telemetry::client::ScadaClient;
use crate::telemetry::identity::{MetricIdentifier, MetricKey};
use crate::telemetry::types::{
    HistoryOptions, HistoryPointWire, HistoryRequest, MetricHistory, MetricHistoryWire, Sample,
};
use crate::telemetry::window::ResolvedWindow;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use tracing::debug;

const MOCK_HISTORY_STEP_MS: i64 = 5_000;
const MOCK_HISTORY_MAX_POINTS: i64 = 2_000;

pub type HistorySnapshot = HashMap<MetricKey, Vec<Sample>>;

pub trait HistorySource: Send + Sync + 'static {
    fn fetch_history(
        &self,
        request: HistoryRequest,
    ) -> impl Future<Output = Result<Vec<MetricHistoryWire>, AppError>> + Send;
}

impl HistorySource for ScadaClient {
    async fn fetch_history(
        &self,
        request: HistoryRequest,
    ) -> Result<Vec<MetricHistoryWire>, AppError> {
        self.fetch_history_wire(&request).await
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyntheticHistory;

impl SyntheticHistory {
    fn series(&self, identifier: &MetricIdentifier, start_ms: i64, end_ms: i64) -> Vec<Sample> {
        let span = (end_ms - start_ms).max(0);
        let step = (span / MOCK_HISTORY_MAX_POINTS).max(MOCK_HISTORY_STEP_MS);
        let phase = synthetic_phase(&identifier.key());

        let mut samples = Vec::new();
        let mut timestamp = start_ms;
        while timestamp <= end_ms {
            samples.push(Sample::new(synthetic_value(phase, timestamp), timestamp));
            timestamp += step;
        }
        samples
    }
}

impl HistorySource for SyntheticHistory {
    async fn fetch_history(
        &self,
        request: HistoryRequest,
    ) -> Result<Vec<MetricHistoryWire>, AppError> {
        let start_ms = request.start.timestamp_millis();
        let end_ms = request.end.timestamp_millis();
        request
            .metrics
            .into_iter()
            .map(|identifier| {
                let history = self
                    .series(&identifier, start_ms, end_ms)
                    .into_iter()
                    .map(|sample| {
                        Ok(HistoryPointWire {
                            value: Some(sample.value),
                            timestamp: from_unix_ms(sample.timestamp)?,
                        })
                    })
                    .collect::<Result<Vec<_>, AppError>>()?;
                Ok(MetricHistoryWire {
                    identifier,
                    history,
                })
            })
            .collect()
    }
}

pub(crate) fn synthetic_phase(key: &MetricKey) -> f64 {
    let hash = key
        .as_str()
        .bytes()
        .fold(0_u32, |acc, byte| acc.wrapping_mul(31).wrapping_add(byte as u32));
    (hash % 360) as f64
}

pub(crate) fn synthetic_value(phase: f64, timestamp_ms: i64) -> f64 {
    let seconds = timestamp_ms as f64 / 1_000.0;
    50.0 + 25.0 * ((seconds / 30.0) + phase.to_radians()).sin() + 5.0 * (seconds / 7.0).cos()
}

pub(crate) fn from_unix_ms(timestamp_ms: i64) -> Result<DateTime<Utc>, AppError> {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms).ok_or_else(|| {
        AppError::InvalidArgument(format!("timestamp {timestamp_ms} is out of range"))
    })
}

#[derive(Debug, Clone)]
pub struct HistoryFetcher<S> {
    source: S,
}

impl<S: HistorySource> HistoryFetcher<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    /// All-or-nothing: either every requested metric gets an entry or the
    /// whole call fails with a `FetchError`.
    pub async fn fetch(
        &self,
        window: ResolvedWindow,
        metrics: &[MetricIdentifier],
        options: &HistoryOptions,
    ) -> Result<HistorySnapshot, AppError> {
        if metrics.is_empty() {
            return Ok(HistorySnapshot::new());
        }
        if window.start_ms > window.end_ms {
            return Err(AppError::InvalidArgument(
                "history window start must not be after end".to_string(),
            ));
        }

        let request = HistoryRequest {
            start: from_unix_ms(window.start_ms)?,
            end: from_unix_ms(window.end_ms)?,
            metrics: metrics.to_vec(),
            interval: options.interval.clone(),
            samples: options.samples,
            raw: options.raw,
        };

        let rows = self.source.fetch_history(request).await?;
        let snapshot = normalize_history(rows, metrics, window);
        debug!(
            metrics = snapshot.len(),
            points = snapshot.values().map(Vec::len).sum::<usize>(),
            "history snapshot loaded"
        );
        Ok(snapshot)
    }

    pub async fn fetch_listing(
        &self,
        window: ResolvedWindow,
        metrics: &[MetricIdentifier],
        options: &HistoryOptions,
    ) -> Result<Vec<MetricHistory>, AppError> {
        let mut snapshot = self.fetch(window, metrics, options).await?;
        Ok(metrics
            .iter()
            .map(|identifier| MetricHistory {
                history: snapshot.remove(&identifier.key()).unwrap_or_default(),
                identifier: identifier.clone(),
            })
            .collect())
    }
}

pub fn normalize_history(
    rows: Vec<MetricHistoryWire>,
    requested: &[MetricIdentifier],
    window: ResolvedWindow,
) -> HistorySnapshot {
    let wanted: HashSet<MetricKey> = requested.iter().map(MetricIdentifier::key).collect();
    let mut snapshot: HistorySnapshot = wanted
        .iter()
        .map(|key| (key.clone(), Vec::new()))
        .collect();

    for row in rows {
        let key = row.identifier.key();
        let Some(series) = snapshot.get_mut(&key) else {
            continue;
        };
        series.extend(row.history.into_iter().filter_map(|point| {
            let timestamp = point.timestamp.timestamp_millis();
            if !window.contains(timestamp) {
                return None;
            }
            point
                .value
                .filter(|value| value.is_finite())
                .map(|value| Sample::new(value, timestamp))
        }));
    }

    for series in snapshot.values_mut() {
        series.sort_by_key(|sample| sample.timestamp);
    }
    snapshot
}
