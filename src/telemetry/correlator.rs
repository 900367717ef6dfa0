use crate::telemetry::engine::SeriesEngine;
use crate::telemetry::identity::MetricKey;
use crate::telemetry::types::Sample;
use crate::telemetry::window::ResolvedWindow;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub trait SeriesSource {
    fn series(&self, key: &MetricKey) -> Option<&[Sample]>;
}

impl SeriesSource for SeriesEngine {
    fn series(&self, key: &MetricKey) -> Option<&[Sample]> {
        self.snapshot(key)
    }
}

impl SeriesSource for HashMap<MetricKey, Vec<Sample>> {
    fn series(&self, key: &MetricKey) -> Option<&[Sample]> {
        self.get(key).map(Vec::as_slice)
    }
}

/// Binary search over a non-decreasing buffer; equidistant neighbours
/// resolve to the earlier sample.
pub fn nearest_sample(samples: &[Sample], timestamp: i64) -> Option<Sample> {
    let index = samples.partition_point(|sample| sample.timestamp < timestamp);
    let before = index.checked_sub(1).map(|position| samples[position]);
    let after = samples.get(index).copied();

    match (before, after) {
        (Some(before), Some(after)) => {
            let before_distance = timestamp.abs_diff(before.timestamp);
            let after_distance = after.timestamp.abs_diff(timestamp);
            if after_distance < before_distance {
                Some(after)
            } else {
                Some(before)
            }
        }
        (before, after) => before.or(after),
    }
}

pub fn correlate<S: SeriesSource + ?Sized>(
    source: &S,
    visible: &[MetricKey],
    timestamp: i64,
) -> BTreeMap<MetricKey, Sample> {
    visible
        .iter()
        .filter_map(|key| {
            let samples = source.series(key)?;
            nearest_sample(samples, timestamp).map(|sample| (key.clone(), sample))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeScale {
    start_ms: i64,
    end_ms: i64,
    width_px: f64,
}

impl TimeScale {
    pub fn new(window: ResolvedWindow, width_px: f64) -> Self {
        Self {
            start_ms: window.start_ms,
            end_ms: window.end_ms,
            width_px: width_px.max(0.0),
        }
    }

    fn span_ms(&self) -> f64 {
        (self.end_ms - self.start_ms).max(1) as f64
    }

    pub fn x(&self, timestamp: i64) -> f64 {
        (timestamp - self.start_ms) as f64 / self.span_ms() * self.width_px
    }

    pub fn invert(&self, x_px: f64) -> i64 {
        if self.width_px <= 0.0 {
            return self.start_ms;
        }
        let ratio = (x_px / self.width_px).clamp(0.0, 1.0);
        self.start_ms + (ratio * self.span_ms()).round() as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueScale {
    min: f64,
    max: f64,
    height_px: f64,
}

impl ValueScale {
    pub fn new(min: f64, max: f64, height_px: f64) -> Self {
        Self {
            min,
            max,
            height_px: height_px.max(0.0),
        }
    }

    pub fn fit<S: SeriesSource + ?Sized>(
        source: &S,
        visible: &[MetricKey],
        window: ResolvedWindow,
        height_px: f64,
    ) -> Option<Self> {
        let mut extent: Option<(f64, f64)> = None;
        for key in visible {
            let Some(samples) = source.series(key) else {
                continue;
            };
            let first = samples.partition_point(|sample| sample.timestamp < window.start_ms);
            let last = samples.partition_point(|sample| sample.timestamp <= window.end_ms);
            for sample in &samples[first..last.max(first)] {
                extent = Some(match extent {
                    Some((min, max)) => (min.min(sample.value), max.max(sample.value)),
                    None => (sample.value, sample.value),
                });
            }
        }
        extent.map(|(min, max)| Self::new(min, max, height_px))
    }

    pub fn y(&self, value: f64) -> f64 {
        let span = self.max - self.min;
        if span <= f64::EPSILON {
            return self.height_px / 2.0;
        }
        self.height_px - (value - self.min) / span * self.height_px
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartGeometry {
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TooltipPoint {
    pub metric: MetricKey,
    pub value: f64,
    pub timestamp: i64,
    pub screen_x: f64,
    pub screen_y: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tooltip {
    pub timestamp: i64,
    pub cursor_x: f64,
    pub values: Vec<TooltipPoint>,
}

pub fn tooltip_at<S: SeriesSource + ?Sized>(
    source: &S,
    visible: &[MetricKey],
    window: ResolvedWindow,
    geometry: ChartGeometry,
    cursor_x: f64,
) -> Tooltip {
    let time_scale = TimeScale::new(window, geometry.width);
    let timestamp = time_scale.invert(cursor_x);
    let value_scale = ValueScale::fit(source, visible, window, geometry.height)
        .unwrap_or_else(|| ValueScale::new(0.0, 0.0, geometry.height));

    let values = correlate(source, visible, timestamp)
        .into_iter()
        .map(|(metric, sample)| TooltipPoint {
            metric,
            value: sample.value,
            timestamp: sample.timestamp,
            screen_x: time_scale.x(sample.timestamp),
            screen_y: value_scale.y(sample.value),
        })
        .collect();

    Tooltip {
        timestamp,
        cursor_x,
        values,
    }
}
