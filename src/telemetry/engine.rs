use crate::error::AppError;
use crate::telemetry::identity::MetricKey;
use crate::telemetry::types::{Sample, SeriesChanged};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesPhase {
    Uninitialized,
    Seeded,
    Live,
}

#[derive(Debug)]
struct SeriesBuffer {
    phase: SeriesPhase,
    samples: Vec<Sample>,
    pending: Vec<Sample>,
    floor: Option<i64>,
}

impl SeriesBuffer {
    fn new() -> Self {
        Self {
            phase: SeriesPhase::Uninitialized,
            samples: Vec::new(),
            pending: Vec::new(),
            floor: None,
        }
    }

    fn below_floor(&self, timestamp: i64) -> bool {
        self.floor.is_some_and(|floor| timestamp < floor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted { index: usize },
    Queued,
    UnknownMetric,
    BelowFloor,
}

#[derive(Debug)]
pub struct SeriesEngine {
    series: HashMap<MetricKey, SeriesBuffer>,
    dirty: BTreeSet<MetricKey>,
    revision: u64,
    closed: bool,
    notifier: watch::Sender<u64>,
}

impl Default for SeriesEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SeriesEngine {
    pub fn new() -> Self {
        let (notifier, _) = watch::channel(0);
        Self {
            series: HashMap::new(),
            dirty: BTreeSet::new(),
            revision: 0,
            closed: false,
            notifier,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notifier.subscribe()
    }

    pub fn activate(&mut self, key: MetricKey) -> bool {
        if self.closed || self.series.contains_key(&key) {
            return false;
        }
        self.series.insert(key, SeriesBuffer::new());
        true
    }

    pub fn deactivate(&mut self, key: &MetricKey) -> bool {
        if self.series.remove(key).is_some() {
            self.dirty.insert(key.clone());
            true
        } else {
            false
        }
    }

    pub fn set_active(&mut self, keys: &HashSet<MetricKey>) {
        let removed: Vec<MetricKey> = self
            .series
            .keys()
            .filter(|key| !keys.contains(*key))
            .cloned()
            .collect();
        for key in removed {
            self.deactivate(&key);
        }
        for key in keys {
            self.activate(key.clone());
        }
    }

    pub fn reset(&mut self) {
        let keys: Vec<MetricKey> = self.series.keys().cloned().collect();
        for key in keys {
            self.series.insert(key.clone(), SeriesBuffer::new());
            self.dirty.insert(key);
        }
    }

    pub fn active_keys(&self) -> impl Iterator<Item = &MetricKey> {
        self.series.keys()
    }

    pub fn is_active(&self, key: &MetricKey) -> bool {
        self.series.contains_key(key)
    }

    pub fn phase(&self, key: &MetricKey) -> Option<SeriesPhase> {
        self.series.get(key).map(|buffer| buffer.phase)
    }

    /// Only valid once per activation; `samples` must already be in
    /// non-decreasing timestamp order.
    pub fn seed(&mut self, key: &MetricKey, samples: Vec<Sample>) -> Result<(), AppError> {
        if self.closed {
            return Err(AppError::State(format!("seed of {key} after engine close")));
        }
        let buffer = self
            .series
            .get_mut(key)
            .ok_or_else(|| AppError::State(format!("seed of inactive metric {key}")))?;
        if buffer.phase != SeriesPhase::Uninitialized {
            return Err(AppError::State(format!("metric {key} is already seeded")));
        }

        buffer.samples = samples;
        if let Some(floor) = buffer.floor {
            let below = buffer.samples.partition_point(|sample| sample.timestamp < floor);
            buffer.samples.drain(..below);
        }
        buffer.phase = SeriesPhase::Seeded;

        for sample in std::mem::take(&mut buffer.pending) {
            if !buffer.below_floor(sample.timestamp) {
                insert_chronological(&mut buffer.samples, sample);
                buffer.phase = SeriesPhase::Live;
            }
        }

        self.dirty.insert(key.clone());
        Ok(())
    }

    pub fn append(&mut self, key: &MetricKey, sample: Sample) -> Result<AppendOutcome, AppError> {
        if self.closed {
            return Err(AppError::State(format!("append to {key} after engine close")));
        }
        let Some(buffer) = self.series.get_mut(key) else {
            return Ok(AppendOutcome::UnknownMetric);
        };
        if buffer.below_floor(sample.timestamp) {
            return Ok(AppendOutcome::BelowFloor);
        }
        if buffer.phase == SeriesPhase::Uninitialized {
            buffer.pending.push(sample);
            return Ok(AppendOutcome::Queued);
        }

        let index = insert_chronological(&mut buffer.samples, sample);
        buffer.phase = SeriesPhase::Live;
        self.dirty.insert(key.clone());
        Ok(AppendOutcome::Inserted { index })
    }

    pub fn prune(&mut self, key: &MetricKey, window_start: i64) -> usize {
        if self.closed {
            return 0;
        }
        let Some(buffer) = self.series.get_mut(key) else {
            return 0;
        };
        buffer.floor = Some(window_start);
        buffer.pending.retain(|sample| sample.timestamp >= window_start);

        let below = buffer
            .samples
            .partition_point(|sample| sample.timestamp < window_start);
        if below > 0 {
            buffer.samples.drain(..below);
            self.dirty.insert(key.clone());
        }
        below
    }

    pub fn prune_all(&mut self, window_start: i64) -> usize {
        let keys: Vec<MetricKey> = self.series.keys().cloned().collect();
        keys.iter().map(|key| self.prune(key, window_start)).sum()
    }

    pub fn snapshot(&self, key: &MetricKey) -> Option<&[Sample]> {
        self.series.get(key).map(|buffer| buffer.samples.as_slice())
    }

    pub fn snapshot_owned(&self, key: &MetricKey) -> Option<Vec<Sample>> {
        self.snapshot(key).map(<[Sample]>::to_vec)
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn take_changes(&mut self) -> Option<SeriesChanged> {
        if self.dirty.is_empty() {
            return None;
        }
        self.revision = self.revision.saturating_add(1);
        self.notifier.send_replace(self.revision);
        let metrics = std::mem::take(&mut self.dirty).into_iter().collect();
        Some(SeriesChanged {
            revision: self.revision,
            metrics,
        })
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.series.clear();
        self.dirty.clear();
    }
}

/// Backward scan from the tail; equal timestamps keep arrival order.
///
/// Near-ordered input costs O(1) per insert, heavy disorder degrades to O(n).
fn insert_chronological(samples: &mut Vec<Sample>, sample: Sample) -> usize {
    let mut index = samples.len();
    while index > 0 && samples[index - 1].timestamp > sample.timestamp {
        index -= 1;
    }
    samples.insert(index, sample);
    index
}
