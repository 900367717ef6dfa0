use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const REALTIME_CEILING_MS: i64 = 3_600_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChartMode {
    Historical,
    Realtime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TimeRangePreset {
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Mo1,
}

impl TimeRangePreset {
    pub const ALL: [TimeRangePreset; 9] = [
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H6,
        Self::H12,
        Self::D1,
        Self::W1,
        Self::Mo1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H6 => "6h",
            Self::H12 => "12h",
            Self::D1 => "1d",
            Self::W1 => "1w",
            Self::Mo1 => "1M",
        }
    }

    pub fn duration_ms(self) -> i64 {
        match self {
            Self::M5 => 300_000,
            Self::M15 => 900_000,
            Self::M30 => 1_800_000,
            Self::H1 => 3_600_000,
            Self::H6 => 21_600_000,
            Self::H12 => 43_200_000,
            Self::D1 => 86_400_000,
            Self::W1 => 604_800_000,
            Self::Mo1 => 2_592_000_000,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::M5 => "Last 5 minutes",
            Self::M15 => "Last 15 minutes",
            Self::M30 => "Last 30 minutes",
            Self::H1 => "Last 1 hour",
            Self::H6 => "Last 6 hours",
            Self::H12 => "Last 12 hours",
            Self::D1 => "Last 1 day",
            Self::W1 => "Last 1 week",
            Self::Mo1 => "Last 1 month",
        }
    }
}

#[derive(Debug)]
pub struct PresetTable {
    pub presets: &'static [TimeRangePreset],
    pub realtime_ceiling_ms: i64,
}

pub static STANDARD_PRESETS: PresetTable = PresetTable {
    presets: &TimeRangePreset::ALL,
    realtime_ceiling_ms: REALTIME_CEILING_MS,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    pub mode: ChartMode,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub preset: Option<TimeRangePreset>,
}

impl TimeRange {
    pub fn realtime(preset: TimeRangePreset) -> Self {
        Self {
            mode: ChartMode::Realtime,
            start: None,
            end: None,
            preset: Some(preset),
        }
    }

    pub fn historical(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            mode: ChartMode::Historical,
            start: Some(start),
            end: Some(end),
            preset: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowSelection {
    Historical { start_ms: i64, end_ms: i64 },
    Realtime { preset: TimeRangePreset },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPolicy {
    Fixed,
    Sliding { duration_ms: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl ResolvedWindow {
    pub fn span_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }

    pub fn contains(&self, timestamp_ms: i64) -> bool {
        (self.start_ms..=self.end_ms).contains(&timestamp_ms)
    }
}

impl WindowSelection {
    pub fn mode(&self) -> ChartMode {
        match self {
            Self::Historical { .. } => ChartMode::Historical,
            Self::Realtime { .. } => ChartMode::Realtime,
        }
    }

    pub fn resolve(&self, now_ms: i64) -> ResolvedWindow {
        match *self {
            Self::Historical { start_ms, end_ms } => ResolvedWindow { start_ms, end_ms },
            Self::Realtime { preset } => ResolvedWindow {
                start_ms: now_ms.saturating_sub(preset.duration_ms()),
                end_ms: now_ms,
            },
        }
    }

    pub fn policy(&self) -> RefreshPolicy {
        match *self {
            Self::Historical { .. } => RefreshPolicy::Fixed,
            Self::Realtime { preset } => RefreshPolicy::Sliding {
                duration_ms: preset.duration_ms(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WindowModel {
    table: &'static PresetTable,
}

impl Default for WindowModel {
    fn default() -> Self {
        Self::new(&STANDARD_PRESETS)
    }
}

impl WindowModel {
    pub fn new(table: &'static PresetTable) -> Self {
        Self { table }
    }

    pub fn is_realtime_allowed(&self, preset: TimeRangePreset) -> bool {
        self.table.presets.contains(&preset) && preset.duration_ms() <= self.table.realtime_ceiling_ms
    }

    pub fn presets(&self) -> &'static [TimeRangePreset] {
        self.table.presets
    }

    pub fn realtime_presets(&self) -> impl Iterator<Item = TimeRangePreset> + '_ {
        self.table
            .presets
            .iter()
            .copied()
            .filter(|preset| self.is_realtime_allowed(*preset))
    }

    pub fn nearest_realtime_preset(&self, preset: TimeRangePreset) -> Option<TimeRangePreset> {
        self.realtime_presets()
            .min_by_key(|candidate| (candidate.duration_ms() - preset.duration_ms()).abs())
    }

    /// Disallowed realtime presets are a `ConfigurationError`; malformed
    /// historical ranges are an `InvalidArgument`.
    pub fn select(&self, range: &TimeRange) -> Result<WindowSelection, AppError> {
        match range.mode {
            ChartMode::Historical => {
                let (Some(start), Some(end)) = (range.start, range.end) else {
                    return Err(AppError::InvalidArgument(
                        "historical range requires both start and end".to_string(),
                    ));
                };
                let start_ms = start.timestamp_millis();
                let end_ms = end.timestamp_millis();
                if start_ms > end_ms {
                    return Err(AppError::InvalidArgument(
                        "historical range start must not be after end".to_string(),
                    ));
                }
                Ok(WindowSelection::Historical { start_ms, end_ms })
            }
            ChartMode::Realtime => {
                let preset = range.preset.ok_or_else(|| {
                    AppError::InvalidArgument("realtime range requires a preset".to_string())
                })?;
                if !self.is_realtime_allowed(preset) {
                    let hint = self
                        .nearest_realtime_preset(preset)
                        .map(|nearest| format!(" (nearest allowed: {})", nearest.as_str()))
                        .unwrap_or_default();
                    return Err(AppError::Configuration(format!(
                        "realtime preset '{}' exceeds the realtime ceiling{hint}",
                        preset.as_str()
                    )));
                }
                Ok(WindowSelection::Realtime { preset })
            }
        }
    }
}
