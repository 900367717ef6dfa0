use serde::{Deserialize, Serialize};
use std::fmt;

pub const METRIC_KEY_SEPARATOR: char = '/';

/// Node-level metrics carry an empty `device_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricIdentifier {
    pub group_id: String,
    pub node_id: String,
    #[serde(default)]
    pub device_id: String,
    pub metric_id: String,
}

impl MetricIdentifier {
    pub fn new(
        group_id: impl Into<String>,
        node_id: impl Into<String>,
        device_id: impl Into<String>,
        metric_id: impl Into<String>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            node_id: node_id.into(),
            device_id: device_id.into(),
            metric_id: metric_id.into(),
        }
    }

    pub fn key(&self) -> MetricKey {
        MetricKey::from(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricKey(String);

impl MetricKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&MetricIdentifier> for MetricKey {
    fn from(value: &MetricIdentifier) -> Self {
        Self(format!(
            "{}{sep}{}{sep}{}{sep}{}",
            value.group_id,
            value.node_id,
            value.device_id,
            value.metric_id,
            sep = METRIC_KEY_SEPARATOR
        ))
    }
}

impl From<String> for MetricKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for MetricKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_joins_all_four_levels() {
        let id = MetricIdentifier::new("plant", "edge-1", "pump-3", "pressure");
        assert_eq!(id.key().as_str(), "plant/edge-1/pump-3/pressure");
    }

    #[test]
    fn node_level_metric_keeps_empty_device_slot() {
        let id = MetricIdentifier::new("plant", "edge-1", "", "uptime");
        assert_eq!(id.key().as_str(), "plant/edge-1//uptime");
    }

    #[test]
    fn distinct_identifiers_produce_distinct_keys() {
        let a = MetricIdentifier::new("g", "n", "d1", "m");
        let b = MetricIdentifier::new("g", "n", "d2", "m");
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key(), a.clone().key());
    }

    #[test]
    fn deserializes_camel_case_wire_identity() {
        let id: MetricIdentifier = serde_json::from_str(
            r#"{"groupId":"g","nodeId":"n","deviceId":"d","metricId":"m"}"#,
        )
        .expect("identifier should decode");
        assert_eq!(id.key().as_str(), "g/n/d/m");
    }
}
