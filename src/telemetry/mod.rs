pub mod bridge;
pub mod client;
pub mod correlator;
pub mod engine;
pub mod history;
pub mod identity;
pub mod session;
pub mod types;
pub mod window;

use std::time::{SystemTime, UNIX_EPOCH};

pub const METRIC_UPDATE_EVENT: &str = "metricUpdate";
pub const SERIES_CHANGED_EVENT: &str = "seriesChanged";
pub const SESSION_STATUS_EVENT: &str = "sessionStatus";

pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
