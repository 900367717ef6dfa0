use crate::error::AppError;
use std::net::SocketAddr;

pub const DEFAULT_API_URL: &str = "https://api.anywherescada.com/graphql";
pub const DEFAULT_WS_URL: &str = "wss://api.anywherescada.com/graphql";
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
pub const DEFAULT_LOG_FILTER: &str = "scada_dashboard_lib=info,scada_dashboard=info";

const API_KEY_VAR: &str = "ANYWHERESCADA_API_KEY";
const API_URL_VAR: &str = "ANYWHERESCADA_API_URL";
const WS_URL_VAR: &str = "ANYWHERESCADA_WS_URL";
const BIND_ADDR_VAR: &str = "DASHBOARD_BIND_ADDR";

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub api_key: Option<String>,
    pub api_url: String,
    pub ws_url: String,
    pub bind_addr: String,
}

fn resolve_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(resolve_env)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            api_key: lookup(API_KEY_VAR),
            api_url: lookup(API_URL_VAR).unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            ws_url: lookup(WS_URL_VAR).unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
            bind_addr: lookup(BIND_ADDR_VAR).unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
        }
    }

    /// The platform credential, or a `ConfigurationError` when it is not set.
    pub fn require_api_key(&self) -> Result<&str, AppError> {
        self.api_key.as_deref().ok_or_else(|| {
            AppError::Configuration(format!(
                "{API_KEY_VAR} is not set. Add it to your environment."
            ))
        })
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, AppError> {
        self.bind_addr.parse().map_err(|error| {
            AppError::Configuration(format!(
                "{BIND_ADDR_VAR} '{}' is not a socket address: {error}",
                self.bind_addr
            ))
        })
    }
}
