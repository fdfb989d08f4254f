use std::{net::SocketAddr, str::FromStr, time::Duration};

use thiserror::Error;
use url::Url;

use crate::{events::BusConfig, session::SessionPolicy};

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Socket address for binding the HTTP server.
    pub bind_addr: SocketAddr,
    /// Base URL of the provider REST API.
    pub provider_url: String,
    /// API key sent to the provider.
    pub provider_api_key: String,
    /// Provider websocket; `None` runs sessions on polling alone.
    pub bus: Option<BusConfig>,
    pub policy: SessionPolicy,
    pub log_format: LogFormat,
}

impl Config {
    /// Loads runtime configuration from the process environment and `.env`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads runtime configuration through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|raw| raw.trim().to_owned()).filter(|raw| !raw.is_empty());

        let host = var("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_owned());
        let port = match var("SERVER_PORT") {
            Some(raw) => u16::from_str(&raw).map_err(|_| ConfigError::InvalidPort(raw))?,
            None => 8080,
        };
        let bind_addr = SocketAddr::from_str(&format!("{host}:{port}"))
            .map_err(|_| ConfigError::InvalidHost(host))?;

        let provider_url = var("PROVIDER_URL").ok_or(ConfigError::Missing("PROVIDER_URL"))?;
        let parsed_provider_url =
            Url::parse(&provider_url).map_err(|_| ConfigError::InvalidUrl("PROVIDER_URL", provider_url.clone()))?;
        let provider_api_key = var("PROVIDER_API_KEY").ok_or(ConfigError::Missing("PROVIDER_API_KEY"))?;

        let defaults = SessionPolicy::default();
        let policy = SessionPolicy {
            deadline: secs(&var, "SESSION_DEADLINE_SECS", defaults.deadline)?,
            poll_interval: millis(&var, "POLL_INTERVAL_MS", defaults.poll_interval)?,
            keepalive_interval: secs(&var, "KEEPALIVE_INTERVAL_SECS", defaults.keepalive_interval)?,
            call_timeout: secs(&var, "PROVIDER_CALL_TIMEOUT_SECS", defaults.call_timeout)?,
            send_timeout: secs(&var, "SEND_TEXT_TIMEOUT_SECS", defaults.send_timeout)?,
            retry_budget: number(&var, "RETRY_BUDGET", defaults.retry_budget)?,
            qr_ttl: secs(&var, "QR_TTL_SECS", defaults.qr_ttl)?,
            keep_monitoring: flag(&var, "KEEP_MONITORING", defaults.keep_monitoring)?,
            subscriber_buffer: number(&var, "SUBSCRIBER_BUFFER", defaults.subscriber_buffer)?,
        };

        let ws_url = match var("PROVIDER_WS_URL") {
            Some(raw) if raw.eq_ignore_ascii_case("off") => None,
            Some(raw) => {
                Url::parse(&raw).map_err(|_| ConfigError::InvalidUrl("PROVIDER_WS_URL", raw.clone()))?;
                Some(raw)
            }
            None => Some(derive_ws_url(&parsed_provider_url)),
        };
        let heartbeat = secs(&var, "BUS_HEARTBEAT_SECS", Duration::from_secs(25))?;
        let bus = ws_url.map(|ws_url| BusConfig {
            ws_url,
            api_key: provider_api_key.clone(),
            heartbeat,
            route_buffer: 64,
        });

        let log_format = match var("LOG_FORMAT").map(|raw| raw.to_ascii_lowercase()) {
            None => LogFormat::Pretty,
            Some(raw) if raw == "pretty" => LogFormat::Pretty,
            Some(raw) if raw == "json" => LogFormat::Json,
            Some(raw) => return Err(ConfigError::InvalidLogFormat(raw)),
        };

        Ok(Self {
            bind_addr,
            provider_url,
            provider_api_key,
            bus,
            policy,
            log_format,
        })
    }
}

fn derive_ws_url(provider_url: &Url) -> String {
    let mut ws_url = provider_url.clone();
    let scheme = if provider_url.scheme() == "https" { "wss" } else { "ws" };
    // Switching between the http and ws special schemes is always accepted.
    let _ = ws_url.set_scheme(scheme);
    ws_url.to_string()
}

fn number<T, V>(var: &V, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid(key, raw)),
        None => Ok(default),
    }
}

fn secs<V>(var: &V, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    V: Fn(&str) -> Option<String>,
{
    let value: u64 = number(var, key, default.as_secs())?;
    positive(key, Duration::from_secs(value))
}

fn millis<V>(var: &V, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    V: Fn(&str) -> Option<String>,
{
    let value: u64 = number(var, key, default.as_millis() as u64)?;
    positive(key, Duration::from_millis(value))
}

fn positive(key: &'static str, value: Duration) -> Result<Duration, ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Invalid(key, "0".to_owned()));
    }
    Ok(value)
}

fn flag<V>(var: &V, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    V: Fn(&str) -> Option<String>,
{
    match var(key).map(|raw| raw.to_ascii_lowercase()) {
        None => Ok(default),
        Some(raw) => match raw.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid(key, raw)),
        },
    }
}

/// Errors while loading runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing {0} environment variable")]
    Missing(&'static str),
    #[error("invalid SERVER_PORT value: {0}")]
    InvalidPort(String),
    #[error("invalid SERVER_HOST value: {0}")]
    InvalidHost(String),
    #[error("invalid {0} url: {1}")]
    InvalidUrl(&'static str, String),
    #[error("invalid LOG_FORMAT value: {0}")]
    InvalidLogFormat(String),
    #[error("invalid {0} value: {1}")]
    Invalid(&'static str, String),
}
