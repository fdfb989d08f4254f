pub mod http;
pub mod types;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::{error::ProviderError, status::QrPayload};

pub use http::HttpProviderClient;

/// Connection state as reported by the provider (`open`, `connecting`, `close`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderState {
    Open,
    Connecting,
    Close,
    Other(String),
}

impl ProviderState {
    /// Parses the provider's state string. Unknown values are kept verbatim.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "open" | "connected" => Self::Open,
            "connecting" => Self::Connecting,
            "close" | "closed" => Self::Close,
            _ => Self::Other(raw.trim().to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Open => "open",
            Self::Connecting => "connecting",
            Self::Close => "close",
            Self::Other(raw) => raw,
        }
    }
}

/// Result of asking the provider to start pairing an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The provider issued a pairing code.
    Qr(QrPayload),
    /// No code was issued; the instance is already in the given state.
    State(ProviderState),
}

/// An instance as listed by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInstance {
    pub name: String,
    pub connection_status: Option<String>,
}

/// REST surface of the messaging provider.
///
/// Implementations hold no session state and never retry. Every call must give up
/// once `deadline` has elapsed.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn create_instance(&self, name: &str, deadline: Duration) -> Result<(), ProviderError>;

    async fn connect(&self, name: &str, deadline: Duration) -> Result<ConnectOutcome, ProviderError>;

    async fn fetch_state(&self, name: &str, deadline: Duration)
    -> Result<ProviderState, ProviderError>;

    async fn delete_instance(&self, name: &str, deadline: Duration) -> Result<(), ProviderError>;

    async fn send_text(
        &self,
        name: &str,
        to: &str,
        body: &str,
        deadline: Duration,
    ) -> Result<(), ProviderError>;

    async fn fetch_instances(&self, deadline: Duration)
    -> Result<Vec<ProviderInstance>, ProviderError>;
}
