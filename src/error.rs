use thiserror::Error;

/// Network-level failures talking to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("provider call timed out")]
    Timeout,
    #[error("provider unreachable: {0}")]
    Network(String),
}

/// Errors surfaced by a [`crate::provider::ProviderClient`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("provider returned {code}: {message}")]
    Provider { code: u16, message: String },
    #[error("malformed provider payload: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Whether the session may retry the call.
    ///
    /// Network failures and malformed payloads are transient; structured provider
    /// errors are transient only for 5xx codes.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Decode(_) => true,
            Self::Provider { code, .. } => *code >= 500,
        }
    }

    /// Whether a create call failed only because the instance is already there.
    pub fn is_already_exists(&self) -> bool {
        let Self::Provider { code, message } = self else {
            return false;
        };
        if !matches!(code, 400 | 403 | 409) {
            return false;
        }

        let message = message.to_ascii_lowercase();
        message.contains("already in use") || message.contains("already exists")
    }
}

/// Errors returned by the [`crate::orchestrator::Orchestrator`] façade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    #[error("instance {0} is not connected")]
    NotConnected(String),
    #[error("session for {0} expired before pairing")]
    SessionExpired(String),
    #[error("session for {instance} failed: {reason}")]
    SessionFailed { instance: String, reason: String },
    #[error("invalid instance name: {0:?}")]
    InvalidInstanceName(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}
