use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reason strings carried by [`StatusEvent::reason`].
pub mod reason {
    /// The provider websocket dropped; the poller keeps running.
    pub const EVENT_STREAM_INTERRUPTED: &str = "event-stream-interrupted";
    /// The session was removed from the registry.
    pub const SESSION_REMOVED: &str = "session-removed";
    /// The hard deadline elapsed before the device paired.
    pub const SESSION_EXPIRED: &str = "session-expired";
    /// Every observer went away before the device paired.
    pub const SUBSCRIBER_CANCELLED: &str = "subscriber-cancelled";
    /// The provider reported the connection as closed.
    pub const CONNECTION_CLOSED: &str = "connection-closed";
}

/// Lifecycle state of one provider instance as tracked by its session.
///
/// Non-terminal states are ordered: a session only ever moves forward through
/// `Unprovisioned < Creating < AwaitingScan < Pairing < Connected`.
/// `Disconnected` and `Failed` end the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Unprovisioned,
    Creating,
    AwaitingScan,
    Pairing,
    Connected,
    Disconnected,
    Failed,
}

impl ConnectionState {
    /// Stable string representation of a connection state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unprovisioned => "unprovisioned",
            Self::Creating => "creating",
            Self::AwaitingScan => "awaitingScan",
            Self::Pairing => "pairing",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        }
    }

    /// Returns true for states that end a session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Unprovisioned => 0,
            Self::Creating => 1,
            Self::AwaitingScan => 2,
            Self::Pairing => 3,
            Self::Connected => 4,
            Self::Disconnected | Self::Failed => 5,
        }
    }

    /// Whether a session in `self` may move to `next`.
    ///
    /// Terminal states accept nothing, `Disconnected`/`Failed` are reachable from
    /// any live state, everything else must strictly advance.
    pub fn can_advance_to(&self, next: ConnectionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next.is_terminal() {
            return true;
        }
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scannable pairing code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrPayload {
    pub code: String,
    pub issued_at: DateTime<Utc>,
    /// `data:` URL of the rendered code, when one is available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl QrPayload {
    /// Builds a payload issued now.
    ///
    /// A provider-supplied base64 image is kept (normalised to a `data:` URL);
    /// otherwise the code is rendered locally.
    pub fn new(code: impl Into<String>, provider_image: Option<String>) -> Self {
        let code = code.into();
        let image = match provider_image.filter(|raw| !raw.trim().is_empty()) {
            Some(raw) if raw.starts_with("data:") => Some(raw),
            Some(raw) => Some(format!("data:image/png;base64,{raw}")),
            None => crate::qr::render_svg_data_url(&code),
        };

        Self {
            code,
            issued_at: Utc::now(),
            image,
        }
    }
}

/// The only value type delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub instance_name: String,
    pub state: ConnectionState,
    pub qr: Option<QrPayload>,
    pub reason: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl StatusEvent {
    /// Builds an event observed now.
    pub fn new(
        instance_name: impl Into<String>,
        state: ConnectionState,
        qr: Option<QrPayload>,
        reason: Option<String>,
    ) -> Self {
        // A QR code is only meaningful while waiting for a scan.
        let qr = if state == ConnectionState::AwaitingScan {
            qr
        } else {
            None
        };

        Self {
            instance_name: instance_name.into(),
            state,
            qr,
            reason,
            observed_at: Utc::now(),
        }
    }

    /// Initial snapshot of a session that has not been started yet.
    pub fn unprovisioned(instance_name: impl Into<String>) -> Self {
        Self::new(instance_name, ConnectionState::Unprovisioned, None, None)
    }
}
