use std::time::Duration;

/// Timers and budgets applied to every session.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// Hard deadline from `Unprovisioned` to `Connected`.
    pub deadline: Duration,
    /// Poll tick while creating, awaiting a scan or pairing.
    pub poll_interval: Duration,
    /// Poll tick while connected.
    pub keepalive_interval: Duration,
    /// Upper bound of every provider call issued by a session.
    pub call_timeout: Duration,
    /// Deadline of `SendText`.
    pub send_timeout: Duration,
    /// Consecutive transient failures tolerated before failing the session.
    pub retry_budget: u32,
    /// Age after which an unscanned pairing code is fetched again.
    pub qr_ttl: Duration,
    /// Keep watching a connected instance for disconnects.
    pub keep_monitoring: bool,
    /// Events buffered per subscriber; the oldest are dropped when full.
    pub subscriber_buffer: usize,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(120),
            poll_interval: Duration::from_secs(3),
            keepalive_interval: Duration::from_secs(30),
            call_timeout: Duration::from_secs(15),
            send_timeout: Duration::from_secs(10),
            retry_budget: 5,
            qr_ttl: Duration::from_secs(45),
            keep_monitoring: true,
            subscriber_buffer: 32,
        }
    }
}
