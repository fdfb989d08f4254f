use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::Instant;

use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

/// Installs the global tracing subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[derive(Default)]
struct MetricsInner {
    sessions_started: AtomicU64,
    sessions_connected: AtomicU64,
    sessions_failed: AtomicU64,
    sessions_disconnected: AtomicU64,
    sessions_removed: AtomicU64,
    provider_calls: AtomicU64,
    provider_errors: AtomicU64,
    bus_reconnects: AtomicU64,
    bus_frames_dropped: AtomicU64,
}

/// Snapshot exposed by `/metrics`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub sessions_live: usize,
    pub sessions_started: u64,
    pub sessions_connected: u64,
    pub sessions_failed: u64,
    pub sessions_disconnected: u64,
    pub sessions_removed: u64,
    pub provider_calls: u64,
    pub provider_errors: u64,
    pub bus_reconnects: u64,
    pub bus_frames_dropped: u64,
}

/// Process-wide orchestrator counters.
#[derive(Clone)]
pub struct OrchestratorMetrics {
    inner: Arc<MetricsInner>,
    started_at: Instant,
}

impl OrchestratorMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::default()),
            started_at: Instant::now(),
        }
    }

    pub fn session_started(&self) {
        self.inner.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_connected(&self) {
        self.inner.sessions_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_failed(&self) {
        self.inner.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_disconnected(&self) {
        self.inner.sessions_disconnected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_removed(&self) {
        self.inner.sessions_removed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one provider call and whether it failed.
    pub fn provider_call(&self, failed: bool) {
        self.inner.provider_calls.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.inner.provider_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn bus_reconnect(&self) {
        self.inner.bus_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bus_frame_dropped(&self) {
        self.inner.bus_frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the current serialized metrics snapshot.
    pub fn snapshot(&self, sessions_live: usize) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            uptime_seconds: self.started_at.elapsed().as_secs(),
            sessions_live,
            sessions_started: load(&self.inner.sessions_started),
            sessions_connected: load(&self.inner.sessions_connected),
            sessions_failed: load(&self.inner.sessions_failed),
            sessions_disconnected: load(&self.inner.sessions_disconnected),
            sessions_removed: load(&self.inner.sessions_removed),
            provider_calls: load(&self.inner.provider_calls),
            provider_errors: load(&self.inner.provider_errors),
            bus_reconnects: load(&self.inner.bus_reconnects),
            bus_frames_dropped: load(&self.inner.bus_frames_dropped),
        }
    }
}

impl Default for OrchestratorMetrics {
    fn default() -> Self {
        Self::new()
    }
}
