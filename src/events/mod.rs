//! Fan-out of the provider's websocket feed.
//!
//! One [`EventBus`] owns the single socket to the provider. Frames are decoded
//! once and routed to the [`BusSubscription`]s registered for the frame's instance.

pub mod frame;
pub mod reader;

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use url::Url;

use crate::observability::OrchestratorMetrics;

pub use frame::{BusEvent, BusEventKind, decode_frame};
pub use reader::{backoff_base, backoff_delay};

/// Settings of the provider websocket.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub ws_url: String,
    pub api_key: String,
    /// Interval between ping frames written by the bus.
    pub heartbeat: Duration,
    /// Events queued per subscription before new ones are dropped.
    pub route_buffer: usize,
}

impl BusConfig {
    /// Websocket URL including the `apikey` query parameter.
    pub fn stream_url(&self) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&self.ws_url)?;
        url.query_pairs_mut().append_pair("apikey", &self.api_key);
        Ok(url)
    }
}

struct Route {
    id: u64,
    tx: mpsc::Sender<BusEvent>,
}

struct BusInner {
    routes: DashMap<String, Vec<Route>>,
    next_route_id: AtomicU64,
    connected: AtomicBool,
    shutdown: watch::Sender<bool>,
    route_buffer: usize,
    metrics: OrchestratorMetrics,
}

impl BusInner {
    fn remove_route(&self, instance_name: &str, id: u64) {
        if let Some(mut routes) = self.routes.get_mut(instance_name) {
            routes.retain(|route| route.id != id);
        }
        self.routes
            .remove_if(instance_name, |_, routes| routes.is_empty());
    }
}

/// Shared handle to the provider event stream.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    fn with_buffer(route_buffer: usize, metrics: OrchestratorMetrics) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(BusInner {
                routes: DashMap::new(),
                next_route_id: AtomicU64::new(1),
                connected: AtomicBool::new(false),
                shutdown,
                route_buffer: route_buffer.max(1),
                metrics,
            }),
        }
    }

    /// Starts the reader task for `config`. Must be called inside a tokio runtime.
    pub fn spawn(config: BusConfig, metrics: OrchestratorMetrics) -> Self {
        let bus = Self::with_buffer(config.route_buffer, metrics);
        let shutdown = bus.inner.shutdown.subscribe();
        tokio::spawn(reader::run(bus.clone(), config, shutdown));
        bus
    }

    /// A bus without a socket. Sessions fall back to polling alone.
    pub fn disabled(metrics: OrchestratorMetrics) -> Self {
        Self::with_buffer(64, metrics)
    }

    /// Registers interest in frames for `instance_name`.
    ///
    /// Dropping the returned subscription unregisters it.
    pub fn subscribe(&self, instance_name: &str) -> BusSubscription {
        let id = self.inner.next_route_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.route_buffer);
        self.inner
            .routes
            .entry(instance_name.to_owned())
            .or_default()
            .push(Route { id, tx });

        BusSubscription {
            instance_name: instance_name.to_owned(),
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Delivers `event` to the subscriptions of its instance without blocking.
    pub fn route(&self, event: BusEvent) {
        let Some(routes) = self.inner.routes.get(&event.instance_name) else {
            tracing::debug!(instance = %event.instance_name, "no subscriber for provider event");
            self.inner.metrics.bus_frame_dropped();
            return;
        };

        for route in routes.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = route.tx.try_send(event.clone()) {
                tracing::warn!(instance = %event.instance_name, "session lagging; provider event dropped");
                self.inner.metrics.bus_frame_dropped();
            }
        }
    }

    /// Tells every subscription that the stream dropped.
    pub fn notify_interrupted(&self) {
        for entry in self.inner.routes.iter() {
            let event = BusEvent {
                instance_name: entry.key().clone(),
                kind: BusEventKind::StreamInterrupted,
            };
            for route in entry.value() {
                let _ = route.tx.try_send(event.clone());
            }
        }
    }

    /// Number of live subscriptions for `instance_name`.
    pub fn subscriber_count(&self, instance_name: &str) -> usize {
        self.inner
            .routes
            .get(instance_name)
            .map(|routes| routes.len())
            .unwrap_or(0)
    }

    /// Whether the reader currently holds an open socket.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Relaxed)
    }

    /// Stops the reader task and closes the socket.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::Relaxed);
    }

    fn metrics(&self) -> &OrchestratorMetrics {
        &self.inner.metrics
    }
}

/// Receiving end of [`EventBus::subscribe`].
pub struct BusSubscription {
    instance_name: String,
    id: u64,
    rx: mpsc::Receiver<BusEvent>,
    bus: Weak<BusInner>,
}

impl BusSubscription {
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Next event for this instance; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.rx.recv().await
    }

    /// Unregisters the subscription.
    pub fn cancel(self) {}
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove_route(&self.instance_name, self.id);
        }
    }
}
