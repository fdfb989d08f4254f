#![allow(dead_code)]

pub mod evolution_mock;
pub mod provider_mock;
pub mod ws_mock;

use std::{sync::Arc, time::Duration};

use wa_orchestrator::{
    StatusEvent,
    events::EventBus,
    observability::OrchestratorMetrics,
    orchestrator::Orchestrator,
    session::{SessionPolicy, Subscription},
};

use provider_mock::MockProvider;

/// Upper bound for any single wait in the session tests.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(3);

/// Policy with millisecond timers so state machines settle quickly.
pub fn fast_policy() -> SessionPolicy {
    SessionPolicy {
        deadline: Duration::from_secs(2),
        poll_interval: Duration::from_millis(20),
        keepalive_interval: Duration::from_millis(40),
        call_timeout: Duration::from_millis(500),
        send_timeout: Duration::from_millis(500),
        retry_budget: 5,
        qr_ttl: Duration::from_secs(30),
        keep_monitoring: true,
        subscriber_buffer: 32,
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub provider: Arc<MockProvider>,
    pub bus: EventBus,
    pub metrics: OrchestratorMetrics,
}

/// Orchestrator over a scripted provider and a socket-less bus.
pub fn harness(provider: MockProvider, policy: SessionPolicy) -> Harness {
    let provider = Arc::new(provider);
    let metrics = OrchestratorMetrics::new();
    let bus = EventBus::disabled(metrics.clone());
    let orchestrator = Orchestrator::new(provider.clone(), bus.clone(), policy, metrics.clone());
    Harness {
        orchestrator,
        provider,
        bus,
        metrics,
    }
}

/// Next event, failing the test if none arrives in time.
pub async fn next_event(subscription: &mut Subscription) -> anyhow::Result<StatusEvent> {
    match tokio::time::timeout(STEP_TIMEOUT, subscription.recv()).await {
        Ok(Some(event)) => Ok(event),
        Ok(None) => anyhow::bail!("subscription ended unexpectedly"),
        Err(_) => anyhow::bail!("timed out waiting for status event"),
    }
}

/// Reads events until the stream ends.
pub async fn drain(mut subscription: Subscription) -> anyhow::Result<Vec<StatusEvent>> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(STEP_TIMEOUT, subscription.recv()).await {
            Ok(Some(event)) => events.push(event),
            Ok(None) => return Ok(events),
            Err(_) => anyhow::bail!("subscription did not end; got {events:?}"),
        }
    }
}

/// Polls `check` until it holds or [`STEP_TIMEOUT`] elapses.
pub async fn eventually<F>(mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("condition not reached in time");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}
