use std::sync::Arc;

use crate::{
    error::OrchestratorError,
    events::EventBus,
    observability::{MetricsSnapshot, OrchestratorMetrics},
    provider::{ProviderClient, ProviderInstance},
    registry::SessionRegistry,
    session::{SessionContext, SessionPolicy, Subscription},
    status::{ConnectionState, StatusEvent},
};

/// Entry point for callers that manage WhatsApp agents.
#[derive(Clone)]
pub struct Orchestrator {
    registry: SessionRegistry,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        bus: EventBus,
        policy: SessionPolicy,
        metrics: OrchestratorMetrics,
    ) -> Self {
        Self {
            registry: SessionRegistry::new(SessionContext {
                provider,
                bus,
                policy,
                metrics,
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    fn context(&self) -> &SessionContext {
        self.registry.context()
    }

    /// Starts (or joins) the connection attempt for an agent's instance.
    ///
    /// Returns at once; provisioning progress arrives on the subscription. When
    /// `instance_name` is omitted the name is derived from `agent_id`.
    pub fn connect(
        &self,
        agent_id: &str,
        instance_name: Option<&str>,
    ) -> Result<Subscription, OrchestratorError> {
        let instance_name = resolve_instance_name(agent_id, instance_name)?;
        let (session, subscription) = self.registry.attach(&instance_name, agent_id);
        if session.agent_id() != agent_id {
            tracing::warn!(
                instance = %instance_name,
                owner = %session.agent_id(),
                agent = %agent_id,
                "instance already driven by another agent"
            );
        }
        Ok(subscription)
    }

    /// Observes an instance that already has a session, without starting one.
    pub fn subscribe(&self, instance_name: &str) -> Option<Subscription> {
        self.registry
            .get(instance_name.trim())
            .map(|session| session.subscribe())
    }

    /// Tears the session down and deletes the provider instance.
    ///
    /// Unknown instances are a no-op. Deletion failures are only logged.
    pub async fn disconnect(&self, instance_name: &str) -> Result<(), OrchestratorError> {
        let Some(session) = self.registry.remove(instance_name.trim()) else {
            tracing::debug!(instance = %instance_name, "disconnect for unknown instance");
            return Ok(());
        };
        session.finished().await;

        let context = self.context();
        let result = context
            .provider
            .delete_instance(session.instance_name(), context.policy.call_timeout)
            .await;
        context.metrics.provider_call(result.is_err());
        if let Err(error) = result {
            tracing::warn!(
                instance = %session.instance_name(),
                error = %error,
                "failed to delete provider instance"
            );
        }

        Ok(())
    }

    /// Current status of an instance. Never calls the provider.
    pub fn status(&self, instance_name: &str) -> Option<StatusEvent> {
        self.registry
            .get(instance_name.trim())
            .map(|session| session.snapshot())
    }

    /// Sends a text message through a connected instance.
    pub async fn send_text(
        &self,
        instance_name: &str,
        to: &str,
        body: &str,
    ) -> Result<(), OrchestratorError> {
        let instance_name = instance_name.trim();
        let connected = self
            .registry
            .get(instance_name)
            .is_some_and(|session| session.state() == ConnectionState::Connected);
        if !connected {
            return Err(OrchestratorError::NotConnected(instance_name.to_owned()));
        }

        let context = self.context();
        let result = context
            .provider
            .send_text(instance_name, to, body, context.policy.send_timeout)
            .await;
        context.metrics.provider_call(result.is_err());
        result.map_err(OrchestratorError::from)
    }

    /// Instance names with a tracked session.
    pub fn list(&self) -> Vec<String> {
        self.registry.list()
    }

    /// Snapshots of all tracked sessions.
    pub fn statuses(&self) -> Vec<StatusEvent> {
        self.registry.snapshots()
    }

    /// Instances known to the provider, whether or not a session tracks them.
    pub async fn provider_instances(&self) -> Result<Vec<ProviderInstance>, OrchestratorError> {
        let context = self.context();
        let result = context
            .provider
            .fetch_instances(context.policy.call_timeout)
            .await;
        context.metrics.provider_call(result.is_err());
        result.map_err(OrchestratorError::from)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.context().metrics.snapshot(self.registry.live_count())
    }

    pub fn bus(&self) -> &EventBus {
        &self.context().bus
    }

    /// Removes every session and stops the event stream.
    pub async fn shutdown(&self) {
        let sessions = self.registry.clear();
        for session in &sessions {
            session.finished().await;
        }
        self.context().bus.shutdown();
        tracing::info!(sessions = sessions.len(), "orchestrator stopped");
    }
}

/// Picks the instance name for a connect request.
///
/// An explicit name wins, then `agent_{agent_id}`, then a generated `wa-` name.
pub fn resolve_instance_name(
    agent_id: &str,
    instance_name: Option<&str>,
) -> Result<String, OrchestratorError> {
    let explicit = instance_name.map(str::trim).filter(|name| !name.is_empty());
    let agent_id = agent_id.trim();

    let name = match explicit {
        Some(name) => name.to_owned(),
        None if !agent_id.is_empty() => format!("agent_{agent_id}"),
        None => {
            let id = uuid::Uuid::new_v4().simple().to_string();
            format!("wa-{}", &id[..12])
        }
    };

    let reserved = |c: char| matches!(c, '/' | '?' | '#' | '%' | '\\');
    if matches!(name.as_str(), "." | "..")
        || name.chars().any(|c| reserved(c) || c.is_whitespace() || c.is_control())
    {
        return Err(OrchestratorError::InvalidInstanceName(name));
    }
    Ok(name)
}
