pub mod policy;
mod runner;
pub mod subscription;

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use tokio::sync::{broadcast, mpsc, watch};

use crate::{
    events::EventBus,
    observability::OrchestratorMetrics,
    provider::ProviderClient,
    status::{ConnectionState, StatusEvent, reason},
};

pub use policy::SessionPolicy;
pub use subscription::Subscription;

use runner::SessionRunner;

/// Collaborators handed to every session.
#[derive(Clone)]
pub struct SessionContext {
    pub provider: Arc<dyn ProviderClient>,
    pub bus: EventBus,
    pub policy: SessionPolicy,
    pub metrics: OrchestratorMetrics,
}

/// Commands accepted by a session runner task.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    /// Tears the session down, publishing `Disconnected` with the given reason.
    Shutdown { reason: String },
    /// A subscription was dropped.
    SubscriberLeft,
    /// A caller stopped observing but wants the attempt to continue.
    Detach,
}

struct Published {
    snapshot: StatusEvent,
    tx: Option<broadcast::Sender<StatusEvent>>,
}

/// State shared between a session handle, its runner and its subscribers.
///
/// Publishing and subscribing happen under one lock so a new subscriber sees
/// every event exactly once: either in its initial snapshot or on the channel.
pub(crate) struct SessionShared {
    published: Mutex<Published>,
}

impl SessionShared {
    fn new(instance_name: &str, buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self {
            published: Mutex::new(Published {
                snapshot: StatusEvent::unprovisioned(instance_name),
                tx: Some(tx),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Published> {
        self.published.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn snapshot(&self) -> StatusEvent {
        self.lock().snapshot.clone()
    }

    pub(crate) fn publish(&self, event: StatusEvent) {
        let mut published = self.lock();
        published.snapshot = event.clone();
        if let Some(tx) = &published.tx {
            // No receivers is fine; the snapshot still records the event.
            let _ = tx.send(event);
        }
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.lock()
            .tx
            .as_ref()
            .map(broadcast::Sender::receiver_count)
            .unwrap_or(0)
    }

    /// Ends every subscriber stream after the events already queued.
    pub(crate) fn close(&self) {
        self.lock().tx = None;
    }

    fn subscribe(
        &self,
        instance_name: &str,
        commands: mpsc::UnboundedSender<SessionCommand>,
    ) -> Subscription {
        let published = self.lock();
        let snapshot = (published.snapshot.state != ConnectionState::Unprovisioned)
            .then(|| published.snapshot.clone());
        let rx = published.tx.as_ref().map(broadcast::Sender::subscribe);
        Subscription::new(instance_name.to_owned(), snapshot, rx, commands)
    }
}

/// Handle to the state machine of one provider instance.
///
/// The runner task owns the timers and the bus subscription; the handle only
/// reads snapshots, hands out subscriptions and requests shutdown.
pub struct ConnectionSession {
    instance_name: String,
    agent_id: String,
    shared: Arc<SessionShared>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    finished: watch::Receiver<bool>,
    started_at: Instant,
}

impl ConnectionSession {
    /// Moves a new session to `Creating` and spawns its runner.
    ///
    /// Does no I/O itself, so it is safe to call while holding the registry lock.
    pub fn start(instance_name: &str, agent_id: &str, context: SessionContext) -> Self {
        let (session, runner) = Self::prepare(instance_name, agent_id, context);
        tokio::spawn(runner.run());
        session
    }

    /// Like [`Self::start`], but the returned subscription is attached before the
    /// runner makes its first move, so it observes every transition.
    pub fn start_subscribed(
        instance_name: &str,
        agent_id: &str,
        context: SessionContext,
    ) -> (Self, Subscription) {
        let (session, runner) = Self::prepare(instance_name, agent_id, context);
        let subscription = session.subscribe();
        tokio::spawn(runner.run());
        (session, subscription)
    }

    fn prepare(instance_name: &str, agent_id: &str, context: SessionContext) -> (Self, SessionRunner) {
        let shared = Arc::new(SessionShared::new(
            instance_name,
            context.policy.subscriber_buffer,
        ));
        shared.publish(StatusEvent::new(
            instance_name,
            ConnectionState::Creating,
            None,
            None,
        ));

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (finished_tx, finished) = watch::channel(false);
        let bus = context.bus.subscribe(instance_name);
        context.metrics.session_started();
        tracing::info!(instance = %instance_name, agent = %agent_id, "starting session");

        let runner = SessionRunner::new(
            instance_name.to_owned(),
            context,
            Arc::clone(&shared),
            command_rx,
            bus,
            finished_tx,
        );
        let session = Self {
            instance_name: instance_name.to_owned(),
            agent_id: agent_id.to_owned(),
            shared,
            commands,
            finished,
            started_at: Instant::now(),
        };
        (session, runner)
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Current status, without any provider call.
    pub fn snapshot(&self) -> StatusEvent {
        self.shared.snapshot()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot().state
    }

    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Opens a new subscription starting with the current snapshot.
    pub fn subscribe(&self) -> Subscription {
        self.shared
            .subscribe(&self.instance_name, self.commands.clone())
    }

    /// Whether the runner has stopped and released its timers and bus subscription.
    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Whether the session can still make progress.
    pub fn is_live(&self) -> bool {
        !self.is_finished() && !self.state().is_terminal()
    }

    /// Asks the runner to stop. Subscribers receive a terminal `Disconnected`
    /// event carrying `reason` unless the session already ended.
    pub fn close(&self, reason: &str) {
        let _ = self.commands.send(SessionCommand::Shutdown {
            reason: reason.to_owned(),
        });
    }

    /// Resolves once the runner has stopped.
    pub async fn finished(&self) {
        let mut finished = self.finished.clone();
        // An error means the runner is gone, which is just as final.
        let _ = finished.wait_for(|done| *done).await;
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.close(reason::SESSION_REMOVED);
    }
}
