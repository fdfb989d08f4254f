use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, watch},
    time::{Instant, Interval, MissedTickBehavior, interval_at, sleep_until, timeout},
};

use crate::{
    error::{ProviderError, TransportError},
    events::{BusEvent, BusEventKind, BusSubscription},
    provider::{ConnectOutcome, ProviderState},
    session::{SessionCommand, SessionContext, SessionShared},
    status::{ConnectionState, QrPayload, StatusEvent, reason},
};

/// Why the runner stopped driving the state machine.
enum Exit {
    /// The state machine already published its final state.
    Settled,
    Shutdown(String),
    Abandoned,
    Expired,
    Failed(String),
}

/// Task owning one session's timers and bus subscription.
///
/// Poll results, bus events and commands all funnel through [`Self::advance`],
/// one at a time, so subscribers see a linear history.
pub(super) struct SessionRunner {
    name: String,
    context: SessionContext,
    shared: Arc<SessionShared>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    bus: BusSubscription,
    bus_open: bool,
    current: StatusEvent,
    deadline: Instant,
    failures: u32,
    detached: bool,
    qr_issued_at: Option<Instant>,
    finished: watch::Sender<bool>,
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

impl SessionRunner {
    pub(super) fn new(
        name: String,
        context: SessionContext,
        shared: Arc<SessionShared>,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        bus: BusSubscription,
        finished: watch::Sender<bool>,
    ) -> Self {
        let deadline = Instant::now() + context.policy.deadline;
        let current = shared.snapshot();
        Self {
            name,
            context,
            shared,
            commands,
            bus,
            bus_open: true,
            current,
            deadline,
            failures: 0,
            detached: false,
            qr_issued_at: None,
            finished,
        }
    }

    pub(super) async fn run(mut self) {
        let exit = match self.drive().await {
            Ok(()) => Exit::Settled,
            Err(exit) => exit,
        };
        self.finish(exit);
    }

    async fn drive(&mut self) -> Result<(), Exit> {
        self.provision().await?;
        self.request_qr(true).await?;

        let mut period = self.tick_period();
        let mut tick = ticker(period);

        loop {
            if self.current.state.is_terminal() {
                return Err(Exit::Settled);
            }
            if self.current.state == ConnectionState::Connected
                && !self.context.policy.keep_monitoring
            {
                tracing::info!(instance = %self.name, "connected; monitoring disabled");
                return Ok(());
            }
            if self.tick_period() != period {
                period = self.tick_period();
                tick = ticker(period);
            }

            tokio::select! {
                biased;
                command = self.commands.recv() => self.on_command(command)?,
                _ = sleep_until(self.deadline), if self.deadline_armed() => return Err(Exit::Expired),
                event = self.bus.recv(), if self.bus_open => match event {
                    Some(event) => self.on_bus_event(event)?,
                    None => self.bus_open = false,
                },
                _ = tick.tick() => self.on_tick().await?,
            }
        }
    }

    fn tick_period(&self) -> Duration {
        if self.current.state == ConnectionState::Connected {
            self.context.policy.keepalive_interval
        } else {
            self.context.policy.poll_interval
        }
    }

    fn deadline_armed(&self) -> bool {
        self.current.state != ConnectionState::Connected
    }

    fn on_command(&mut self, command: Option<SessionCommand>) -> Result<(), Exit> {
        match command {
            Some(SessionCommand::Shutdown { reason }) => Err(Exit::Shutdown(reason)),
            Some(SessionCommand::Detach) => {
                self.detached = true;
                Ok(())
            }
            Some(SessionCommand::SubscriberLeft) => {
                let pairing = matches!(
                    self.current.state,
                    ConnectionState::Creating
                        | ConnectionState::AwaitingScan
                        | ConnectionState::Pairing
                );
                if pairing && !self.detached && self.shared.subscriber_count() == 0 {
                    Err(Exit::Abandoned)
                } else {
                    Ok(())
                }
            }
            None => Err(Exit::Shutdown(reason::SESSION_REMOVED.to_owned())),
        }
    }

    /// Runs a provider call bounded by the per-call timeout while still honouring
    /// commands and the session deadline.
    async fn call<T>(
        &mut self,
        request: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<Result<T, ProviderError>, Exit> {
        let bounded = timeout(self.context.policy.call_timeout, request);
        tokio::pin!(bounded);

        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => self.on_command(command)?,
                _ = sleep_until(self.deadline), if self.deadline_armed() => return Err(Exit::Expired),
                result = &mut bounded => {
                    let result = result.unwrap_or_else(|_| Err(TransportError::Timeout.into()));
                    self.context.metrics.provider_call(result.is_err());
                    return Ok(result);
                }
            }
        }
    }

    async fn pause(&mut self, period: Duration) -> Result<(), Exit> {
        let wake = Instant::now() + period;
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => self.on_command(command)?,
                _ = sleep_until(self.deadline), if self.deadline_armed() => return Err(Exit::Expired),
                _ = sleep_until(wake) => return Ok(()),
            }
        }
    }

    async fn provision(&mut self) -> Result<(), Exit> {
        loop {
            let provider = Arc::clone(&self.context.provider);
            let name = self.name.clone();
            let limit = self.context.policy.call_timeout;
            let result = self
                .call(async move { provider.create_instance(&name, limit).await })
                .await?;

            match result {
                Ok(()) => return Ok(()),
                Err(error) if error.is_already_exists() => {
                    tracing::debug!(instance = %self.name, "provider instance already exists");
                    return Ok(());
                }
                Err(error) => {
                    self.absorb(error)?;
                    self.pause(self.context.policy.poll_interval).await?;
                }
            }
        }
    }

    async fn connect_call(&mut self) -> Result<Result<ConnectOutcome, ProviderError>, Exit> {
        let provider = Arc::clone(&self.context.provider);
        let name = self.name.clone();
        let limit = self.context.policy.call_timeout;
        self.call(async move { provider.connect(&name, limit).await })
            .await
    }

    async fn request_qr(&mut self, first_attempt: bool) -> Result<(), Exit> {
        let mut result = self.connect_call().await?;
        if first_attempt {
            if let Err(error) = &result {
                tracing::warn!(instance = %self.name, error = %error, "pairing code request failed; retrying");
                result = self.connect_call().await?;
            }
        }

        match result {
            Ok(ConnectOutcome::Qr(qr)) => {
                self.failures = 0;
                if self.current.state == ConnectionState::AwaitingScan {
                    self.refresh_qr(qr);
                } else {
                    self.advance(ConnectionState::AwaitingScan, Some(qr), None);
                }
                Ok(())
            }
            Ok(ConnectOutcome::State(state)) => {
                self.failures = 0;
                self.on_provider_state(state)
            }
            Err(error) => self.absorb(error),
        }
    }

    async fn poll_state(&mut self) -> Result<(), Exit> {
        let provider = Arc::clone(&self.context.provider);
        let name = self.name.clone();
        let limit = self.context.policy.call_timeout;
        let result = self
            .call(async move { provider.fetch_state(&name, limit).await })
            .await?;

        match result {
            Ok(state) => {
                self.failures = 0;
                self.on_provider_state(state)
            }
            Err(error) => self.absorb(error),
        }
    }

    async fn on_tick(&mut self) -> Result<(), Exit> {
        match self.current.state {
            ConnectionState::Creating => self.request_qr(false).await,
            ConnectionState::AwaitingScan if self.qr_is_stale() => {
                tracing::debug!(instance = %self.name, "pairing code is stale; requesting a new one");
                self.request_qr(false).await
            }
            _ => self.poll_state().await,
        }
    }

    fn qr_is_stale(&self) -> bool {
        self.qr_issued_at
            .is_some_and(|issued| issued.elapsed() >= self.context.policy.qr_ttl)
    }

    fn on_provider_state(&mut self, state: ProviderState) -> Result<(), Exit> {
        match (self.current.state, state) {
            (_, ProviderState::Open) => {
                self.advance(ConnectionState::Connected, None, None);
            }
            (ConnectionState::Connected, ProviderState::Close) => {
                self.advance(
                    ConnectionState::Disconnected,
                    None,
                    Some(reason::CONNECTION_CLOSED.to_owned()),
                );
                return Err(Exit::Settled);
            }
            (ConnectionState::AwaitingScan, ProviderState::Connecting | ProviderState::Other(_)) => {
                self.advance(ConnectionState::Pairing, None, None);
            }
            (current, state) => {
                tracing::trace!(instance = %self.name, %current, provider_state = %state.as_str(), "no transition");
            }
        }
        Ok(())
    }

    fn on_bus_event(&mut self, event: BusEvent) -> Result<(), Exit> {
        match event.kind {
            BusEventKind::QrUpdated(qr) => match self.current.state {
                ConnectionState::Creating => {
                    self.advance(ConnectionState::AwaitingScan, Some(qr), None);
                }
                ConnectionState::AwaitingScan => self.refresh_qr(qr),
                state => {
                    tracing::debug!(instance = %self.name, %state, "ignoring pairing code update");
                }
            },
            BusEventKind::QrScanned => {
                if self.current.state == ConnectionState::AwaitingScan {
                    self.advance(ConnectionState::Pairing, None, None);
                }
            }
            BusEventKind::Connection(ProviderState::Close)
                if self.current.state != ConnectionState::Connected =>
            {
                tracing::debug!(instance = %self.name, "ignoring close before pairing");
            }
            BusEventKind::Connection(state) => self.on_provider_state(state)?,
            BusEventKind::StreamInterrupted => {
                self.notice(reason::EVENT_STREAM_INTERRUPTED.to_owned());
            }
        }
        Ok(())
    }

    /// Counts a failed provider call against the retry budget.
    fn absorb(&mut self, error: ProviderError) -> Result<(), Exit> {
        if !error.is_transient() {
            tracing::warn!(instance = %self.name, error = %error, "provider rejected request");
            return Err(Exit::Failed(error.to_string()));
        }

        self.failures += 1;
        if self.failures >= self.context.policy.retry_budget {
            tracing::warn!(
                instance = %self.name,
                failures = self.failures,
                error = %error,
                "retry budget exhausted"
            );
            return Err(Exit::Failed(error.to_string()));
        }

        tracing::debug!(instance = %self.name, failures = self.failures, error = %error, "transient provider failure");
        self.notice(error.to_string());
        Ok(())
    }

    /// The single transition function. Returns false when `next` would not move
    /// the session forward.
    fn advance(
        &mut self,
        next: ConnectionState,
        qr: Option<QrPayload>,
        reason: Option<String>,
    ) -> bool {
        let from = self.current.state;
        if !from.can_advance_to(next) {
            tracing::debug!(instance = %self.name, %from, to = %next, "ignoring redundant transition");
            return false;
        }

        tracing::info!(instance = %self.name, %from, to = %next, reason = ?reason, "session state changed");
        match next {
            ConnectionState::AwaitingScan => self.qr_issued_at = Some(Instant::now()),
            ConnectionState::Connected => {
                self.failures = 0;
                self.context.metrics.session_connected();
            }
            ConnectionState::Failed => self.context.metrics.session_failed(),
            ConnectionState::Disconnected => self.context.metrics.session_disconnected(),
            _ => {}
        }

        self.emit(StatusEvent::new(&self.name, next, qr, reason));
        true
    }

    /// Republishes `AwaitingScan` with a new code. The same code only restarts
    /// the staleness clock.
    fn refresh_qr(&mut self, qr: QrPayload) {
        if self.current.state != ConnectionState::AwaitingScan {
            return;
        }
        self.qr_issued_at = Some(Instant::now());
        let unchanged = self
            .current
            .qr
            .as_ref()
            .is_some_and(|current| current.code == qr.code);
        if unchanged {
            return;
        }

        tracing::info!(instance = %self.name, "pairing code refreshed");
        self.emit(StatusEvent::new(
            &self.name,
            ConnectionState::AwaitingScan,
            Some(qr),
            None,
        ));
    }

    /// Publishes the current state again with an informational reason.
    fn notice(&mut self, reason: String) {
        if self.current.state.is_terminal() {
            return;
        }
        let event = StatusEvent::new(
            &self.name,
            self.current.state,
            self.current.qr.clone(),
            Some(reason),
        );
        self.emit(event);
    }

    fn emit(&mut self, event: StatusEvent) {
        self.current = event.clone();
        self.shared.publish(event);
    }

    fn finish(mut self, exit: Exit) {
        match exit {
            Exit::Settled => {}
            Exit::Shutdown(reason) => {
                self.advance(ConnectionState::Disconnected, None, Some(reason));
            }
            Exit::Abandoned => {
                tracing::info!(instance = %self.name, "every subscriber left before pairing");
                self.advance(
                    ConnectionState::Disconnected,
                    None,
                    Some(reason::SUBSCRIBER_CANCELLED.to_owned()),
                );
            }
            Exit::Expired => {
                tracing::warn!(
                    instance = %self.name,
                    deadline_secs = self.context.policy.deadline.as_secs_f64(),
                    "session deadline elapsed before pairing"
                );
                self.advance(
                    ConnectionState::Failed,
                    None,
                    Some(reason::SESSION_EXPIRED.to_owned()),
                );
            }
            Exit::Failed(reason) => {
                self.advance(ConnectionState::Failed, None, Some(reason));
            }
        }

        let Self {
            name,
            shared,
            bus,
            current,
            finished,
            ..
        } = self;
        drop(bus);
        shared.close();
        finished.send_replace(true);
        tracing::info!(instance = %name, state = %current.state, "session stopped");
    }
}
