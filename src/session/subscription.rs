use futures::Stream;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc,
};

use crate::{
    error::OrchestratorError,
    session::SessionCommand,
    status::{ConnectionState, StatusEvent, reason},
};

/// Read-only, cancellable stream of [`StatusEvent`]s for one instance.
///
/// The first event is the session's snapshot at subscription time. Slow readers
/// lose the oldest buffered events, never the newest. The stream ends after the
/// session's terminal event. Dropping the subscription cancels it.
pub struct Subscription {
    instance_name: String,
    pending: Option<StatusEvent>,
    rx: Option<broadcast::Receiver<StatusEvent>>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    detached: bool,
}

impl Subscription {
    pub(crate) fn new(
        instance_name: String,
        snapshot: Option<StatusEvent>,
        rx: Option<broadcast::Receiver<StatusEvent>>,
        commands: mpsc::UnboundedSender<SessionCommand>,
    ) -> Self {
        Self {
            instance_name,
            pending: snapshot,
            rx,
            commands,
            detached: false,
        }
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Next status event, or `None` once the session has ended.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        if let Some(event) = self.pending.take() {
            return Some(event);
        }

        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(
                        instance = %self.instance_name,
                        skipped,
                        "subscriber lagging; oldest status events dropped"
                    );
                }
                Err(RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Adapts the subscription into a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = StatusEvent> + Send + 'static {
        futures::stream::unfold(self, |mut subscription| async move {
            let event = subscription.recv().await?;
            Some((event, subscription))
        })
    }

    /// Waits until the instance is connected.
    ///
    /// Fails with [`OrchestratorError::SessionExpired`] when the deadline elapsed
    /// first, and with the terminal reason for any other ending.
    pub async fn wait_connected(mut self) -> Result<StatusEvent, OrchestratorError> {
        while let Some(event) = self.recv().await {
            match event.state {
                ConnectionState::Connected => return Ok(event),
                ConnectionState::Failed
                    if event.reason.as_deref() == Some(reason::SESSION_EXPIRED) =>
                {
                    return Err(OrchestratorError::SessionExpired(event.instance_name));
                }
                state if state.is_terminal() => {
                    return Err(OrchestratorError::SessionFailed {
                        instance: event.instance_name,
                        reason: event.reason.unwrap_or_else(|| state.to_string()),
                    });
                }
                _ => {}
            }
        }

        Err(OrchestratorError::NotConnected(self.instance_name.clone()))
    }

    /// Stops observing while letting the connection attempt run to completion.
    pub fn detach(mut self) {
        self.detached = true;
        let _ = self.commands.send(SessionCommand::Detach);
    }

    /// Cancels the subscription.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Release the receiver before the session counts what is left.
        if self.rx.take().is_some() && !self.detached {
            let _ = self.commands.send(SessionCommand::SubscriberLeft);
        }
    }
}
