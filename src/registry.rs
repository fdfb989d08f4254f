use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    session::{ConnectionSession, SessionContext, Subscription},
    status::{StatusEvent, reason},
};

/// Process-wide map of sessions keyed by instance name.
///
/// The lock only guards map lookups and inserts; starting a session spawns its
/// runner without doing any I/O, and teardown happens after the lock is released.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, Arc<ConnectionSession>>>>,
    context: SessionContext,
}

impl SessionRegistry {
    pub fn new(context: SessionContext) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            context,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<ConnectionSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Returns the live session for `instance_name`, starting one if there is none.
    ///
    /// A session that already ended is replaced by a fresh one.
    pub fn get_or_create(&self, instance_name: &str, agent_id: &str) -> Arc<ConnectionSession> {
        self.lookup_or_start(instance_name, agent_id, false).0
    }

    /// [`Self::get_or_create`] plus a subscription taken under the same lock, so a
    /// freshly started session is observed from its first transition.
    pub fn attach(&self, instance_name: &str, agent_id: &str) -> (Arc<ConnectionSession>, Subscription) {
        let (session, subscription) = self.lookup_or_start(instance_name, agent_id, true);
        let subscription = subscription.unwrap_or_else(|| session.subscribe());
        (session, subscription)
    }

    fn lookup_or_start(
        &self,
        instance_name: &str,
        agent_id: &str,
        subscribe: bool,
    ) -> (Arc<ConnectionSession>, Option<Subscription>) {
        let mut sessions = self.lock();
        if let Some(session) = sessions.get(instance_name) {
            if session.is_live() {
                let subscription = subscribe.then(|| session.subscribe());
                return (Arc::clone(session), subscription);
            }
            tracing::debug!(instance = %instance_name, "replacing ended session");
        }

        let context = self.context.clone();
        let (session, subscription) = if subscribe {
            let (session, subscription) =
                ConnectionSession::start_subscribed(instance_name, agent_id, context);
            (session, Some(subscription))
        } else {
            (ConnectionSession::start(instance_name, agent_id, context), None)
        };
        let session = Arc::new(session);
        sessions.insert(instance_name.to_owned(), Arc::clone(&session));
        (session, subscription)
    }

    pub fn get(&self, instance_name: &str) -> Option<Arc<ConnectionSession>> {
        self.lock().get(instance_name).cloned()
    }

    /// Removes and closes the session. Live subscribers receive a terminal
    /// `session-removed` event.
    pub fn remove(&self, instance_name: &str) -> Option<Arc<ConnectionSession>> {
        let removed = self.lock().remove(instance_name);
        if let Some(session) = &removed {
            session.close(reason::SESSION_REMOVED);
            self.context.metrics.session_removed();
            tracing::info!(instance = %instance_name, "session removed");
        }
        removed
    }

    /// Instance names currently tracked, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshots of every tracked session, sorted by instance name.
    pub fn snapshots(&self) -> Vec<StatusEvent> {
        let sessions: Vec<Arc<ConnectionSession>> = self.lock().values().cloned().collect();
        let mut snapshots: Vec<StatusEvent> = sessions
            .iter()
            .map(|session| session.snapshot())
            .collect();
        snapshots.sort_by(|left, right| left.instance_name.cmp(&right.instance_name));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Sessions that have not reached a terminal state.
    pub fn live_count(&self) -> usize {
        self.lock().values().filter(|session| session.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes every session.
    pub fn clear(&self) -> Vec<Arc<ConnectionSession>> {
        let drained: Vec<(String, Arc<ConnectionSession>)> = self.lock().drain().collect();
        drained
            .into_iter()
            .map(|(name, session)| {
                session.close(reason::SESSION_REMOVED);
                self.context.metrics.session_removed();
                tracing::debug!(instance = %name, "session removed on shutdown");
                session
            })
            .collect()
    }
}
