use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use wa_orchestrator::{
    ProviderError, QrPayload, TransportError,
    provider::{ConnectOutcome, ProviderClient, ProviderInstance, ProviderState},
};

/// Scripted provider. Each call pops its queue and falls back to the default
/// once the queue is empty.
pub struct MockProvider {
    create: Mutex<VecDeque<Result<(), ProviderError>>>,
    connect: Mutex<VecDeque<Result<ConnectOutcome, ProviderError>>>,
    connect_default: Mutex<Result<ConnectOutcome, ProviderError>>,
    state: Mutex<VecDeque<Result<ProviderState, ProviderError>>>,
    state_default: Mutex<Result<ProviderState, ProviderError>>,
    delete_result: Mutex<Result<(), ProviderError>>,
    send_result: Mutex<Result<(), ProviderError>>,
    instances: Mutex<Vec<ProviderInstance>>,
    create_delay: Mutex<Duration>,
    pub create_calls: AtomicUsize,
    pub connect_calls: AtomicUsize,
    pub state_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    pub send_calls: AtomicUsize,
    pub sent: Mutex<Vec<(String, String, String)>>,
}

pub fn qr(code: &str) -> ConnectOutcome {
    ConnectOutcome::Qr(QrPayload::new(code, None))
}

pub fn network_error() -> ProviderError {
    TransportError::Network("connection refused".to_owned()).into()
}

pub fn provider_error(code: u16, message: &str) -> ProviderError {
    ProviderError::Provider {
        code,
        message: message.to_owned(),
    }
}

impl MockProvider {
    /// Issues `ABC123` on connect and reports `close` until told otherwise.
    pub fn new() -> Self {
        Self {
            create: Mutex::new(VecDeque::new()),
            connect: Mutex::new(VecDeque::new()),
            connect_default: Mutex::new(Ok(qr("ABC123"))),
            state: Mutex::new(VecDeque::new()),
            state_default: Mutex::new(Ok(ProviderState::Close)),
            delete_result: Mutex::new(Ok(())),
            send_result: Mutex::new(Ok(())),
            instances: Mutex::new(Vec::new()),
            create_delay: Mutex::new(Duration::ZERO),
            create_calls: AtomicUsize::new(0),
            connect_calls: AtomicUsize::new(0),
            state_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            send_calls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn push_create(self, result: Result<(), ProviderError>) -> Self {
        self.create.lock().unwrap().push_back(result);
        self
    }

    pub fn push_connect(self, result: Result<ConnectOutcome, ProviderError>) -> Self {
        self.connect.lock().unwrap().push_back(result);
        self
    }

    pub fn push_state(self, result: Result<ProviderState, ProviderError>) -> Self {
        self.state.lock().unwrap().push_back(result);
        self
    }

    pub fn with_connect_default(self, result: Result<ConnectOutcome, ProviderError>) -> Self {
        *self.connect_default.lock().unwrap() = result;
        self
    }

    /// What `fetch_state` reports once the scripted queue is empty.
    pub fn with_state_default(self, result: Result<ProviderState, ProviderError>) -> Self {
        *self.state_default.lock().unwrap() = result;
        self
    }

    pub fn with_delete_result(self, result: Result<(), ProviderError>) -> Self {
        *self.delete_result.lock().unwrap() = result;
        self
    }

    pub fn with_send_result(self, result: Result<(), ProviderError>) -> Self {
        *self.send_result.lock().unwrap() = result;
        self
    }

    pub fn with_instances(self, instances: Vec<ProviderInstance>) -> Self {
        *self.instances.lock().unwrap() = instances;
        self
    }

    pub fn with_create_delay(self, delay: Duration) -> Self {
        *self.create_delay.lock().unwrap() = delay;
        self
    }

    /// Drops any scripted states and changes what `fetch_state` reports from now on.
    pub fn set_state(&self, result: Result<ProviderState, ProviderError>) {
        self.state.lock().unwrap().clear();
        *self.state_default.lock().unwrap() = result;
    }

    pub fn total_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
            + self.connect_calls.load(Ordering::SeqCst)
            + self.state_calls.load(Ordering::SeqCst)
            + self.delete_calls.load(Ordering::SeqCst)
            + self.send_calls.load(Ordering::SeqCst)
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    async fn create_instance(&self, _name: &str, _deadline: Duration) -> Result<(), ProviderError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.create_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.create.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn connect(&self, _name: &str, _deadline: Duration) -> Result<ConnectOutcome, ProviderError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.connect.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.connect_default.lock().unwrap().clone())
    }

    async fn fetch_state(
        &self,
        _name: &str,
        _deadline: Duration,
    ) -> Result<ProviderState, ProviderError> {
        self.state_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.state.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.state_default.lock().unwrap().clone())
    }

    async fn delete_instance(&self, _name: &str, _deadline: Duration) -> Result<(), ProviderError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.delete_result.lock().unwrap().clone()
    }

    async fn send_text(
        &self,
        name: &str,
        to: &str,
        body: &str,
        _deadline: Duration,
    ) -> Result<(), ProviderError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        self.sent
            .lock()
            .unwrap()
            .push((name.to_owned(), to.to_owned(), body.to_owned()));
        self.send_result.lock().unwrap().clone()
    }

    async fn fetch_instances(
        &self,
        _deadline: Duration,
    ) -> Result<Vec<ProviderInstance>, ProviderError> {
        Ok(self.instances.lock().unwrap().clone())
    }
}
