use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    Router,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use tokio::{net::TcpListener, task::JoinHandle};

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub api_key: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone)]
struct MockResponse {
    status: u16,
    body: String,
    delay: Duration,
}

#[derive(Default)]
struct MockState {
    responses: Mutex<HashMap<String, MockResponse>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// Provider REST API stand-in. Unscripted routes answer 404.
pub struct EvolutionMock {
    pub base_url: String,
    state: Arc<MockState>,
    task: JoinHandle<()>,
}

fn route_key(method: &str, path: &str) -> String {
    format!("{} {path}", method.to_ascii_uppercase())
}

impl EvolutionMock {
    pub async fn start() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(MockState::default());
        let router = Router::new().fallback(handle).with_state(state.clone());

        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Ok(Self {
            base_url: format!("http://{addr}"),
            state,
            task,
        })
    }

    pub fn respond(&self, method: &str, path: &str, status: u16, body: serde_json::Value) {
        self.respond_raw(method, path, status, &body.to_string());
    }

    pub fn respond_raw(&self, method: &str, path: &str, status: u16, body: &str) {
        self.insert(method, path, status, body, Duration::ZERO);
    }

    pub fn respond_slowly(&self, method: &str, path: &str, delay: Duration, body: serde_json::Value) {
        self.insert(method, path, 200, &body.to_string(), delay);
    }

    fn insert(&self, method: &str, path: &str, status: u16, body: &str, delay: Duration) {
        self.state.responses.lock().unwrap().insert(
            route_key(method, path),
            MockResponse {
                status,
                body: body.to_owned(),
                delay,
            },
        );
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> anyhow::Result<RecordedRequest> {
        self.requests()
            .pop()
            .ok_or_else(|| anyhow::anyhow!("mock provider received no request"))
    }
}

impl Drop for EvolutionMock {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle(
    State(state): State<Arc<MockState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    let path = uri.path().to_owned();
    state.requests.lock().unwrap().push(RecordedRequest {
        method: method.to_string(),
        path: path.clone(),
        api_key: headers
            .get("apikey")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned),
        body,
    });

    let scripted = state
        .responses
        .lock()
        .unwrap()
        .get(&route_key(method.as_str(), &path))
        .cloned();
    let Some(response) = scripted else {
        return (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "application/json")],
            r#"{"status":404,"error":"Not Found","response":{"message":["route not scripted"]}}"#,
        )
            .into_response();
    };

    if !response.delay.is_zero() {
        tokio::time::sleep(response.delay).await;
    }
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        response.body,
    )
        .into_response()
}
