use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use axum::{
    Json, Router,
    extract::{
        OriginalUri, Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant, timeout};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    error::{OrchestratorError, ProviderError, TransportError},
    events::decode_frame,
    orchestrator::Orchestrator,
    session::Subscription,
    status::{ConnectionState, StatusEvent},
};

/// How long `connect` waits for the first pairing code before answering.
const QR_WAIT: Duration = Duration::from_millis(300);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    ready: Arc<AtomicBool>,
    orchestrator: Orchestrator,
}

impl AppState {
    /// Creates a new app state with readiness disabled.
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
            orchestrator,
        }
    }

    /// Sets readiness status.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Returns readiness status.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }
}

#[derive(Debug, Serialize)]
struct RootResponse {
    name: &'static str,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadyResponse {
    ok: bool,
    event_stream_connected: bool,
}

#[derive(Debug, Serialize)]
struct InstanceOkResponse {
    instance: String,
    status: &'static str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectRequest {
    instance_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendTextRequest {
    number: String,
    text: String,
}

#[derive(Debug, Serialize)]
struct WebhookResponse {
    success: bool,
    routed: bool,
}

#[derive(Debug, Serialize)]
struct ApiErrorResponse {
    error: &'static str,
    message: String,
}

/// Builds the root HTTP router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/metrics", get(metrics_handler))
        .route("/agents/:agent_id/whatsapp/connect", post(connect_handler))
        .route(
            "/instance/connectionState/:name",
            get(connection_state_handler),
        )
        .route("/instance/events/:name", get(events_handler))
        .route("/instance/delete/:name", delete(delete_instance_handler))
        .route("/message/sendText/:name", post(send_text_handler))
        .route("/instances", get(list_instances_handler))
        .route("/provider/instances", get(provider_instances_handler))
        .route("/webhook/evolution", post(webhook_handler))
        .route("/webhook/evolution/:event", post(webhook_handler))
        .fallback(not_implemented_handler)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root_handler() -> impl IntoResponse {
    Json(RootResponse {
        name: "wa-orchestrator",
        status: "ok",
    })
}

async fn healthz_handler() -> impl IntoResponse {
    Json(HealthResponse { ok: true })
}

async fn readyz_handler(State(state): State<AppState>) -> Response {
    let body = ReadyResponse {
        ok: state.is_ready(),
        event_stream_connected: state.orchestrator.bus().is_connected(),
    };
    let status = if body.ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.metrics())
}

async fn connect_handler(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    request: Option<Json<ConnectRequest>>,
) -> Response {
    let request = request.map(|Json(request)| request).unwrap_or_default();
    let mut subscription = match state
        .orchestrator
        .connect(&agent_id, request.instance_name.as_deref())
    {
        Ok(subscription) => subscription,
        Err(error) => return map_orchestrator_error(error),
    };

    let latest = wait_for_qr_event(&mut subscription, QR_WAIT).await;
    let instance_name = subscription.instance_name().to_owned();
    // The HTTP caller polls for status; keep the attempt running without it.
    subscription.detach();

    let status = state.orchestrator.status(&instance_name).or(latest);
    match status {
        Some(status) => (StatusCode::ACCEPTED, Json(status)).into_response(),
        None => instance_not_found(instance_name),
    }
}

async fn connection_state_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    match state.orchestrator.status(&name) {
        Some(status) => (StatusCode::OK, Json(status)).into_response(),
        None => instance_not_found(name),
    }
}

async fn events_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(subscription) = state.orchestrator.subscribe(&name) else {
        return instance_not_found(name);
    };
    ws.on_upgrade(move |socket| stream_status(socket, subscription))
}

async fn stream_status(mut socket: WebSocket, mut subscription: Subscription) {
    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(error) => {
                        tracing::warn!(error = %error, "failed to encode status event");
                        continue;
                    }
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::debug!(instance = %subscription.instance_name(), "status stream closed");
}

async fn delete_instance_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    match state.orchestrator.disconnect(&name).await {
        Ok(()) => (
            StatusCode::OK,
            Json(InstanceOkResponse {
                instance: name,
                status: "deleted",
            }),
        )
            .into_response(),
        Err(error) => map_orchestrator_error(error),
    }
}

async fn send_text_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<SendTextRequest>,
) -> Response {
    match state
        .orchestrator
        .send_text(&name, &request.number, &request.text)
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            Json(InstanceOkResponse {
                instance: name,
                status: "sent",
            }),
        )
            .into_response(),
        Err(error) => map_orchestrator_error(error),
    }
}

async fn list_instances_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.statuses())
}

async fn provider_instances_handler(State(state): State<AppState>) -> Response {
    match state.orchestrator.provider_instances().await {
        Ok(instances) => (StatusCode::OK, Json(instances)).into_response(),
        Err(error) => map_orchestrator_error(error),
    }
}

/// Provider webhook push. Events reach sessions through the same bus routes as
/// websocket frames; `/:event` covers providers that post per event name.
async fn webhook_handler(State(state): State<AppState>, body: String) -> Response {
    let event = match decode_frame(&body) {
        Ok(event) => event,
        Err(error) => {
            tracing::warn!(error = %error, "rejecting malformed provider webhook");
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiErrorResponse {
                    error: "invalid_event_payload",
                    message: error.to_string(),
                }),
            )
                .into_response();
        }
    };

    let routed = event.is_some();
    match event {
        Some(event) => {
            tracing::debug!(instance = %event.instance_name, "provider webhook event");
            state.orchestrator.bus().route(event);
        }
        None => tracing::debug!("ignoring unrecognized provider webhook"),
    }
    (
        StatusCode::OK,
        Json(WebhookResponse {
            success: true,
            routed,
        }),
    )
        .into_response()
}

fn instance_not_found(name: String) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ApiErrorResponse {
            error: "instance_not_found",
            message: format!("no session for instance {name}"),
        }),
    )
        .into_response()
}

fn map_orchestrator_error(error: OrchestratorError) -> Response {
    let (status, code) = match &error {
        OrchestratorError::NotConnected(_) => (StatusCode::CONFLICT, "instance_not_connected"),
        OrchestratorError::SessionExpired(_) => (StatusCode::CONFLICT, "session_expired"),
        OrchestratorError::SessionFailed { .. } => (StatusCode::CONFLICT, "session_failed"),
        OrchestratorError::InvalidInstanceName(_) => {
            (StatusCode::BAD_REQUEST, "invalid_instance_name")
        }
        OrchestratorError::Provider(ProviderError::Transport(TransportError::Timeout)) => {
            (StatusCode::GATEWAY_TIMEOUT, "provider_timeout")
        }
        OrchestratorError::Provider(ProviderError::Transport(_)) => {
            (StatusCode::BAD_GATEWAY, "provider_unreachable")
        }
        OrchestratorError::Provider(ProviderError::Provider { .. }) => {
            (StatusCode::BAD_GATEWAY, "provider_error")
        }
        OrchestratorError::Provider(ProviderError::Decode(_)) => {
            (StatusCode::BAD_GATEWAY, "provider_decode_error")
        }
    };

    (
        status,
        Json(ApiErrorResponse {
            error: code,
            message: error.to_string(),
        }),
    )
        .into_response()
}

/// Reads the subscription until a pairing code shows up, the session leaves
/// `Creating`, or `max_wait` elapses. Returns the last event seen.
async fn wait_for_qr_event(
    subscription: &mut Subscription,
    max_wait: Duration,
) -> Option<StatusEvent> {
    let deadline = Instant::now() + max_wait;
    let mut latest = None;

    loop {
        let now = Instant::now();
        if now >= deadline {
            return latest;
        }

        let remaining = deadline.saturating_duration_since(now);
        match timeout(remaining, subscription.recv()).await {
            Ok(Some(event)) => {
                let settled = event.qr.is_some() || event.state != ConnectionState::Creating;
                latest = Some(event);
                if settled {
                    return latest;
                }
            }
            Ok(None) | Err(_) => return latest,
        }
    }
}

#[derive(Debug, Serialize)]
struct NotImplementedBody {
    error: &'static str,
    route: String,
}

async fn not_implemented_handler(uri: OriginalUri) -> impl IntoResponse {
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(NotImplementedBody {
            error: "not_implemented",
            route: uri.0.path().to_owned(),
        }),
    )
}
