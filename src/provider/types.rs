//! Wire types of the provider REST API.
//!
//! Unknown fields are ignored everywhere; a response missing the fields a call
//! needs is turned into [`ProviderError::Decode`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::ProviderError,
    provider::{ConnectOutcome, ProviderInstance, ProviderState},
    status::QrPayload,
};

/// Integration requested when creating instances.
pub const INTEGRATION_BAILEYS: &str = "WHATSAPP-BAILEYS";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceRequest<'a> {
    pub instance_name: &'a str,
    pub qrcode: bool,
    pub integration: &'a str,
}

impl<'a> CreateInstanceRequest<'a> {
    pub fn new(instance_name: &'a str) -> Self {
        Self {
            instance_name,
            qrcode: true,
            integration: INTEGRATION_BAILEYS,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendTextRequest<'a> {
    pub number: &'a str,
    pub text_message: TextMessage<'a>,
}

#[derive(Debug, Serialize)]
pub struct TextMessage<'a> {
    pub text: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum QrField {
    Code(String),
    Object {
        code: Option<String>,
        base64: Option<String>,
    },
}

#[derive(Debug, Default, Deserialize)]
struct InstanceField {
    state: Option<String>,
    status: Option<String>,
}

impl InstanceField {
    fn state(self) -> Option<String> {
        self.state.or(self.status)
    }
}

/// Body of `GET /instance/connect/{name}`.
#[derive(Debug, Deserialize)]
pub struct ConnectResponse {
    qrcode: Option<QrField>,
    code: Option<String>,
    base64: Option<String>,
    state: Option<String>,
    instance: Option<InstanceField>,
}

impl ConnectResponse {
    pub fn into_outcome(self) -> Result<ConnectOutcome, ProviderError> {
        let (code, image) = match self.qrcode {
            Some(QrField::Code(code)) if !code.starts_with("data:") => (Some(code), self.base64),
            Some(QrField::Code(image)) => (self.code, Some(image)),
            Some(QrField::Object { code, base64 }) => (code.or(self.code), base64.or(self.base64)),
            None => (self.code, self.base64),
        };

        if let Some(code) = code.filter(|code| !code.is_empty()) {
            return Ok(ConnectOutcome::Qr(QrPayload::new(code, image)));
        }

        let state = self
            .state
            .or_else(|| self.instance.and_then(InstanceField::state));
        match state {
            Some(state) => Ok(ConnectOutcome::State(ProviderState::parse(&state))),
            None => Err(ProviderError::Decode(
                "connect response carries neither a qrcode nor a state".to_owned(),
            )),
        }
    }
}

/// Body of `GET /instance/connectionState/{name}`.
#[derive(Debug, Deserialize)]
pub struct StateResponse {
    state: Option<String>,
    instance: Option<InstanceField>,
}

impl StateResponse {
    pub fn into_state(self) -> Result<ProviderState, ProviderError> {
        self.state
            .or_else(|| self.instance.and_then(InstanceField::state))
            .map(|state| ProviderState::parse(&state))
            .ok_or_else(|| ProviderError::Decode("connection state response has no state".to_owned()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NestedInstance {
    pub instance_name: String,
    pub status: Option<String>,
}

/// One entry of `GET /instance/fetchInstances`, in either the flat or nested layout.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum InstanceEntry {
    #[serde(rename_all = "camelCase")]
    Flat {
        name: String,
        connection_status: Option<String>,
    },
    Nested { instance: NestedInstance },
}

impl From<InstanceEntry> for ProviderInstance {
    fn from(entry: InstanceEntry) -> Self {
        match entry {
            InstanceEntry::Flat {
                name,
                connection_status,
            } => Self {
                name,
                connection_status,
            },
            InstanceEntry::Nested { instance } => Self {
                name: instance.instance_name,
                connection_status: instance.status,
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorResponseField {
    message: Option<Value>,
}

/// Error envelope returned with non-2xx statuses.
#[derive(Debug, Default, Deserialize)]
pub struct ErrorBody {
    error: Option<String>,
    message: Option<Value>,
    response: Option<ErrorResponseField>,
}

impl ErrorBody {
    /// Best human-readable message, falling back to the raw body.
    pub fn message(body: &str) -> String {
        let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
        parsed
            .response
            .and_then(|response| response.message)
            .or(parsed.message)
            .and_then(|value| flatten_message(&value))
            .or(parsed.error)
            .unwrap_or_else(|| body.trim().chars().take(200).collect())
    }
}

fn flatten_message(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(flatten_message).collect();
            (!parts.is_empty()).then(|| parts.join("; "))
        }
        _ => None,
    }
}
