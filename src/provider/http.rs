use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use url::Url;

use crate::{
    error::{ProviderError, TransportError},
    provider::{
        ConnectOutcome, ProviderClient, ProviderInstance, ProviderState,
        types::{
            ConnectResponse, CreateInstanceRequest, ErrorBody, InstanceEntry, SendTextRequest,
            StateResponse, TextMessage,
        },
    },
};

const API_KEY_HEADER: &str = "apikey";

/// [`ProviderClient`] over the provider's REST API.
#[derive(Clone)]
pub struct HttpProviderClient {
    client: Client,
    base_url: Url,
    api_key: String,
}

impl HttpProviderClient {
    /// Creates a client for `base_url` authenticating with `api_key`.
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .user_agent(concat!("wa-orchestrator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|error| TransportError::Network(error.to_string()))?;

        let base_url = Url::parse(base_url)
            .map_err(|error| TransportError::Network(format!("invalid provider url: {error}")))?;
        if base_url.cannot_be_a_base() {
            return Err(TransportError::Network(format!("invalid provider url: {base_url}")).into());
        }

        Ok(Self {
            client,
            base_url,
            api_key: api_key.to_owned(),
        })
    }

    /// Appends `segments` to the base path. Each segment is percent-encoded, so an
    /// instance name can never add path segments, a query or a fragment.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send(
        &self,
        request: RequestBuilder,
        deadline: Duration,
    ) -> Result<Response, ProviderError> {
        let response = request
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(deadline)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::Provider {
            code: status.as_u16(),
            message: ErrorBody::message(&body),
        })
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        deadline: Duration,
    ) -> Result<T, ProviderError> {
        let response = self.send(request, deadline).await?;
        let bytes = response.bytes().await.map_err(map_reqwest_error)?;
        serde_json::from_slice(&bytes).map_err(|error| ProviderError::Decode(error.to_string()))
    }
}

fn map_reqwest_error(error: reqwest::Error) -> ProviderError {
    if error.is_timeout() {
        TransportError::Timeout.into()
    } else if error.is_decode() {
        ProviderError::Decode(error.to_string())
    } else {
        TransportError::Network(error.to_string()).into()
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn create_instance(&self, name: &str, deadline: Duration) -> Result<(), ProviderError> {
        let request = self
            .client
            .post(self.url(&["instance", "create"]))
            .json(&CreateInstanceRequest::new(name));
        self.send(request, deadline).await?;
        tracing::debug!(instance = %name, "provider instance created");
        Ok(())
    }

    async fn connect(&self, name: &str, deadline: Duration) -> Result<ConnectOutcome, ProviderError> {
        let request = self.client.get(self.url(&["instance", "connect", name]));
        let response: ConnectResponse = self.send_json(request, deadline).await?;
        response.into_outcome()
    }

    async fn fetch_state(
        &self,
        name: &str,
        deadline: Duration,
    ) -> Result<ProviderState, ProviderError> {
        let request = self
            .client
            .get(self.url(&["instance", "connectionState", name]));
        let response: StateResponse = self.send_json(request, deadline).await?;
        response.into_state()
    }

    async fn delete_instance(&self, name: &str, deadline: Duration) -> Result<(), ProviderError> {
        let request = self
            .client
            .delete(self.url(&["instance", "delete", name]));
        self.send(request, deadline).await?;
        Ok(())
    }

    async fn send_text(
        &self,
        name: &str,
        to: &str,
        body: &str,
        deadline: Duration,
    ) -> Result<(), ProviderError> {
        let request = self
            .client
            .post(self.url(&["message", "sendText", name]))
            .json(&SendTextRequest {
                number: to,
                text_message: TextMessage { text: body },
            });
        self.send(request, deadline).await?;
        Ok(())
    }

    async fn fetch_instances(
        &self,
        deadline: Duration,
    ) -> Result<Vec<ProviderInstance>, ProviderError> {
        let request = self.client.get(self.url(&["instance", "fetchInstances"]));
        let entries: Vec<InstanceEntry> = self.send_json(request, deadline).await?;
        Ok(entries.into_iter().map(ProviderInstance::from).collect())
    }
}
