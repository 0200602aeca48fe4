use std::time::Duration;

use anyhow::{Error, Result, bail};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::core::AppConfig;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum Role {
    #[serde(rename = "system")]
    System,
    #[serde(rename = "assistant")]
    Assistant,
    #[serde(rename = "user")]
    User,
}

/// A single message as sent to the completion endpoint. Only `role`
/// and `content` go over the wire, ids stay local.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct RequestMessage {
    pub role: Role,
    pub content: String,
}

impl RequestMessage {
    pub fn new(role: Role, content: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
        }
    }
}

#[derive(Clone, Serialize, Debug, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<RequestMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn streaming(model: &str, messages: Vec<RequestMessage>) -> Self {
        Self {
            model: model.to_string(),
            messages,
            stream: true,
            temperature: None,
        }
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Raw response body chunks as they come off the wire.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, Error>>;

/// Anything that can open a streaming chat completion. The HTTP
/// client is the real one; tests swap in scripted streams.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Sends the request and resolves once response headers arrive.
    /// Non-2xx responses are errors.
    async fn stream_completion(&self, request: &CompletionRequest) -> Result<ByteStream, Error>;
}

#[derive(Clone, Debug)]
pub struct OpenAiClient {
    client: reqwest::Client,
    api_hostname: String,
    api_key: String,
    timeout: Duration,
}

impl OpenAiClient {
    pub fn new(api_hostname: &str, api_key: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_hostname: api_hostname.to_string(),
            api_key: api_key.to_string(),
            timeout,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            &config.api_hostname,
            &config.api_key,
            config.request_timeout,
        )
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.api_hostname.trim_end_matches("/")
        )
    }
}

#[async_trait]
impl CompletionBackend for OpenAiClient {
    async fn stream_completion(&self, request: &CompletionRequest) -> Result<ByteStream, Error> {
        let mut builder = self
            .client
            .post(self.completions_url())
            .header("Content-Type", "application/json")
            .timeout(self.timeout)
            .json(request);
        // Local servers usually don't care, but some proxies reject an
        // empty bearer token
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Completion request failed with status {}: {}", status, body);
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(Error::from));

        Ok(Box::pin(stream))
    }
}
