//! Anthropic Messages API provider
//!
//! Sends the conversation with `stream: true` and splits the server-sent
//! event body into fragments, one per `data:` payload. Payloads are passed
//! through undecoded, except that an in-band `error` event ends the stream
//! with an error.
//!
//! # Configuration
//!
//! ```toml
//! [model]
//! provider = "anthropic"
//! name = "claude-3-5-sonnet-20240620"
//! api_key_env = "ANTHROPIC_API_KEY"
//! endpoint = "https://api.anthropic.com"
//! ```

use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::conversation::{Message, Role};

use super::{Fragment, FragmentStream, ModelRequest, ProviderError};

/// Wire message. System-role messages are folded into the `system` field.
#[derive(Debug, Clone, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    temperature: f32,
    top_p: f32,
    stream: bool,
}

/// Error body, both for rejected requests and in-band `error` events
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct EventType {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    /// Base URL, without the `/v1/messages` path
    pub base_url: String,
    /// API key; requests fail with `NotConfigured` while it is missing
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    /// Value of the `anthropic-version` header
    pub api_version: String,
    /// Connection timeout in seconds. Streams themselves are not time-boxed.
    pub connect_timeout_secs: u64,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            api_key: None,
            model: "claude-3-5-sonnet-20240620".to_string(),
            max_tokens: 8192,
            temperature: 0.3,
            top_p: 1.0,
            api_version: "2023-06-01".to_string(),
            connect_timeout_secs: 30,
        }
    }
}

pub struct AnthropicProvider {
    config: AnthropicConfig,
    client: Client,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    pub fn model_name(&self) -> &str {
        &self.config.model
    }

    fn build_request(&self, request: ModelRequest) -> MessagesRequest {
        let mut system = request.system_prompt;
        let mut messages = Vec::with_capacity(request.messages.len());

        for message in request.messages {
            match message.role {
                Role::System => {
                    if !system.is_empty() {
                        system.push_str("\n\n");
                    }
                    system.push_str(&message.content);
                }
                Role::User | Role::Assistant => messages.push(wire_message(message)),
            }
        }

        MessagesRequest {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            messages,
            system,
            temperature: self.config.temperature,
            top_p: self.config.top_p,
            stream: true,
        }
    }

    pub async fn stream(&self, request: ModelRequest) -> Result<FragmentStream, ProviderError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::NotConfigured("anthropic API key".to_string()))?;

        let body = self.build_request(request);
        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));

        tracing::debug!(model = %body.model, messages = body.messages.len(), "starting model stream");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", &self.config.api_version)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        Ok(sse_fragments(response))
    }
}

fn wire_message(message: Message) -> WireMessage {
    WireMessage {
        role: message.role.as_str(),
        content: message.content,
    }
}

fn sse_fragments(response: reqwest::Response) -> FragmentStream {
    let mut bytes = response.bytes_stream();

    Box::pin(async_stream::try_stream! {
        let mut pending: Vec<u8> = Vec::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk?;
            pending.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

            while let Some(event) = take_event(&mut pending) {
                if let Some(data) = event_data(&event) {
                    check_error_event(&data)?;
                    yield Fragment::from(data);
                }
            }
        }

        // A final event may arrive without its blank-line terminator
        if let Some(data) = event_data(&pending) {
            check_error_event(&data)?;
            yield Fragment::from(data);
        }
    })
}

/// Remove the next complete event (terminated by a blank line) from the buffer
fn take_event(pending: &mut Vec<u8>) -> Option<Vec<u8>> {
    let end = pending.windows(2).position(|w| w == b"\n\n")?;
    let event = pending[..end].to_vec();
    pending.drain(..end + 2);
    Some(event)
}

/// Join the `data:` lines of one event. Events without data yield nothing.
fn event_data(event: &[u8]) -> Option<Vec<u8>> {
    let mut data: Option<Vec<u8>> = None;

    for line in event.split(|b| *b == b'\n') {
        let Some(payload) = line.strip_prefix(b"data:") else {
            continue;
        };
        let payload = payload.strip_prefix(b" ").unwrap_or(payload);

        match data.as_mut() {
            Some(joined) => {
                joined.push(b'\n');
                joined.extend_from_slice(payload);
            }
            None => data = Some(payload.to_vec()),
        }
    }

    data
}

fn check_error_event(data: &[u8]) -> Result<(), ProviderError> {
    match serde_json::from_slice::<EventType>(data) {
        Ok(event) if event.kind == "error" => {
            let message = serde_json::from_slice::<ErrorResponse>(data)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| String::from_utf8_lossy(data).into_owned());
            Err(ProviderError::Stream(message))
        }
        _ => Ok(()),
    }
}
