//! Model-invocation providers
//!
//! A provider turns a conversation into an asynchronous sequence of opaque
//! fragments. Decoding those fragments is left to the stream assembler.

mod anthropic;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::config::Config;
use crate::conversation::Message;

pub use anthropic::{AnthropicConfig, AnthropicProvider};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Stream error: {0}")]
    Stream(String),
}

/// One undecoded unit of model output, as received from the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment(Vec<u8>);

impl Fragment {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Fragment {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&str> for Fragment {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

/// Fragments in arrival order. A transport failure ends the sequence with an error.
pub type FragmentStream = BoxStream<'static, Result<Fragment, ProviderError>>;

/// What a provider needs to produce a reply
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub messages: Vec<Message>,
    pub system_prompt: String,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Start a streamed completion. Errors before the first fragment are
    /// returned here; later ones arrive inside the stream.
    async fn stream(&self, request: ModelRequest) -> Result<FragmentStream, ProviderError>;
}

pub enum Provider {
    Anthropic(AnthropicProvider),
}

impl Provider {
    pub fn from_config(config: &Config) -> Result<Self, ProviderError> {
        let model = &config.service.model;
        match model.provider.to_lowercase().as_str() {
            "anthropic" => {
                let api_key = std::env::var(&model.api_key_env).ok();
                if api_key.is_none() {
                    tracing::warn!(
                        env = %model.api_key_env,
                        "no API key set, chat requests will fail until it is provided"
                    );
                }

                let settings = AnthropicConfig {
                    base_url: model.endpoint.clone(),
                    api_key,
                    model: model.name.clone(),
                    max_tokens: model.max_tokens,
                    temperature: model.temperature,
                    top_p: model.top_p,
                    ..AnthropicConfig::default()
                };
                Ok(Provider::Anthropic(AnthropicProvider::new(settings)?))
            }
            _ => Err(ProviderError::UnknownProvider(model.provider.clone())),
        }
    }

    pub fn model_name(&self) -> &str {
        match self {
            Provider::Anthropic(p) => p.model_name(),
        }
    }
}

#[async_trait]
impl ModelClient for Provider {
    async fn stream(&self, request: ModelRequest) -> Result<FragmentStream, ProviderError> {
        match self {
            Provider::Anthropic(p) => p.stream(request).await,
        }
    }
}
