//! LLM integration for reply generation.
//!
//! Supports Groq (default), OpenAI, Anthropic and OpenRouter through
//! rig-core. The `RigAdapter` bridges rig's `CompletionModel` trait to our
//! `LlmProvider` trait; [`ReplyGenerator`] sits on top and owns prompt
//! assembly.

pub mod generator;
pub mod provider;
mod rig_adapter;

pub use generator::ReplyGenerator;
pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::str::FromStr;
use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::ExposeSecret;

use crate::error::LlmError;

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Groq,
    OpenAi,
    Anthropic,
    OpenRouter,
}

impl LlmBackend {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Groq => "groq",
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::OpenRouter => "openrouter",
        }
    }
}

impl FromStr for LlmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "groq" => Ok(Self::Groq),
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "openrouter" => Ok(Self::OpenRouter),
            other => Err(format!("unknown LLM backend: {other}")),
        }
    }
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let provider = match config.backend {
        LlmBackend::Groq => create_groq_provider(config)?,
        LlmBackend::OpenAi => create_openai_provider(config)?,
        LlmBackend::Anthropic => create_anthropic_provider(config)?,
        LlmBackend::OpenRouter => create_openrouter_provider(config)?,
    };
    tracing::info!(
        "Using {} (model: {})",
        config.backend.label(),
        config.model
    );
    Ok(provider)
}

fn client_error(backend: LlmBackend, e: impl std::fmt::Display) -> LlmError {
    LlmError::RequestFailed {
        provider: backend.label().to_string(),
        reason: format!("Failed to create client: {e}"),
    }
}

fn create_groq_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::groq;

    let client: groq::Client = groq::Client::new(config.api_key.expose_secret())
        .map_err(|e| client_error(config.backend, e))?;

    let model = client.completion_model(&config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model)))
}

fn create_openai_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(config.api_key.expose_secret())
            .map_err(|e| client_error(config.backend, e))?;

    let model = client.completion_model(&config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model)))
}

fn create_anthropic_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret())
            .map_err(|e| client_error(config.backend, e))?;

    let model = client.completion_model(&config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model)))
}

fn create_openrouter_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::openrouter;

    let client: openrouter::Client = openrouter::Client::new(config.api_key.expose_secret())
        .map_err(|e| client_error(config.backend, e))?;

    let model = client.completion_model(&config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model)))
}
