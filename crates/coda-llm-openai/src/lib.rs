mod convert;
mod stream;
mod types;

use coda_llm::request::GenerateRequest;
use coda_llm::response::Response;
use coda_llm::{
    LanguageModel, LanguageModelBackend, LanguageModelProvider, LanguageModelProviderBackend,
    RequestBuilder,
};
use std::collections::HashMap;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Configuration for an OpenAI-compatible `/chat/completions` provider.
pub struct OpenAIConfig {
    pub auth_token: String,
    pub base_url: String,
    /// Additional headers to include in every request.
    pub extra_headers: HashMap<String, String>,
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            auth_token: String::new(),
            base_url: "https://api.openai.com/v1".into(),
            extra_headers: HashMap::new(),
        }
    }
}

/// Create a provider with the given config.
pub fn provider(config: OpenAIConfig) -> LanguageModelProvider {
    LanguageModelProvider::new(OpenAIProvider {
        state: Arc::new(ProviderState {
            client: reqwest::Client::new(),
            config,
        }),
    })
}

/// Create a provider reading `OPENAI_API_KEY` and (optionally)
/// `OPENAI_BASE_URL` from the environment.
pub fn from_env() -> LanguageModelProvider {
    provider(OpenAIConfig {
        auth_token: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
        base_url: std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
        ..Default::default()
    })
}

// ---------------------------------------------------------------------------
// Extension trait for OpenAI-specific request options
// ---------------------------------------------------------------------------

/// Reasoning effort level for o-series / gpt-5 models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningEffort {
    Minimal,
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    fn as_str(self) -> &'static str {
        match self {
            ReasoningEffort::Minimal => "minimal",
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }
}

/// Extension methods for [`RequestBuilder`] that set OpenAI-specific options.
pub trait OpenAIRequestExt {
    fn reasoning_effort(&mut self, effort: ReasoningEffort) -> &mut Self;
}

impl OpenAIRequestExt for RequestBuilder {
    fn reasoning_effort(&mut self, effort: ReasoningEffort) -> &mut Self {
        self.meta("reasoning_effort", effort.as_str())
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

struct ProviderState {
    client: reqwest::Client,
    config: OpenAIConfig,
}

struct OpenAIProvider {
    state: Arc<ProviderState>,
}

impl LanguageModelProviderBackend for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self, model_id: &str) -> LanguageModel {
        LanguageModel::new(OpenAIModel {
            model_id: model_id.to_string(),
            state: Arc::clone(&self.state),
        })
    }
}

struct OpenAIModel {
    model_id: String,
    state: Arc<ProviderState>,
}

impl LanguageModelBackend for OpenAIModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn provider(&self) -> &str {
        "openai"
    }

    fn generate(&self, request: GenerateRequest) -> Response {
        let body = convert::to_chat_request(&self.model_id, &request);
        let state = Arc::clone(&self.state);
        let event_stream = stream::open(state, body);
        Response::new(event_stream)
    }
}
