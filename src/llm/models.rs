//! Centralized model definitions for all LLM providers

use super::openai::{ChatModel, OpenAICompatService};
use super::LlmService;
use std::sync::Arc;

/// LLM provider enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Groq,
    OpenAI,
}

impl Provider {
    /// Get the display name for this provider
    pub fn display_name(self) -> &'static str {
        match self {
            Provider::Groq => "Groq",
            Provider::OpenAI => "OpenAI",
        }
    }

    /// Get the environment variable name for this provider's API key
    pub fn api_key_env_var(self) -> &'static str {
        match self {
            Provider::Groq => "GROQ_API_KEY",
            Provider::OpenAI => "OPENAI_API_KEY",
        }
    }
}

/// Model definition with metadata
#[derive(Debug, Clone)]
pub struct ModelDef {
    /// User-facing model ID, identical to the provider's API name
    pub id: &'static str,
    pub provider: Provider,
    pub description: &'static str,
    pub model: ChatModel,
}

impl ModelDef {
    /// Create the service for this model
    pub fn create(
        &self,
        api_key: &str,
        gateway: Option<&str>,
    ) -> Result<Arc<dyn LlmService>, String> {
        if api_key.is_empty() {
            return Err(format!(
                "{} requires {} or gateway",
                self.id,
                self.provider.api_key_env_var()
            ));
        }
        OpenAICompatService::new(api_key.to_string(), self.model, gateway)
            .map(|svc| Arc::new(svc) as Arc<dyn LlmService>)
            .map_err(|e| e.to_string())
    }
}

/// Get all available model definitions
pub fn all_models() -> &'static [ModelDef] {
    &[
        ModelDef {
            id: "deepseek-r1-distill-llama-70b",
            provider: Provider::Groq,
            description: "DeepSeek R1 distilled Llama 70B (reasoning)",
            model: ChatModel::DeepseekR1DistillLlama70b,
        },
        ModelDef {
            id: "llama-3.3-70b-versatile",
            provider: Provider::Groq,
            description: "Llama 3.3 70B (general purpose)",
            model: ChatModel::Llama33Versatile70b,
        },
        ModelDef {
            id: "llama-3.1-8b-instant",
            provider: Provider::Groq,
            description: "Llama 3.1 8B (fast, cheap)",
            model: ChatModel::Llama31Instant8b,
        },
        ModelDef {
            id: "gpt-4o",
            provider: Provider::OpenAI,
            description: "GPT-4o",
            model: ChatModel::GPT4o,
        },
        ModelDef {
            id: "gpt-4o-mini",
            provider: Provider::OpenAI,
            description: "GPT-4o mini (fast, cheap)",
            model: ChatModel::GPT4oMini,
        },
    ]
}
