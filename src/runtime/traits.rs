//! Trait abstractions for runtime I/O
//!
//! These traits enable testing the executor with mock implementations.

use crate::db::{Database, DbError, Message};
use crate::llm::{LlmError, LlmRequest, LlmResponse, ModelRegistry, ToolDefinition};
use crate::state_machine::{ToolCall, ToolInput, ToolResult};
use crate::tools::{ToolContext, ToolError, ToolRegistry};
use crate::transcript::Transcript;
use async_trait::async_trait;
use std::sync::Arc;

/// Keyed, durable conversation storage
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Register a new, empty conversation
    async fn create(&self, conv_id: &str, model: &str) -> Result<(), DbError>;

    /// Load the committed transcript of a conversation
    async fn get(&self, conv_id: &str) -> Result<Transcript, DbError>;

    /// Append a batch of messages atomically
    async fn append(&self, conv_id: &str, messages: &[Message]) -> Result<(), DbError>;
}

/// Client for making LLM requests
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Complete an LLM request
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Get the model ID
    fn model_id(&self) -> &str;
}

/// Executor for tool invocations
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Run one invocation. Failures come back as error-flagged results.
    async fn execute(&self, call: &ToolCall, ctx: ToolContext) -> ToolResult;

    /// Get tool definitions for LLM
    fn definitions(&self) -> Vec<ToolDefinition>;
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: ConversationStore + ?Sized> ConversationStore for Arc<T> {
    async fn create(&self, conv_id: &str, model: &str) -> Result<(), DbError> {
        (**self).create(conv_id, model).await
    }

    async fn get(&self, conv_id: &str) -> Result<Transcript, DbError> {
        (**self).get(conv_id).await
    }

    async fn append(&self, conv_id: &str, messages: &[Message]) -> Result<(), DbError> {
        (**self).append(conv_id, messages).await
    }
}

#[async_trait]
impl<T: LlmClient + ?Sized> LlmClient for Arc<T> {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        (**self).complete(request).await
    }

    fn model_id(&self) -> &str {
        (**self).model_id()
    }
}

#[async_trait]
impl<T: ToolExecutor + ?Sized> ToolExecutor for Arc<T> {
    async fn execute(&self, call: &ToolCall, ctx: ToolContext) -> ToolResult {
        (**self).execute(call, ctx).await
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        (**self).definitions()
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

/// Adapter to use Database as a `ConversationStore`
#[derive(Clone)]
pub struct DatabaseStore {
    db: Database,
}

impl DatabaseStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ConversationStore for DatabaseStore {
    async fn create(&self, conv_id: &str, model: &str) -> Result<(), DbError> {
        self.db.create_conversation(conv_id, Some(model)).map(|_| ())
    }

    async fn get(&self, conv_id: &str) -> Result<Transcript, DbError> {
        self.db.get_transcript(conv_id)
    }

    async fn append(&self, conv_id: &str, messages: &[Message]) -> Result<(), DbError> {
        self.db.append_messages(conv_id, messages)
    }
}

/// Adapter to use `ModelRegistry` as `LlmClient`
pub struct RegistryLlmClient {
    registry: Arc<ModelRegistry>,
    model_id: String,
}

impl RegistryLlmClient {
    pub fn new(registry: Arc<ModelRegistry>, model_id: String) -> Self {
        Self { registry, model_id }
    }
}

#[async_trait]
impl LlmClient for RegistryLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let llm = self
            .registry
            .get(&self.model_id)
            .or_else(|| self.registry.default())
            .ok_or_else(|| LlmError::auth("No LLM provider is configured"))?;
        llm.complete(request).await
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Adapter to use `ToolRegistry` as `ToolExecutor`
pub struct ToolRegistryExecutor {
    registry: ToolRegistry,
}

impl ToolRegistryExecutor {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistryExecutor {
    async fn execute(&self, call: &ToolCall, ctx: ToolContext) -> ToolResult {
        match &call.input {
            ToolInput::Malformed { name, reason, .. } => {
                let err = ToolError::MalformedInvocation {
                    name: name.clone(),
                    reason: reason.clone(),
                };
                return ToolResult::error(&call.id, err.to_string());
            }
            ToolInput::Unknown { name, .. } if name.trim().is_empty() => {
                return ToolResult::error(&call.id, "Tool call is missing a tool name");
            }
            ToolInput::Unknown { name, .. } => {
                return ToolResult::error(&call.id, format!("Unknown tool: {name}"));
            }
            _ => {}
        }

        match self
            .registry
            .execute(call.name(), call.input.to_value(), ctx)
            .await
        {
            Some(out) if out.success => ToolResult::success(&call.id, out.output, out.sources),
            Some(out) => ToolResult::error(&call.id, out.output),
            None => ToolResult::error(&call.id, format!("Unknown tool: {}", call.name())),
        }
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }
}
