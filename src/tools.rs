//! Tool implementations for the research agent
//!
//! Tools are stateless singletons; everything a single invocation needs
//! arrives through `ToolContext`.

mod ask_user;
pub mod retrieve;
pub mod web_search;

pub use ask_user::AskUserTool;
pub use retrieve::{IndexMatch, PineconeConfig, PineconeIndex, RetrieveTool, VectorIndex};
pub use web_search::{DuckDuckGoSearch, SearchHit, SearchProvider, WebSearchTool};

use crate::state_machine::SourceMetadata;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Failures of an external tool provider
///
/// None of these end a turn: they are reported back to the model as a
/// failure-flagged tool result.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Provider returned {status}: {body}")]
    Provider { status: u16, body: String },
    #[error("No documents matched the query")]
    EmptyIndex,
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
    #[error("Cancelled")]
    Cancelled,
    #[error("Malformed {name} invocation: {reason}")]
    MalformedInvocation { name: String, reason: String },
}

/// Result from tool execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
    /// Provenance of documents that informed the output
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceMetadata>,
}

impl ToolOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            sources: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: message.into(),
            sources: Vec::new(),
        }
    }

    pub fn with_sources(mut self, sources: Vec<SourceMetadata>) -> Self {
        self.sources = sources;
        self
    }
}

impl From<ToolError> for ToolOutput {
    fn from(err: ToolError) -> Self {
        ToolOutput::error(err.to_string())
    }
}

/// All context needed for a tool invocation.
///
/// Created fresh for each tool call.
#[derive(Clone)]
pub struct ToolContext {
    /// Cancellation signal for long-running operations
    pub cancel: CancellationToken,

    /// The conversation this tool is executing within
    pub conversation_id: String,
}

impl ToolContext {
    pub fn new(cancel: CancellationToken, conversation_id: impl Into<String>) -> Self {
        Self {
            cancel,
            conversation_id: conversation_id.into(),
        }
    }

    /// Run a provider call, abandoning it if the invocation is cancelled
    pub async fn cancellable<T, F>(&self, fut: F) -> Result<T, ToolError>
    where
        F: Future<Output = Result<T, ToolError>>,
    {
        tokio::select! {
            () = self.cancel.cancelled() => Err(ToolError::Cancelled),
            result = fut => result,
        }
    }
}

/// Trait for tools that can be executed by the agent
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name
    fn name(&self) -> &str;

    /// Tool description for LLM
    fn description(&self) -> String;

    /// JSON schema for tool input
    fn input_schema(&self) -> Value;

    /// Execute the tool with all context provided via `ToolContext`
    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput;
}

/// Collection of tools offered to the model
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        Self { tools }
    }

    /// The three research tools: document retrieval, web search and the
    /// ask-user marker.
    pub fn standard(
        index: Option<Arc<dyn VectorIndex>>,
        search: Arc<dyn SearchProvider>,
        top_k: usize,
        max_results: usize,
    ) -> Self {
        Self::new(vec![
            Arc::new(RetrieveTool::new(index, top_k)),
            Arc::new(WebSearchTool::new(search, max_results)),
            Arc::new(AskUserTool),
        ])
    }

    /// Get all tool definitions for LLM
    pub fn definitions(&self) -> Vec<crate::llm::ToolDefinition> {
        self.tools
            .iter()
            .map(|t| crate::llm::ToolDefinition {
                name: t.name().to_string(),
                description: t.description(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Execute a tool by name with context
    pub async fn execute(&self, name: &str, input: Value, ctx: ToolContext) -> Option<ToolOutput> {
        for tool in &self.tools {
            if tool.name() == name {
                return Some(tool.run(input, ctx).await);
            }
        }
        None
    }
}
