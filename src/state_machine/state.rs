//! Conversation state types

use crate::llm::LlmErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

// ============================================================================
// Tool Input Types - Strongly typed inputs for each tool
// ============================================================================

/// Wire name of the document retrieval tool
pub const RETRIEVE_TOOL: &str = "vectordb_search";
/// Wire name of the web search tool
pub const WEB_SEARCH_TOOL: &str = "internet_search";
/// Wire name of the clarification marker tool
pub const ASK_USER_TOOL: &str = "user_ask";

/// Input for the retrieval tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrieveInput {
    pub search_query: String,
}

/// Input for the web search tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSearchInput {
    pub search_query: String,
}

/// Input for the ask-user marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskUserInput {
    pub question: String,
}

/// Strongly typed tool input enum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tool", rename_all = "snake_case")]
pub enum ToolInput {
    Retrieve(RetrieveInput),
    WebSearch(WebSearchInput),
    AskUser(AskUserInput),
    /// Known tool whose arguments failed validation
    Malformed {
        name: String,
        input: Value,
        reason: String,
    },
    /// Tool name the agent does not offer
    Unknown { name: String, input: Value },
}

impl ToolInput {
    /// Get the tool name
    pub fn tool_name(&self) -> &str {
        match self {
            ToolInput::Retrieve(_) => RETRIEVE_TOOL,
            ToolInput::WebSearch(_) => WEB_SEARCH_TOOL,
            ToolInput::AskUser(_) => ASK_USER_TOOL,
            ToolInput::Malformed { name, .. } | ToolInput::Unknown { name, .. } => name,
        }
    }

    /// Convert to JSON Value for tool execution
    pub fn to_value(&self) -> Value {
        match self {
            ToolInput::Retrieve(input) => serde_json::to_value(input).unwrap_or(Value::Null),
            ToolInput::WebSearch(input) => serde_json::to_value(input).unwrap_or(Value::Null),
            ToolInput::AskUser(input) => serde_json::to_value(input).unwrap_or(Value::Null),
            ToolInput::Malformed { input, .. } | ToolInput::Unknown { input, .. } => input.clone(),
        }
    }

    /// Parse from tool name and JSON value
    pub fn from_name_and_value(name: &str, value: Value) -> Self {
        match name {
            RETRIEVE_TOOL => parse_input::<RetrieveInput>(name, value, |i| &i.search_query)
                .map_or_else(|m| m, ToolInput::Retrieve),
            WEB_SEARCH_TOOL => parse_input::<WebSearchInput>(name, value, |i| &i.search_query)
                .map_or_else(|m| m, ToolInput::WebSearch),
            ASK_USER_TOOL => parse_input::<AskUserInput>(name, value, |i| &i.question)
                .map_or_else(|m| m, ToolInput::AskUser),
            _ => ToolInput::Unknown {
                name: name.to_string(),
                input: value,
            },
        }
    }
}

/// Deserialize a tool's arguments and reject a blank required field.
fn parse_input<T: serde::de::DeserializeOwned>(
    name: &str,
    value: Value,
    required: impl Fn(&T) -> &String,
) -> Result<T, ToolInput> {
    let malformed = |input: Value, reason: String| ToolInput::Malformed {
        name: name.to_string(),
        input,
        reason,
    };

    match serde_json::from_value::<T>(value.clone()) {
        Ok(parsed) if required(&parsed).trim().is_empty() => {
            Err(malformed(value, "required argument is empty".to_string()))
        }
        Ok(parsed) => Ok(parsed),
        Err(e) => Err(malformed(value, e.to_string())),
    }
}

// ============================================================================
// Tool Call - A tool invocation with ID and typed input
// ============================================================================

/// A tool call from the LLM with typed input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub input: ToolInput,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, input: ToolInput) -> Self {
        Self {
            id: id.into(),
            input,
        }
    }

    /// Get the tool name
    pub fn name(&self) -> &str {
        self.input.tool_name()
    }
}

// ============================================================================
// Sources and tool results
// ============================================================================

/// Provenance of a retrieved document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Raw metadata fields as stored in the index
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl SourceMetadata {
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            source: None,
            page: None,
            location: None,
            metadata: Map::new(),
        }
    }
}

/// Append `incoming` to `buffer`, skipping documents already present.
pub fn merge_sources(buffer: &mut Vec<SourceMetadata>, incoming: &[SourceMetadata]) {
    for src in incoming {
        if !buffer.iter().any(|s| s.document_id == src.document_id) {
            buffer.push(src.clone());
        }
    }
}

/// Outcome of one tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub output: String,
    pub is_error: bool,
    /// Documents surfaced by this invocation
    #[serde(default)]
    pub sources: Vec<SourceMetadata>,
}

impl ToolResult {
    pub fn success(
        tool_use_id: impl Into<String>,
        output: impl Into<String>,
        sources: Vec<SourceMetadata>,
    ) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            output: output.into(),
            is_error: false,
            sources,
        }
    }

    pub fn error(tool_use_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            output: message.into(),
            is_error: true,
            sources: vec![],
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Classification of a failed turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    RateLimit,
    ServerError,
    Auth,
    InvalidRequest,
    Unknown,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::RateLimit | ErrorKind::ServerError
        )
    }
}

impl From<LlmErrorKind> for ErrorKind {
    fn from(kind: LlmErrorKind) -> Self {
        match kind {
            LlmErrorKind::Network => ErrorKind::Network,
            LlmErrorKind::RateLimit => ErrorKind::RateLimit,
            LlmErrorKind::ServerError => ErrorKind::ServerError,
            LlmErrorKind::Auth => ErrorKind::Auth,
            LlmErrorKind::InvalidRequest => ErrorKind::InvalidRequest,
            LlmErrorKind::Unknown => ErrorKind::Unknown,
        }
    }
}

// ============================================================================
// Conversation State
// ============================================================================

/// Per-turn agent state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConvState {
    /// Ready for user input, no pending operations
    #[default]
    Idle,

    /// Model request in flight, with retry tracking
    AwaitingModel {
        attempt: u32,
        /// Sources to attach to the next assistant message
        #[serde(default)]
        pending_sources: Vec<SourceMetadata>,
    },

    /// Executing tools serially
    ToolDispatch {
        current_tool: ToolCall,
        remaining_tools: Vec<ToolCall>,
        /// IDs of tools whose results have already been recorded
        #[serde(default)]
        resolved_tool_ids: HashSet<String>,
        #[serde(default)]
        pending_sources: Vec<SourceMetadata>,
    },

    /// The last turn failed; a new user message recovers
    Error {
        message: String,
        error_kind: ErrorKind,
    },
}

impl ConvState {
    /// Sources waiting for the next assistant message
    pub fn pending_sources(&self) -> &[SourceMetadata] {
        match self {
            ConvState::AwaitingModel {
                pending_sources, ..
            }
            | ConvState::ToolDispatch {
                pending_sources, ..
            } => pending_sources,
            ConvState::Idle | ConvState::Error { .. } => &[],
        }
    }
}

/// Context for a conversation (immutable configuration)
#[derive(Debug, Clone)]
pub struct ConvContext {
    pub conversation_id: String,
    pub model_id: String,
}

impl ConvContext {
    pub fn new(conversation_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            model_id: model_id.into(),
        }
    }
}
