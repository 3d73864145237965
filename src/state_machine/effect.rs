//! Effects produced by state transitions

use crate::db::{MessageContent, UsageData};
use crate::llm::ContentBlock;
use crate::state_machine::state::{ErrorKind, SourceMetadata, ToolCall};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a successful turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    /// The model produced a final answer
    Answered,
    /// The model asked the user a clarifying question
    Clarification,
}

/// Effects to be executed after state transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Append a message to the turn's working transcript
    AppendMessage {
        content: MessageContent,
        sources: Vec<SourceMetadata>,
        usage_data: Option<UsageData>,
    },

    /// Make an LLM request over the working transcript
    RequestLlm,

    /// Execute a tool
    ExecuteTool { tool: ToolCall },

    /// Schedule a retry
    ScheduleRetry { delay: Duration, attempt: u32 },

    /// Commit the turn's messages and reply to the caller
    CompleteTurn { kind: TurnKind },

    /// Discard the turn and report the failure
    FailTurn {
        message: String,
        error_kind: ErrorKind,
    },
}

impl Effect {
    pub fn user_message(text: impl Into<String>) -> Self {
        Effect::AppendMessage {
            content: MessageContent::user(text),
            sources: vec![],
            usage_data: None,
        }
    }

    pub fn agent_message(
        blocks: Vec<ContentBlock>,
        sources: Vec<SourceMetadata>,
        usage_data: Option<UsageData>,
    ) -> Self {
        Effect::AppendMessage {
            content: MessageContent::Agent(blocks),
            sources,
            usage_data,
        }
    }

    pub fn tool_message(
        tool_use_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Effect::AppendMessage {
            content: MessageContent::tool(tool_use_id, content, is_error),
            sources: vec![],
            usage_data: None,
        }
    }

    pub fn execute_tool(tool: ToolCall) -> Self {
        Effect::ExecuteTool { tool }
    }
}
