//! Events that can occur during a turn

use crate::llm::{ContentBlock, Usage};
use crate::state_machine::state::{ErrorKind, ToolCall, ToolResult};

/// Events that trigger state transitions
#[derive(Debug, Clone)]
pub enum Event {
    // User events
    UserMessage {
        text: String,
    },

    // LLM events
    LlmResponse {
        content: Vec<ContentBlock>,
        /// Tool calls extracted from the content, in emitted order
        tool_calls: Vec<ToolCall>,
        usage: Usage,
    },
    LlmError {
        message: String,
        error_kind: ErrorKind,
        attempt: u32,
    },
    RetryTimeout {
        attempt: u32,
    },

    // Tool events
    ToolComplete {
        tool_use_id: String,
        result: ToolResult,
    },
}
