//! Append-only conversation transcript
//!
//! Every tool result must answer an invocation from the most recent
//! assistant message, with only tool results in between, and each
//! invocation is answered at most once. `Transcript::push` rejects
//! anything else, so a transcript that exists is always well-formed.

use crate::db::{Message, MessageContent};
use crate::llm::ContentBlock;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TranscriptError {
    #[error("Tool result {tool_use_id} does not answer an open invocation")]
    OrphanToolResult { tool_use_id: String },
    #[error("Invocation {tool_use_id} already has a result")]
    DuplicateToolResult { tool_use_id: String },
    #[error("Message belongs to conversation {found}, expected {expected}")]
    ForeignConversation { expected: String, found: String },
    #[error("Expected sequence id {expected}, got {found}")]
    OutOfSequence { expected: i64, found: i64 },
}

/// Ordered messages of one conversation
#[derive(Debug, Clone)]
pub struct Transcript {
    conversation_id: String,
    messages: Vec<Message>,
    /// Invocations of the latest assistant message still accepting results
    open_invocations: HashSet<String>,
    answered: HashSet<String>,
}

impl Transcript {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            messages: Vec::new(),
            open_invocations: HashSet::new(),
            answered: HashSet::new(),
        }
    }

    /// Rebuild from stored messages, validating each one
    pub fn from_messages(
        conversation_id: impl Into<String>,
        messages: impl IntoIterator<Item = Message>,
    ) -> Result<Self, TranscriptError> {
        let mut transcript = Self::new(conversation_id);
        for message in messages {
            transcript.push(message)?;
        }
        Ok(transcript)
    }

    /// Append a message if it keeps the transcript well-formed
    pub fn push(&mut self, message: Message) -> Result<(), TranscriptError> {
        if message.conversation_id != self.conversation_id {
            return Err(TranscriptError::ForeignConversation {
                expected: self.conversation_id.clone(),
                found: message.conversation_id,
            });
        }

        let expected = self.next_sequence_id();
        if message.sequence_id != expected {
            return Err(TranscriptError::OutOfSequence {
                expected,
                found: message.sequence_id,
            });
        }

        match &message.content {
            MessageContent::Tool(tool) => {
                if self.answered.contains(&tool.tool_use_id) {
                    return Err(TranscriptError::DuplicateToolResult {
                        tool_use_id: tool.tool_use_id.clone(),
                    });
                }
                if !self.open_invocations.contains(&tool.tool_use_id) {
                    return Err(TranscriptError::OrphanToolResult {
                        tool_use_id: tool.tool_use_id.clone(),
                    });
                }
                self.answered.insert(tool.tool_use_id.clone());
            }
            MessageContent::Agent(blocks) => {
                self.open_invocations = blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolUse { id, .. } => Some(id.clone()),
                        _ => None,
                    })
                    .collect();
                self.answered.clear();
            }
            MessageContent::User(_) => {
                self.open_invocations.clear();
                self.answered.clear();
            }
        }

        self.messages.push(message);
        Ok(())
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Sequence id the next appended message must carry
    pub fn next_sequence_id(&self) -> i64 {
        self.messages.last().map_or(1, |m| m.sequence_id + 1)
    }

    /// Invocations of the latest assistant message that have no result yet
    pub fn unanswered_invocations(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .open_invocations
            .difference(&self.answered)
            .map(String::as_str)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Messages from `sequence_id` onwards
    pub fn suffix_from(&self, sequence_id: i64) -> &[Message] {
        let start = self
            .messages
            .iter()
            .position(|m| m.sequence_id >= sequence_id)
            .unwrap_or(self.messages.len());
        &self.messages[start..]
    }
}
