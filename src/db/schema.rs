//! Database schema and types

use crate::llm::ContentBlock;
use crate::state_machine::SourceMetadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    model TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_updated ON conversations(updated_at DESC);

CREATE TABLE IF NOT EXISTS messages (
    message_id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    sequence_id INTEGER NOT NULL,
    message_type TEXT NOT NULL,
    content TEXT NOT NULL,
    sources TEXT,
    usage_data TEXT,
    created_at TEXT NOT NULL,

    UNIQUE (conversation_id, sequence_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, sequence_id);
";

/// Conversation record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: i64,
}

// ============================================================
// Message Content Types
// ============================================================

/// User message content
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserContent {
    pub text: String,
}

/// Tool result message content
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolContent {
    pub tool_use_id: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

/// Typed message content
///
/// `message_type` and `content` are stored as separate columns; the type
/// acts as the discriminator when reading content back.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    User(UserContent),
    /// Text blocks plus the ordered tool invocations
    Agent(Vec<ContentBlock>),
    Tool(ToolContent),
}

impl MessageContent {
    /// Get the message type for this content
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::User(_) => MessageType::User,
            Self::Agent(_) => MessageType::Agent,
            Self::Tool(_) => MessageType::Tool,
        }
    }

    /// Serialize content to JSON value (without type tag)
    pub fn to_json(&self) -> Value {
        match self {
            Self::User(c) => serde_json::to_value(c).unwrap_or(Value::Null),
            Self::Agent(c) => serde_json::to_value(c).unwrap_or(Value::Null),
            Self::Tool(c) => serde_json::to_value(c).unwrap_or(Value::Null),
        }
    }

    /// Deserialize content from JSON value using the message type as discriminator
    pub fn from_json(msg_type: MessageType, value: Value) -> Result<Self, String> {
        match msg_type {
            MessageType::User => serde_json::from_value(value)
                .map(Self::User)
                .map_err(|e| format!("Invalid user content: {e}")),
            MessageType::Agent => serde_json::from_value(value)
                .map(Self::Agent)
                .map_err(|e| format!("Invalid agent content: {e}")),
            MessageType::Tool => serde_json::from_value(value)
                .map(Self::Tool)
                .map_err(|e| format!("Invalid tool content: {e}")),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::User(UserContent { text: text.into() })
    }

    pub fn tool(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self::Tool(ToolContent {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error,
        })
    }

    /// Concatenated text blocks of an agent message
    pub fn agent_text(&self) -> Option<String> {
        match self {
            Self::Agent(blocks) => Some(
                blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join(""),
            ),
            _ => None,
        }
    }
}

// Serializes only the inner value; the type travels separately
impl Serialize for MessageContent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Self::User(c) => c.serialize(serializer),
            Self::Agent(c) => c.serialize(serializer),
            Self::Tool(c) => c.serialize(serializer),
        }
    }
}

/// Message record
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub message_id: String,
    pub conversation_id: String,
    pub sequence_id: i64,
    pub message_type: MessageType,
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceMetadata>,
    pub usage_data: Option<UsageData>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build a not-yet-persisted message with a fresh id
    pub fn new(
        conversation_id: &str,
        sequence_id: i64,
        content: MessageContent,
        sources: Vec<SourceMetadata>,
        usage_data: Option<UsageData>,
    ) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sequence_id,
            message_type: content.message_type(),
            content,
            sources,
            usage_data,
            created_at: Utc::now(),
        }
    }
}

/// Message type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    User,
    Agent,
    Tool,
}

impl MessageType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageType::User),
            "agent" => Some(MessageType::Agent),
            "tool" => Some(MessageType::Tool),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::User => write!(f, "user"),
            MessageType::Agent => write!(f, "agent"),
            MessageType::Tool => write!(f, "tool"),
        }
    }
}

/// Usage statistics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[allow(clippy::struct_field_names)] // tokens suffix is meaningful
pub struct UsageData {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub model: String,
}
