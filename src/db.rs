//! Conversation store
//!
//! Provides durable, keyed persistence for conversations and their messages.

mod schema;

pub use schema::*;

use crate::transcript::{Transcript, TranscriptError};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Transcript rejected: {0}")]
    Transcript(#[from] TranscriptError),
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> DbResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // A panic while holding the lock leaves no partial transaction behind,
    // so a poisoned connection is still usable.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ==================== Conversation Operations ====================

    /// Create a new, empty conversation
    pub fn create_conversation(&self, id: &str, model: Option<&str>) -> DbResult<Conversation> {
        let conn = self.conn();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO conversations (id, model, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![id, model, now.to_rfc3339()],
        )?;

        Ok(Conversation {
            id: id.to_string(),
            model: model.map(String::from),
            created_at: now,
            updated_at: now,
            message_count: 0,
        })
    }

    /// Get conversation by ID
    #[cfg(test)]
    pub fn get_conversation(&self, id: &str) -> DbResult<Conversation> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT c.id, c.model, c.created_at, c.updated_at,
                    (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id) as message_count
             FROM conversations c WHERE c.id = ?1",
        )?;

        stmt.query_row(params![id], |row| {
            Ok(Conversation {
                id: row.get(0)?,
                model: row.get(1)?,
                created_at: parse_datetime(&row.get::<_, String>(2)?),
                updated_at: parse_datetime(&row.get::<_, String>(3)?),
                message_count: row.get(4)?,
            })
        })
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::ConversationNotFound(id.to_string()),
            other => DbError::Sqlite(other),
        })
    }

    // ==================== Message Operations ====================

    /// Get messages for a conversation in sequence order
    #[cfg(test)]
    pub fn get_messages(&self, conversation_id: &str) -> DbResult<Vec<Message>> {
        let conn = self.conn();
        load_messages(&conn, conversation_id)
    }

    /// Load a conversation's validated transcript
    pub fn get_transcript(&self, conversation_id: &str) -> DbResult<Transcript> {
        let conn = self.conn();
        if !conversation_exists(&conn, conversation_id)? {
            return Err(DbError::ConversationNotFound(conversation_id.to_string()));
        }
        let messages = load_messages(&conn, conversation_id)?;
        Ok(Transcript::from_messages(conversation_id, messages)?)
    }

    /// Append messages atomically.
    ///
    /// The batch is validated against the stored transcript (sequence ids
    /// must continue it, tool results must answer open invocations) and
    /// written in one transaction: either every message lands or none does.
    pub fn append_messages(&self, conversation_id: &str, messages: &[Message]) -> DbResult<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        if !conversation_exists(&tx, conversation_id)? {
            return Err(DbError::ConversationNotFound(conversation_id.to_string()));
        }

        let mut transcript =
            Transcript::from_messages(conversation_id, load_messages(&tx, conversation_id)?)?;

        for message in messages {
            transcript.push(message.clone())?;

            let content_str = serde_json::to_string(&message.content.to_json())
                .unwrap_or_else(|_| "null".to_string());
            let sources_str = if message.sources.is_empty() {
                None
            } else {
                serde_json::to_string(&message.sources).ok()
            };
            let usage_str = message
                .usage_data
                .as_ref()
                .and_then(|u| serde_json::to_string(u).ok());

            tx.execute(
                "INSERT INTO messages (message_id, conversation_id, sequence_id, message_type, content, sources, usage_data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    message.message_id,
                    conversation_id,
                    message.sequence_id,
                    message.message_type.to_string(),
                    content_str,
                    sources_str,
                    usage_str,
                    message.created_at.to_rfc3339(),
                ],
            )?;
        }

        tx.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), conversation_id],
        )?;

        tx.commit()?;
        Ok(())
    }
}

fn conversation_exists(conn: &Connection, id: &str) -> DbResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM conversations WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn load_messages(conn: &Connection, conversation_id: &str) -> DbResult<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT message_id, conversation_id, sequence_id, message_type, content, sources, usage_data, created_at
         FROM messages WHERE conversation_id = ?1 ORDER BY sequence_id ASC",
    )?;

    let rows = stmt.query_map(params![conversation_id], parse_message_row)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
}

/// Parse a message row from the database
fn parse_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let type_str: String = row.get(3)?;
    let msg_type = MessageType::parse(&type_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Text,
            format!("unknown message type {type_str}").into(),
        )
    })?;

    let content_str: String = row.get(4)?;
    let content_value: serde_json::Value = serde_json::from_str(&content_str).unwrap_or_default();
    let content = MessageContent::from_json(msg_type, content_value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, e.into()))?;

    Ok(Message {
        message_id: row.get(0)?,
        conversation_id: row.get(1)?,
        sequence_id: row.get(2)?,
        message_type: msg_type,
        content,
        sources: row
            .get::<_, Option<String>>(5)?
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        usage_data: row
            .get::<_, Option<String>>(6)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_datetime(&row.get::<_, String>(7)?),
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
