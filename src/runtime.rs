//! Runtime for executing conversations
//!
//! Every conversation id is served by one actor task fed through an `mpsc`
//! channel, so turns for the same conversation run strictly one at a time
//! in arrival order while different conversations proceed concurrently.
//! An actor that sees no turn for `idle_timeout` is removed, and the next
//! turn for that conversation spawns a fresh one.

mod executor;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use executor::ConversationRuntime;
pub use traits::*;

use crate::db::{DbError, Message};
use crate::state_machine::{ConvContext, ErrorKind, SourceMetadata, TransitionError, TurnKind};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;

/// Runtime over shared trait objects, as built by `RuntimeManager`
pub type SharedRuntime = ConversationRuntime<
    Arc<dyn ConversationStore>,
    Arc<dyn LlmClient>,
    Arc<dyn ToolExecutor>,
>;

pub const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Queued turns per conversation before callers wait for capacity
const TURN_QUEUE_DEPTH: usize = 16;

/// Result of a completed turn
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub conversation_id: String,
    /// Final assistant text with reasoning spans removed
    pub answer: String,
    /// Deduplicated sources attached during the turn
    pub sources: Vec<SourceMetadata>,
    pub kind: TurnKind,
}

/// Why a turn produced no answer. Nothing from a failed turn is committed.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("Model provider error: {message}")]
    ModelProvider { message: String, kind: ErrorKind },
    #[error("Conversation store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Message text is empty")]
    EmptyMessage,
    #[error("Turn timed out")]
    TimedOut,
    #[error("Turn was cancelled")]
    Cancelled,
    #[error("Conversation runtime unavailable")]
    RuntimeUnavailable,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TurnError {
    fn from_store(err: DbError) -> Self {
        match err {
            DbError::ConversationNotFound(id) => TurnError::ConversationNotFound(id),
            DbError::Sqlite(e) => TurnError::StoreUnavailable(e.to_string()),
            DbError::Transcript(e) => TurnError::Internal(e.to_string()),
        }
    }
}

impl From<TransitionError> for TurnError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::EmptyMessage => TurnError::EmptyMessage,
            other => TurnError::Internal(other.to_string()),
        }
    }
}

/// One user message waiting for its turn
#[derive(Debug)]
pub struct TurnRequest {
    pub text: String,
    pub reply: oneshot::Sender<Result<TurnOutcome, TurnError>>,
}

/// Handle to interact with a running conversation
///
/// Callers hold an `Arc` clone while sending, which keeps the actor from
/// being removed under them.
struct ConversationHandle {
    turn_tx: mpsc::Sender<TurnRequest>,
}

type RuntimeMap = Arc<RwLock<HashMap<String, Arc<ConversationHandle>>>>;

/// Manager for all conversation runtimes
pub struct RuntimeManager {
    store: Arc<dyn ConversationStore>,
    llm_client: Arc<dyn LlmClient>,
    tool_executor: Arc<dyn ToolExecutor>,
    turn_timeout: Duration,
    idle_timeout: Duration,
    runtimes: RuntimeMap,
    shutdown: CancellationToken,
}

impl RuntimeManager {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        llm_client: Arc<dyn LlmClient>,
        tool_executor: Arc<dyn ToolExecutor>,
        turn_timeout: Duration,
    ) -> Self {
        Self {
            store,
            llm_client,
            tool_executor,
            turn_timeout,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            runtimes: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// How long a conversation's actor waits for a turn before it is released
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Cancel every in-flight turn. Cancelled turns commit nothing.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Allocate an id for a new conversation
    pub fn new_conversation_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Create conversation `conv_id` and run its first turn
    pub async fn start_conversation(
        &self,
        conv_id: &str,
        text: String,
    ) -> Result<TurnOutcome, TurnError> {
        self.store
            .create(conv_id, self.llm_client.model_id())
            .await
            .map_err(TurnError::from_store)?;
        tracing::info!(conv_id = %conv_id, model = %self.llm_client.model_id(), "Created conversation");
        self.continue_conversation(conv_id, text).await
    }

    /// Run one turn on an existing conversation
    pub async fn continue_conversation(
        &self,
        conv_id: &str,
        text: String,
    ) -> Result<TurnOutcome, TurnError> {
        let handle = self.get_or_create(conv_id).await?;
        let (reply, reply_rx) = oneshot::channel();

        if handle.turn_tx.send(TurnRequest { text, reply }).await.is_err() {
            // The actor died; forget it so the next turn spawns a new one
            let mut runtimes = self.runtimes.write().await;
            if runtimes.get(conv_id).is_some_and(|h| Arc::ptr_eq(h, &handle)) {
                runtimes.remove(conv_id);
            }
            return Err(TurnError::RuntimeUnavailable);
        }
        drop(handle);

        reply_rx.await.map_err(|_| TurnError::RuntimeUnavailable)?
    }

    /// Committed transcript of a conversation
    pub async fn get_transcript(&self, conv_id: &str) -> Result<Vec<Message>, TurnError> {
        let transcript = self
            .store
            .get(conv_id)
            .await
            .map_err(TurnError::from_store)?;
        Ok(transcript.messages().to_vec())
    }

    /// Handle for the conversation's runtime, spawning it on first use
    async fn get_or_create(&self, conv_id: &str) -> Result<Arc<ConversationHandle>, TurnError> {
        if let Some(handle) = self.runtimes.read().await.get(conv_id) {
            return Ok(Arc::clone(handle));
        }

        // Unknown ids never get a runtime
        self.store
            .get(conv_id)
            .await
            .map_err(TurnError::from_store)?;

        let mut runtimes = self.runtimes.write().await;
        if let Some(handle) = runtimes.get(conv_id) {
            return Ok(Arc::clone(handle));
        }

        let (turn_tx, turn_rx) = mpsc::channel(TURN_QUEUE_DEPTH);
        let context = ConvContext::new(conv_id, self.llm_client.model_id());
        let runtime: SharedRuntime = ConversationRuntime::new(
            context,
            Arc::clone(&self.store),
            Arc::clone(&self.llm_client),
            Arc::clone(&self.tool_executor),
            turn_rx,
            self.turn_timeout,
            self.shutdown.clone(),
        );
        tokio::spawn(supervise(
            runtime,
            Arc::clone(&self.runtimes),
            self.idle_timeout,
        ));

        let handle = Arc::new(ConversationHandle { turn_tx });
        runtimes.insert(conv_id.to_string(), Arc::clone(&handle));
        tracing::debug!(conv_id = %conv_id, active = runtimes.len(), "Spawned conversation runtime");
        Ok(handle)
    }
}

/// Run a conversation's actor and release it once it goes idle.
///
/// Removal happens under the map's write lock and only when no caller holds
/// the handle and no turn is queued. A caller that cloned the handle is
/// always served by this actor.
async fn supervise(mut runtime: SharedRuntime, runtimes: RuntimeMap, idle_timeout: Duration) {
    let conv_id = runtime.conversation_id().to_string();
    tracing::info!(conv_id = %conv_id, "Starting conversation runtime");

    // A closed channel means the map no longer holds this actor
    while runtime.serve_until_idle(idle_timeout).await {
        let mut map = runtimes.write().await;
        let in_use = map.get(&conv_id).is_some_and(|h| Arc::strong_count(h) > 1);
        if in_use || runtime.has_queued_turns() {
            continue;
        }
        map.remove(&conv_id);
        break;
    }

    tracing::info!(conv_id = %conv_id, "Conversation runtime released");
}
