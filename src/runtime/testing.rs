//! Mock implementations and end-to-end turn tests
//!
//! These mocks drive whole turns through `RuntimeManager` without network
//! access. The store is a real in-memory SQLite database.

use super::traits::*;
use super::{RuntimeManager, TurnError, TurnOutcome};
use crate::db::{Database, DbError, Message, MessageContent};
use crate::llm::{ContentBlock, LlmError, LlmRequest, LlmResponse, ToolDefinition, Usage};
use crate::state_machine::{ToolCall, ToolResult, TurnKind};
use crate::tools::{
    IndexMatch, SearchHit, SearchProvider, ToolContext, ToolError, ToolRegistry, VectorIndex,
};
use crate::transcript::Transcript;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

// ============================================================================
// Mock LLM Client
// ============================================================================

/// Mock LLM client that returns queued responses
pub struct MockLlmClient {
    responses: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    /// Record of all requests made
    requests: Mutex<Vec<LlmRequest>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    /// Notified when a request starts (for test synchronization)
    pub request_started: Notify,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            request_started: Notify::new(),
        }
    }

    /// Queue a successful response
    pub fn queue_response(&self, response: LlmResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    /// Queue an error response
    pub fn queue_error(&self, error: LlmError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    /// Get recorded requests
    pub fn recorded_requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Most requests that were ever in flight at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.request_started.notify_one();

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::network("No mock response queued")))
    }

    fn model_id(&self) -> &str {
        "mock-model"
    }
}

pub fn text_response(text: &str) -> LlmResponse {
    LlmResponse {
        content: vec![ContentBlock::text(text)],
        end_turn: true,
        usage: Usage {
            input_tokens: 100,
            output_tokens: 20,
        },
    }
}

pub fn tool_response(calls: &[(&str, &str, Value)]) -> LlmResponse {
    LlmResponse {
        content: calls
            .iter()
            .map(|(id, name, input)| ContentBlock::tool_use(*id, *name, input.clone()))
            .collect(),
        end_turn: false,
        usage: Usage {
            input_tokens: 100,
            output_tokens: 10,
        },
    }
}

// ============================================================================
// Tool doubles
// ============================================================================

/// Canned document index
pub enum StubIndex {
    Hits(Vec<IndexMatch>),
    Fails,
}

#[async_trait]
impl VectorIndex for StubIndex {
    async fn search(&self, _query: &str, top_k: usize) -> Result<Vec<IndexMatch>, ToolError> {
        match self {
            StubIndex::Hits(hits) => Ok(hits.iter().take(top_k).cloned().collect()),
            StubIndex::Fails => Err(ToolError::Provider {
                status: 503,
                body: "index unavailable".to_string(),
            }),
        }
    }
}

struct NoWebHits;

#[async_trait]
impl SearchProvider for NoWebHits {
    async fn search(&self, _query: &str, _max: usize) -> Result<Vec<SearchHit>, ToolError> {
        Ok(vec![])
    }
}

/// Records every invocation before delegating to the real executor
pub struct RecordingTools {
    inner: ToolRegistryExecutor,
    executions: Mutex<Vec<String>>,
}

impl RecordingTools {
    pub fn new(index: StubIndex) -> Self {
        let index: Arc<dyn VectorIndex> = Arc::new(index);
        let registry = ToolRegistry::standard(Some(index), Arc::new(NoWebHits), 4, 5);
        Self {
            inner: ToolRegistryExecutor::new(registry),
            executions: Mutex::new(Vec::new()),
        }
    }

    pub fn recorded_executions(&self) -> Vec<String> {
        self.executions.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolExecutor for RecordingTools {
    async fn execute(&self, call: &ToolCall, ctx: ToolContext) -> ToolResult {
        self.executions
            .lock()
            .unwrap()
            .push(call.name().to_string());
        self.inner.execute(call, ctx).await
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.inner.definitions()
    }
}

/// Store whose backing database is unreachable
pub struct FailingStore;

#[async_trait]
impl ConversationStore for FailingStore {
    async fn create(&self, _conv_id: &str, _model: &str) -> Result<(), DbError> {
        Ok(())
    }

    async fn get(&self, _conv_id: &str) -> Result<Transcript, DbError> {
        Err(DbError::Sqlite(rusqlite::Error::InvalidQuery))
    }

    async fn append(&self, _conv_id: &str, _messages: &[Message]) -> Result<(), DbError> {
        Err(DbError::Sqlite(rusqlite::Error::InvalidQuery))
    }
}

pub fn deck_guide() -> IndexMatch {
    IndexMatch {
        id: "doc-1".to_string(),
        score: 0.92,
        content: "Decks attached to a dwelling require a building permit.".to_string(),
        metadata: json!({"source": "deck-guide.pdf", "page": 3, "section": "Permits"})
            .as_object()
            .cloned()
            .unwrap(),
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    manager: Arc<RuntimeManager>,
    db: Database,
    llm: Arc<MockLlmClient>,
    tools: Arc<RecordingTools>,
}

impl Harness {
    fn new(llm: MockLlmClient, index: StubIndex) -> Self {
        Self::with_timeout(llm, index, Duration::from_secs(10))
    }

    fn with_timeout(llm: MockLlmClient, index: StubIndex, timeout: Duration) -> Self {
        Self::build(llm, index, timeout, super::DEFAULT_IDLE_TIMEOUT)
    }

    fn with_idle_timeout(llm: MockLlmClient, idle_timeout: Duration) -> Self {
        Self::build(llm, StubIndex::Hits(vec![]), Duration::from_secs(10), idle_timeout)
    }

    fn build(
        llm: MockLlmClient,
        index: StubIndex,
        timeout: Duration,
        idle_timeout: Duration,
    ) -> Self {
        let db = Database::open_in_memory().unwrap();
        let llm = Arc::new(llm);
        let tools = Arc::new(RecordingTools::new(index));
        let manager = RuntimeManager::new(
            Arc::new(DatabaseStore::new(db.clone())),
            llm.clone(),
            tools.clone(),
            timeout,
        )
        .with_idle_timeout(idle_timeout);
        Self {
            manager: Arc::new(manager),
            db,
            llm,
            tools,
        }
    }

    fn existing_conversation(&self) -> String {
        let id = RuntimeManager::new_conversation_id();
        self.db.create_conversation(&id, Some("mock-model")).unwrap();
        id
    }

    async fn start(&self, text: &str) -> (String, Result<TurnOutcome, TurnError>) {
        let id = RuntimeManager::new_conversation_id();
        let result = self.manager.start_conversation(&id, text.to_string()).await;
        (id, result)
    }
}

fn texts(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .map(|m| match &m.content {
            MessageContent::User(u) => u.text.clone(),
            MessageContent::Agent(_) => m.content.agent_text().unwrap_or_default(),
            MessageContent::Tool(t) => format!("tool:{}", t.tool_use_id),
        })
        .collect()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_retrieval_then_answer_carries_sources() {
    let llm = MockLlmClient::new();
    llm.queue_response(tool_response(&[(
        "t1",
        "vectordb_search",
        json!({"search_query": "deck permit"}),
    )]));
    llm.queue_response(text_response(
        "Yes, a permit is required [Source: deck-guide.pdf | Page: 3 | Section: Permits]",
    ));
    let h = Harness::new(llm, StubIndex::Hits(vec![deck_guide()]));

    let (id, result) = h.start("Do I need a permit for a deck?").await;
    let outcome = result.unwrap();

    assert_eq!(outcome.conversation_id, id);
    assert_eq!(outcome.kind, TurnKind::Answered);
    assert!(outcome.answer.starts_with("Yes, a permit is required"));
    assert_eq!(outcome.sources.len(), 1);
    assert_eq!(outcome.sources[0].document_id, "doc-1");
    assert_eq!(outcome.sources[0].source.as_deref(), Some("deck-guide.pdf"));
    assert_eq!(outcome.sources[0].page, Some(3));

    let messages = h.manager.get_transcript(&id).await.unwrap();
    assert_eq!(messages.len(), 4);
    // Only the response following the retrieval carries sources
    assert!(messages[1].sources.is_empty());
    assert_eq!(messages[3].sources.len(), 1);
    assert!(messages[3].usage_data.is_some());

    let requests = h.llm.recorded_requests();
    assert_eq!(requests.len(), 2);
    assert!(!requests[0].parallel_tool_calls);
    assert_eq!(requests[0].tools.len(), 3);
    assert!(requests[0].system[0].text.contains("Today's date is"));
    match &requests[1].messages[2].content[0] {
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            assert_eq!(tool_use_id, "t1");
            assert!(content.contains("Document ID: doc-1"));
            assert!(!is_error);
        }
        other => panic!("expected tool result, got {other:?}"),
    }
}

#[tokio::test]
async fn test_clarification_question_returned_verbatim() {
    let llm = MockLlmClient::new();
    llm.queue_response(tool_response(&[(
        "t1",
        "user_ask",
        json!({"question": "Is the deck attached to the house?"}),
    )]));
    llm.queue_response(text_response("Then a permit is required."));
    let h = Harness::new(llm, StubIndex::Hits(vec![]));

    let (id, result) = h.start("Do I need a deck permit?").await;
    let outcome = result.unwrap();
    assert_eq!(outcome.kind, TurnKind::Clarification);
    assert_eq!(outcome.answer, "Is the deck attached to the house?");
    assert_eq!(outcome.conversation_id, id);
    assert!(outcome.sources.is_empty());
    assert!(h.tools.recorded_executions().is_empty());

    let reply = h
        .manager
        .continue_conversation(&id, "Yes, attached".to_string())
        .await
        .unwrap();
    assert_eq!(reply.conversation_id, id);
    assert_eq!(reply.answer, "Then a permit is required.");

    let messages = h.manager.get_transcript(&id).await.unwrap();
    assert_eq!(
        texts(&messages),
        vec![
            "Do I need a deck permit?",
            "",
            "tool:t1",
            "Is the deck attached to the house?",
            "Yes, attached",
            "Then a permit is required.",
        ]
    );

    // The follow-up request sees the question and the reply in order
    let requests = h.llm.recorded_requests();
    assert_eq!(requests[1].messages.len(), 5);
}

#[tokio::test]
async fn test_index_failure_is_reported_to_model() {
    let llm = MockLlmClient::new();
    llm.queue_response(tool_response(&[(
        "t1",
        "vectordb_search",
        json!({"search_query": "setbacks"}),
    )]));
    llm.queue_response(text_response("The document index is unavailable right now."));
    let h = Harness::new(llm, StubIndex::Fails);

    let (id, result) = h.start("What are the setback rules?").await;
    let outcome = result.unwrap();
    assert_eq!(outcome.kind, TurnKind::Answered);
    assert!(outcome.sources.is_empty());
    assert_eq!(h.llm.recorded_requests().len(), 2);

    let messages = h.manager.get_transcript(&id).await.unwrap();
    match &messages[2].content {
        MessageContent::Tool(t) => {
            assert!(t.is_error);
            assert!(t.content.contains("503"));
        }
        other => panic!("expected tool message, got {other:?}"),
    }
}

#[tokio::test]
async fn test_nameless_tool_call_is_reported_to_model() {
    let llm = MockLlmClient::new();
    llm.queue_response(tool_response(&[("", "", json!({}))]));
    llm.queue_response(text_response("Let me answer directly: decks need a permit."));
    let h = Harness::new(llm, StubIndex::Hits(vec![]));

    let (id, result) = h.start("Do decks need a permit?").await;
    let outcome = result.unwrap();
    assert_eq!(outcome.kind, TurnKind::Answered);
    assert_eq!(outcome.answer, "Let me answer directly: decks need a permit.");
    assert_eq!(h.llm.recorded_requests().len(), 2);

    let messages = h.manager.get_transcript(&id).await.unwrap();
    assert_eq!(messages.len(), 4);
    match &messages[2].content {
        MessageContent::Tool(t) => {
            assert_eq!(t.tool_use_id, "call_0");
            assert!(t.is_error);
        }
        other => panic!("expected tool message, got {other:?}"),
    }
}

#[tokio::test]
async fn test_repeated_tool_ids_each_get_a_result() {
    let llm = MockLlmClient::new();
    llm.queue_response(tool_response(&[
        ("t1", "vectordb_search", json!({"search_query": "deck permit"})),
        ("t1", "internet_search", json!({"search_query": "deck permit fee"})),
    ]));
    llm.queue_response(text_response("A permit is required."));
    let h = Harness::new(llm, StubIndex::Hits(vec![deck_guide()]));

    let (id, result) = h.start("Do decks need a permit?").await;
    assert_eq!(result.unwrap().answer, "A permit is required.");
    assert_eq!(
        h.tools.recorded_executions(),
        vec!["vectordb_search", "internet_search"]
    );

    let messages = h.manager.get_transcript(&id).await.unwrap();
    assert_eq!(
        texts(&messages),
        vec![
            "Do decks need a permit?",
            "",
            "tool:t1",
            "tool:call_1",
            "A permit is required."
        ]
    );
}

#[tokio::test]
async fn test_concurrent_turns_are_serialized() {
    let llm = MockLlmClient::with_delay(Duration::from_millis(100));
    llm.queue_response(text_response("answer one"));
    llm.queue_response(text_response("answer two"));
    let h = Harness::new(llm, StubIndex::Hits(vec![]));
    let id = h.existing_conversation();

    let manager = h.manager.clone();
    let conv = id.clone();
    let first =
        tokio::spawn(async move { manager.continue_conversation(&conv, "first".into()).await });
    h.llm.request_started.notified().await;

    let manager = h.manager.clone();
    let conv = id.clone();
    let second =
        tokio::spawn(async move { manager.continue_conversation(&conv, "second".into()).await });

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.answer, "answer one");
    assert_eq!(second.answer, "answer two");
    assert_eq!(h.llm.max_in_flight(), 1);

    let messages = h.manager.get_transcript(&id).await.unwrap();
    assert_eq!(
        texts(&messages),
        vec!["first", "answer one", "second", "answer two"]
    );
}

#[tokio::test]
async fn test_unknown_conversation_not_found() {
    let h = Harness::new(MockLlmClient::new(), StubIndex::Hits(vec![]));
    let result = h
        .manager
        .continue_conversation("no-such-thread", "hello".into())
        .await;
    assert!(matches!(result, Err(TurnError::ConversationNotFound(_))));
    assert!(h.llm.recorded_requests().is_empty());
}

#[tokio::test]
async fn test_store_unavailable_before_model_call() {
    let llm = Arc::new(MockLlmClient::new());
    let manager = RuntimeManager::new(
        Arc::new(FailingStore),
        llm.clone(),
        Arc::new(RecordingTools::new(StubIndex::Hits(vec![]))),
        Duration::from_secs(5),
    );
    let result = manager.start_conversation("c1", "hello".into()).await;
    assert!(matches!(result, Err(TurnError::StoreUnavailable(_))));
    assert!(llm.recorded_requests().is_empty());
}

#[tokio::test]
async fn test_provider_failure_commits_nothing() {
    let llm = MockLlmClient::new();
    llm.queue_error(LlmError::auth("invalid api key"));
    llm.queue_response(text_response("recovered"));
    let h = Harness::new(llm, StubIndex::Hits(vec![]));

    let (id, result) = h.start("hello").await;
    assert!(matches!(result, Err(TurnError::ModelProvider { .. })));
    assert!(h.manager.get_transcript(&id).await.unwrap().is_empty());

    // The conversation stays usable
    let outcome = h
        .manager
        .continue_conversation(&id, "hello again".into())
        .await
        .unwrap();
    assert_eq!(outcome.answer, "recovered");
    assert_eq!(h.manager.get_transcript(&id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_retryable_error_is_retried() {
    let llm = MockLlmClient::new();
    llm.queue_error(LlmError::server_error("502 bad gateway"));
    llm.queue_response(text_response("<think>check R507</think>Decks need footings."));
    let h = Harness::new(llm, StubIndex::Hits(vec![]));

    let (id, result) = h.start("Deck footing rules?").await;
    let outcome = result.unwrap();
    assert_eq!(outcome.answer, "Decks need footings.");
    assert_eq!(h.llm.recorded_requests().len(), 2);

    // The stored message keeps the reasoning span
    let messages = h.manager.get_transcript(&id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert!(messages[1]
        .content
        .agent_text()
        .unwrap()
        .starts_with("<think>"));
}

#[tokio::test]
async fn test_timeout_commits_nothing() {
    let llm = MockLlmClient::with_delay(Duration::from_millis(500));
    llm.queue_response(text_response("too late"));
    let h = Harness::with_timeout(llm, StubIndex::Hits(vec![]), Duration::from_millis(50));
    let id = h.existing_conversation();

    let result = h
        .manager
        .continue_conversation(&id, "hello".into())
        .await;
    assert!(matches!(result, Err(TurnError::TimedOut)));
    assert!(h.manager.get_transcript(&id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dropped_caller_abandons_turn() {
    let llm = MockLlmClient::with_delay(Duration::from_millis(200));
    llm.queue_response(text_response("answer"));
    let h = Harness::new(llm, StubIndex::Hits(vec![]));
    let id = h.existing_conversation();

    let manager = h.manager.clone();
    let conv = id.clone();
    let pending =
        tokio::spawn(async move { manager.continue_conversation(&conv, "first".into()).await });
    h.llm.request_started.notified().await;
    pending.abort();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.manager.get_transcript(&id).await.unwrap().is_empty());

    // The abandoned request never consumed the queued response
    let outcome = h
        .manager
        .continue_conversation(&id, "second".into())
        .await
        .unwrap();
    assert_eq!(outcome.answer, "answer");
    assert_eq!(
        texts(&h.manager.get_transcript(&id).await.unwrap()),
        vec!["second", "answer"]
    );
}

#[tokio::test]
async fn test_shutdown_cancels_in_flight_turn() {
    let llm = MockLlmClient::with_delay(Duration::from_secs(5));
    llm.queue_response(text_response("never"));
    let h = Harness::new(llm, StubIndex::Hits(vec![]));
    let id = h.existing_conversation();

    let manager = h.manager.clone();
    let conv = id.clone();
    let pending =
        tokio::spawn(async move { manager.continue_conversation(&conv, "hello".into()).await });
    h.llm.request_started.notified().await;
    h.manager.shutdown();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(TurnError::Cancelled)));
    assert!(h.manager.get_transcript(&id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_idle_runtime_is_released() {
    let llm = MockLlmClient::new();
    llm.queue_response(text_response("first answer"));
    llm.queue_response(text_response("second answer"));
    let h = Harness::with_idle_timeout(llm, Duration::from_millis(50));

    let (id, result) = h.start("hello").await;
    assert_eq!(result.unwrap().answer, "first answer");
    assert_eq!(h.manager.runtimes.read().await.len(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.manager.runtimes.read().await.is_empty());

    // The next turn spawns a fresh runtime on the committed transcript
    let outcome = h
        .manager
        .continue_conversation(&id, "again".into())
        .await
        .unwrap();
    assert_eq!(outcome.answer, "second answer");
    assert_eq!(
        texts(&h.manager.get_transcript(&id).await.unwrap()),
        vec!["hello", "first answer", "again", "second answer"]
    );
}
