//! Conversation runtime executor

use super::traits::{ConversationStore, LlmClient, ToolExecutor};
use super::{TurnError, TurnOutcome, TurnRequest};

use crate::db::{Message, MessageContent, ToolContent, UserContent};
use crate::llm::{ContentBlock, LlmMessage, LlmRequest, MessageRole, SystemContent};
use crate::state_machine::state::merge_sources;
use crate::state_machine::{
    transition, ConvContext, ConvState, Effect, Event, SourceMetadata, ToolCall, ToolInput,
    TurnKind,
};
use crate::system_prompt::build_system_prompt;
use crate::tools::ToolContext;
use crate::transcript::Transcript;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const MAX_RESPONSE_TOKENS: u32 = 4096;

static THINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"));

/// What executing one effect asks of the turn loop
enum Step {
    Continue(Option<Event>),
    Finished(TurnOutcome),
}

/// Working copy of a conversation for the duration of one turn
struct Turn {
    transcript: Transcript,
    /// First sequence id produced by this turn
    first_new_seq: i64,
}

impl Turn {
    fn new(transcript: Transcript) -> Self {
        let first_new_seq = transcript.next_sequence_id();
        Self {
            transcript,
            first_new_seq,
        }
    }

    fn new_messages(&self) -> &[Message] {
        self.transcript.suffix_from(self.first_new_seq)
    }
}

/// Serializes the turns of one conversation
///
/// Each turn runs to completion, times out or is abandoned before the next
/// request on the channel is looked at. The owner decides when an idle
/// runtime may stop.
pub struct ConversationRuntime<S, L, T>
where
    S: ConversationStore + 'static,
    L: LlmClient + 'static,
    T: ToolExecutor + 'static,
{
    context: ConvContext,
    store: S,
    llm_client: L,
    tool_executor: T,
    turn_rx: mpsc::Receiver<TurnRequest>,
    turn_timeout: Duration,
    /// Cancelled when the service shuts down
    shutdown: CancellationToken,
}

impl<S, L, T> ConversationRuntime<S, L, T>
where
    S: ConversationStore + 'static,
    L: LlmClient + 'static,
    T: ToolExecutor + 'static,
{
    pub fn new(
        context: ConvContext,
        store: S,
        llm_client: L,
        tool_executor: T,
        turn_rx: mpsc::Receiver<TurnRequest>,
        turn_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            context,
            store,
            llm_client,
            tool_executor,
            turn_rx,
            turn_timeout,
            shutdown,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.context.conversation_id
    }

    /// Serve turns until none arrives within `idle_timeout`.
    ///
    /// Returns `false` once every sender is gone and no turn can arrive.
    pub async fn serve_until_idle(&mut self, idle_timeout: Duration) -> bool {
        loop {
            match tokio::time::timeout(idle_timeout, self.turn_rx.recv()).await {
                Ok(Some(request)) => self.handle_request(request).await,
                Ok(None) => return false,
                Err(_) => return true,
            }
        }
    }

    /// Whether a turn was queued after the last receive
    pub fn has_queued_turns(&self) -> bool {
        !self.turn_rx.is_empty()
    }

    async fn handle_request(&self, request: TurnRequest) {
        let TurnRequest { text, mut reply } = request;
        let conv_id = &self.context.conversation_id;
        let started = Instant::now();

        // Dropping the guard cancels any tool still holding a child token
        let cancel = self.shutdown.child_token();
        let _guard = cancel.clone().drop_guard();

        let result = tokio::select! {
            () = reply.closed() => {
                tracing::warn!(conv_id = %conv_id, "Caller went away, abandoning turn");
                return;
            }
            () = cancel.cancelled() => Err(TurnError::Cancelled),
            result = tokio::time::timeout(self.turn_timeout, self.run_turn(text, &cancel)) => {
                result.unwrap_or(Err(TurnError::TimedOut))
            }
        };

        let duration_ms = started.elapsed().as_millis();
        match &result {
            Ok(outcome) => tracing::info!(
                conv_id = %conv_id,
                duration_ms = %duration_ms,
                kind = ?outcome.kind,
                sources = outcome.sources.len(),
                "Turn completed"
            ),
            Err(e) => tracing::warn!(
                conv_id = %conv_id,
                duration_ms = %duration_ms,
                error = %e,
                "Turn failed"
            ),
        }

        let _ = reply.send(result);
    }

    /// Run one turn against a fresh working copy of the transcript.
    ///
    /// Nothing reaches the store unless the turn completes.
    async fn run_turn(
        &self,
        text: String,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, TurnError> {
        let transcript = self
            .store
            .get(&self.context.conversation_id)
            .await
            .map_err(TurnError::from_store)?;
        let mut turn = Turn::new(transcript);

        let mut state = ConvState::Idle;
        let mut events = VecDeque::from([Event::UserMessage { text }]);

        while let Some(event) = events.pop_front() {
            let result = transition(&state, &self.context, event)?;
            state = result.new_state;

            for effect in result.effects {
                match self.execute_effect(effect, &state, &mut turn, cancel).await? {
                    Step::Continue(Some(event)) => events.push_back(event),
                    Step::Continue(None) => {}
                    Step::Finished(outcome) => return Ok(outcome),
                }
            }
        }

        Err(TurnError::Internal(
            "turn ended without reaching a final state".to_string(),
        ))
    }

    /// Execute an effect and optionally return a generated event
    async fn execute_effect(
        &self,
        effect: Effect,
        state: &ConvState,
        turn: &mut Turn,
        cancel: &CancellationToken,
    ) -> Result<Step, TurnError> {
        let conv_id = &self.context.conversation_id;

        match effect {
            Effect::AppendMessage {
                content,
                sources,
                usage_data,
            } => {
                let message = Message::new(
                    conv_id,
                    turn.transcript.next_sequence_id(),
                    content,
                    sources,
                    usage_data,
                );
                turn.transcript
                    .push(message)
                    .map_err(|e| TurnError::Internal(e.to_string()))?;
                Ok(Step::Continue(None))
            }

            Effect::RequestLlm => {
                let attempt = match state {
                    ConvState::AwaitingModel { attempt, .. } => *attempt,
                    _ => 1,
                };
                let request = self.build_request(turn.transcript.messages());

                tracing::debug!(conv_id = %conv_id, attempt, "Requesting model response");
                let event = match self.llm_client.complete(&request).await {
                    Ok(response) => {
                        let response = response.with_distinct_tool_ids();
                        let tool_calls: Vec<ToolCall> = response
                            .tool_uses()
                            .into_iter()
                            .map(|(id, name, input)| {
                                ToolCall::new(id, ToolInput::from_name_and_value(name, input.clone()))
                            })
                            .collect();
                        Event::LlmResponse {
                            content: response.content,
                            tool_calls,
                            usage: response.usage,
                        }
                    }
                    Err(e) => Event::LlmError {
                        message: e.message,
                        error_kind: e.kind.into(),
                        attempt,
                    },
                };
                Ok(Step::Continue(Some(event)))
            }

            Effect::ExecuteTool { tool } => {
                tracing::info!(conv_id = %conv_id, tool = %tool.name(), id = %tool.id, "Executing tool");
                let started = Instant::now();
                let ctx = ToolContext::new(cancel.child_token(), conv_id.clone());
                let result = self.tool_executor.execute(&tool, ctx).await;
                tracing::info!(
                    conv_id = %conv_id,
                    tool = %tool.name(),
                    duration_ms = %started.elapsed().as_millis(),
                    is_error = result.is_error,
                    sources = result.sources.len(),
                    "Tool finished"
                );
                Ok(Step::Continue(Some(Event::ToolComplete {
                    tool_use_id: tool.id,
                    result,
                })))
            }

            Effect::ScheduleRetry { delay, attempt } => {
                tracing::info!(conv_id = %conv_id, attempt, delay_ms = %delay.as_millis(), "Retrying model request");
                tokio::time::sleep(delay).await;
                Ok(Step::Continue(Some(Event::RetryTimeout { attempt })))
            }

            Effect::CompleteTurn { kind } => {
                let dangling = turn.transcript.unanswered_invocations();
                if !dangling.is_empty() {
                    return Err(TurnError::Internal(format!(
                        "turn left invocations unanswered: {}",
                        dangling.join(", ")
                    )));
                }
                let new_messages = turn.new_messages();
                self.store
                    .append(conv_id, new_messages)
                    .await
                    .map_err(TurnError::from_store)?;
                Ok(Step::Finished(outcome_from(conv_id, new_messages, kind)))
            }

            Effect::FailTurn {
                message,
                error_kind,
            } => Err(TurnError::ModelProvider {
                message,
                kind: error_kind,
            }),
        }
    }

    fn build_request(&self, messages: &[Message]) -> LlmRequest {
        let today = chrono::Local::now().date_naive();
        LlmRequest {
            system: vec![SystemContent::new(build_system_prompt(today))],
            messages: build_llm_messages(messages),
            tools: self.tool_executor.definitions(),
            max_tokens: Some(MAX_RESPONSE_TOKENS),
            parallel_tool_calls: false,
        }
    }
}

/// Convert stored messages into provider messages, in order
pub(crate) fn build_llm_messages(messages: &[Message]) -> Vec<LlmMessage> {
    messages
        .iter()
        .map(|msg| match &msg.content {
            MessageContent::User(UserContent { text }) => LlmMessage {
                role: MessageRole::User,
                content: vec![ContentBlock::text(text)],
            },
            MessageContent::Agent(blocks) => LlmMessage {
                role: MessageRole::Assistant,
                content: blocks.clone(),
            },
            // Tool results go in user message
            MessageContent::Tool(ToolContent {
                tool_use_id,
                content,
                is_error,
            }) => LlmMessage {
                role: MessageRole::User,
                content: vec![ContentBlock::tool_result(tool_use_id, content, *is_error)],
            },
        })
        .collect()
}

/// Build the caller-facing result from the messages a turn committed
fn outcome_from(conv_id: &str, new_messages: &[Message], kind: TurnKind) -> TurnOutcome {
    let mut sources: Vec<SourceMetadata> = Vec::new();
    for msg in new_messages {
        if matches!(msg.content, MessageContent::Agent(_)) {
            merge_sources(&mut sources, &msg.sources);
        }
    }

    let answer = new_messages
        .iter()
        .rev()
        .find_map(|m| m.content.agent_text())
        .map(|text| strip_reasoning(&text))
        .unwrap_or_default();

    TurnOutcome {
        conversation_id: conv_id.to_string(),
        answer,
        sources,
        kind,
    }
}

/// Remove `<think>` spans emitted by reasoning models
pub(crate) fn strip_reasoning(text: &str) -> String {
    THINK_RE.replace_all(text, "").trim().to_string()
}
