//! Property-based tests for the state machine
//!
//! These drive whole turns through `transition` with generated model
//! responses and check that key invariants hold for every input.

use super::state::*;
use super::transition::*;
use super::*;
use crate::db::{Message, MessageContent};
use crate::llm::{ContentBlock, Usage};
use crate::transcript::Transcript;
use proptest::prelude::*;
use serde_json::json;
use std::collections::{HashSet, VecDeque};

// ============================================================================
// Test Helpers
// ============================================================================

fn test_context() -> ConvContext {
    ConvContext::new("test-conv", "test-model")
}

/// Shape of a generated invocation; ids are assigned when a response is built
#[derive(Debug, Clone)]
enum CallKind {
    Retrieve { docs: Vec<String> },
    WebSearch,
    AskUser,
    MalformedAsk,
    Unknown,
}

fn build_call(id: String, kind: &CallKind) -> ToolCall {
    let input = match kind {
        CallKind::Retrieve { .. } => ToolInput::from_name_and_value(
            RETRIEVE_TOOL,
            json!({"search_query": "fire separation"}),
        ),
        CallKind::WebSearch => ToolInput::from_name_and_value(
            WEB_SEARCH_TOOL,
            json!({"search_query": "permit office hours"}),
        ),
        CallKind::AskUser => {
            ToolInput::from_name_and_value(ASK_USER_TOOL, json!({"question": "Which building?"}))
        }
        CallKind::MalformedAsk => ToolInput::from_name_and_value(ASK_USER_TOOL, json!({})),
        CallKind::Unknown => ToolInput::from_name_and_value("shell", json!({"cmd": "ls"})),
    };
    ToolCall::new(id, input)
}

/// Result a well-behaved executor would report for this invocation
fn simulate_tool(call: &ToolCall, kind: &CallKind) -> ToolResult {
    match kind {
        CallKind::Retrieve { docs } => ToolResult::success(
            &call.id,
            "retrieved documents",
            docs.iter().map(SourceMetadata::new).collect(),
        ),
        CallKind::WebSearch => ToolResult::success(&call.id, "search results", vec![]),
        CallKind::AskUser | CallKind::MalformedAsk | CallKind::Unknown => {
            ToolResult::error(&call.id, "not executable")
        }
    }
}

fn response_event(calls: &[ToolCall]) -> Event {
    let mut content = vec![ContentBlock::text("thinking")];
    content.extend(
        calls
            .iter()
            .map(|c| ContentBlock::tool_use(&c.id, c.name(), c.input.to_value())),
    );
    Event::LlmResponse {
        content,
        tool_calls: calls.to_vec(),
        usage: Usage::default(),
    }
}

/// Everything observed while running one turn
struct TurnTrace {
    transcript: Transcript,
    /// (agent message sources, sources produced by tools since the previous agent message)
    agent_sources: Vec<(Vec<SourceMetadata>, Vec<SourceMetadata>)>,
    executed: Vec<ToolCall>,
    completed: Option<TurnKind>,
    final_state: ConvState,
}

/// Run a full turn, answering model requests from `script` in order and
/// ending with a plain text answer once the script is exhausted.
fn run_turn(script: &[Vec<CallKind>]) -> TurnTrace {
    let ctx = test_context();
    let mut state = ConvState::Idle;
    let mut transcript = Transcript::new("test-conv");
    let mut agent_sources = Vec::new();
    let mut produced_since_agent: Vec<SourceMetadata> = Vec::new();
    let mut executed = Vec::new();
    let mut completed = None;
    let mut kinds_by_id = std::collections::HashMap::new();

    let mut responses = script.iter().enumerate();
    let mut events = VecDeque::from([Event::UserMessage {
        text: "How thick must a firewall be?".to_string(),
    }]);

    while let Some(event) = events.pop_front() {
        let result = transition(&state, &ctx, event).expect("transition failed");
        state = result.new_state;

        for effect in result.effects {
            match effect {
                Effect::AppendMessage {
                    content,
                    sources,
                    usage_data,
                } => {
                    if matches!(content, MessageContent::Agent(_)) {
                        agent_sources.push((sources.clone(), std::mem::take(&mut produced_since_agent)));
                    }
                    let msg = Message::new(
                        "test-conv",
                        transcript.next_sequence_id(),
                        content,
                        sources,
                        usage_data,
                    );
                    transcript.push(msg).expect("transcript invariant violated");
                }
                Effect::RequestLlm => match responses.next() {
                    Some((step, kinds)) => {
                        let calls: Vec<ToolCall> = kinds
                            .iter()
                            .enumerate()
                            .map(|(i, kind)| {
                                let call = build_call(format!("call_{step}_{i}"), kind);
                                kinds_by_id.insert(call.id.clone(), kind.clone());
                                call
                            })
                            .collect();
                        events.push_back(response_event(&calls));
                    }
                    None => events.push_back(response_event(&[])),
                },
                Effect::ExecuteTool { tool } => {
                    let kind = &kinds_by_id[&tool.id];
                    let result = simulate_tool(&tool, kind);
                    merge_sources(&mut produced_since_agent, &result.sources);
                    executed.push(tool.clone());
                    events.push_back(Event::ToolComplete {
                        tool_use_id: tool.id,
                        result,
                    });
                }
                Effect::CompleteTurn { kind } => completed = Some(kind),
                Effect::ScheduleRetry { .. } | Effect::FailTurn { .. } => {
                    panic!("unexpected effect in a failure-free turn")
                }
            }
        }
    }

    TurnTrace {
        transcript,
        agent_sources,
        executed,
        completed,
        final_state: state,
    }
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_call_kind() -> impl Strategy<Value = CallKind> {
    prop_oneof![
        4 => proptest::collection::vec("doc-[a-c]", 0..3)
            .prop_map(|docs| CallKind::Retrieve { docs }),
        3 => Just(CallKind::WebSearch),
        1 => Just(CallKind::AskUser),
        1 => Just(CallKind::MalformedAsk),
        1 => Just(CallKind::Unknown),
    ]
}

fn arb_script() -> impl Strategy<Value = Vec<Vec<CallKind>>> {
    proptest::collection::vec(proptest::collection::vec(arb_call_kind(), 1..4), 0..5)
}

fn arb_error_kind() -> impl Strategy<Value = ErrorKind> {
    prop_oneof![
        Just(ErrorKind::Network),
        Just(ErrorKind::RateLimit),
        Just(ErrorKind::ServerError),
        Just(ErrorKind::Auth),
        Just(ErrorKind::InvalidRequest),
        Just(ErrorKind::Unknown),
    ]
}

fn arb_sources() -> impl Strategy<Value = Vec<SourceMetadata>> {
    proptest::collection::vec("doc-[a-e]", 0..4).prop_map(|ids| {
        let mut out = Vec::new();
        merge_sources(&mut out, &ids.iter().map(SourceMetadata::new).collect::<Vec<_>>());
        out
    })
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Every message a turn emits keeps the transcript well-formed, and the
    /// turn always ends idle with no invocation left unanswered.
    #[test]
    fn prop_turn_keeps_transcript_well_formed(script in arb_script()) {
        let trace = run_turn(&script);
        prop_assert_eq!(trace.final_state, ConvState::Idle);
        prop_assert!(trace.completed.is_some());
        prop_assert!(trace.transcript.unanswered_invocations().is_empty());
    }

    /// Well-formed ask-user invocations are never handed to the executor,
    /// and a turn that sees one ends with that question.
    #[test]
    fn prop_clarification_never_executed(script in arb_script()) {
        let trace = run_turn(&script);
        prop_assert!(!trace.executed.iter().any(|c| matches!(c.input, ToolInput::AskUser(_))));

        let asked = script.iter().any(|step| step.iter().any(|k| matches!(k, CallKind::AskUser)));
        if asked {
            prop_assert_eq!(trace.completed, Some(TurnKind::Clarification));
            let question = trace.transcript.messages().last().and_then(|m| m.content.agent_text());
            prop_assert_eq!(question.as_deref(), Some("Which building?"));
        } else {
            prop_assert_eq!(trace.completed, Some(TurnKind::Answered));
        }
    }

    /// Each agent message carries exactly the sources produced by tools since
    /// the previous agent message; a step not following retrieval carries none.
    #[test]
    fn prop_sources_attach_once(script in arb_script()) {
        let trace = run_turn(&script);
        for (attached, produced) in &trace.agent_sources {
            prop_assert_eq!(attached, produced);
        }
        let first_agent = &trace.agent_sources[0];
        prop_assert!(first_agent.0.is_empty());
    }

    /// Replaying a completion for an already-resolved invocation changes nothing.
    #[test]
    fn prop_replayed_completion_is_idempotent(
        pending in arb_sources(),
        replay_sources in arb_sources(),
        resolved in proptest::collection::hash_set("r[0-9]{2}", 1..4),
    ) {
        let state = ConvState::ToolDispatch {
            current_tool: build_call("current".to_string(), &CallKind::WebSearch),
            remaining_tools: vec![],
            resolved_tool_ids: resolved.clone(),
            pending_sources: pending,
        };
        for id in &resolved {
            let result = transition(
                &state,
                &test_context(),
                Event::ToolComplete {
                    tool_use_id: id.clone(),
                    result: ToolResult::success(id, "again", replay_sources.clone()),
                },
            ).unwrap();
            prop_assert_eq!(&result.new_state, &state);
            prop_assert!(result.effects.is_empty());
        }
    }

    /// Pending sources never contain the same document twice.
    #[test]
    fn prop_pending_sources_deduplicated(
        pending in arb_sources(),
        incoming in arb_sources(),
    ) {
        let state = ConvState::ToolDispatch {
            current_tool: build_call("t".to_string(), &CallKind::Retrieve { docs: vec![] }),
            remaining_tools: vec![],
            resolved_tool_ids: HashSet::new(),
            pending_sources: pending,
        };
        let result = transition(
            &state,
            &test_context(),
            Event::ToolComplete {
                tool_use_id: "t".to_string(),
                result: ToolResult::success("t", "docs", incoming),
            },
        ).unwrap();
        let ids: Vec<_> = result.new_state.pending_sources().iter().map(|s| &s.document_id).collect();
        let unique: HashSet<_> = ids.iter().collect();
        prop_assert_eq!(ids.len(), unique.len());
    }

    /// Retries stop at the attempt limit and never lose pending sources.
    #[test]
    fn prop_retry_bounded(
        error_kind in arb_error_kind(),
        attempt in 1u32..=MAX_RETRY_ATTEMPTS,
        pending in arb_sources(),
    ) {
        let state = ConvState::AwaitingModel { attempt, pending_sources: pending.clone() };
        let result = transition(
            &state,
            &test_context(),
            Event::LlmError { message: "err".to_string(), error_kind, attempt },
        ).unwrap();

        match result.new_state {
            ConvState::AwaitingModel { attempt: next, pending_sources } => {
                prop_assert!(error_kind.is_retryable());
                prop_assert_eq!(next, attempt + 1);
                prop_assert!(next <= MAX_RETRY_ATTEMPTS);
                prop_assert_eq!(pending_sources, pending);
            }
            ConvState::Error { .. } => {
                prop_assert!(!error_kind.is_retryable() || attempt == MAX_RETRY_ATTEMPTS);
            }
            other => prop_assert!(false, "unexpected state {:?}", other),
        }
    }

    /// Busy states reject new user messages.
    #[test]
    fn prop_busy_rejects_messages(pending in arb_sources(), text in "[a-z ]{1,20}") {
        let busy = ConvState::AwaitingModel { attempt: 1, pending_sources: pending };
        let err = transition(&busy, &test_context(), Event::UserMessage { text }).unwrap_err();
        prop_assert_eq!(err, TransitionError::AgentBusy);
    }
}
