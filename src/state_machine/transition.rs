//! Pure state transition function

use super::clarification::clarify;
use super::router::{route, Route};
use super::state::merge_sources;
use super::{ConvContext, ConvState, Effect, Event, TurnKind};
use crate::db::UsageData;
use crate::llm::Usage;
use std::time::Duration;
use thiserror::Error;

pub const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: ConvState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: ConvState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

/// Errors that can occur during transition
#[derive(Debug, Error, PartialEq)]
pub enum TransitionError {
    #[error("Agent is busy, cannot accept message")]
    AgentBusy,
    #[error("Message text is empty")]
    EmptyMessage,
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

/// Pure transition function
///
/// Given the same inputs it always produces the same outputs, with no I/O.
pub fn transition(
    state: &ConvState,
    context: &ConvContext,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    match (state, event) {
        // ============================================================
        // User messages
        // ============================================================
        (ConvState::Idle | ConvState::Error { .. }, Event::UserMessage { text }) => {
            if text.trim().is_empty() {
                return Err(TransitionError::EmptyMessage);
            }
            Ok(TransitionResult::new(ConvState::AwaitingModel {
                attempt: 1,
                pending_sources: vec![],
            })
            .with_effect(Effect::user_message(text))
            .with_effect(Effect::RequestLlm))
        }

        (
            ConvState::AwaitingModel { .. } | ConvState::ToolDispatch { .. },
            Event::UserMessage { .. },
        ) => Err(TransitionError::AgentBusy),

        // ============================================================
        // Model responses
        // ============================================================
        (
            ConvState::AwaitingModel {
                pending_sources, ..
            },
            Event::LlmResponse {
                content,
                tool_calls,
                usage,
            },
        ) => {
            // Sources from the preceding retrieval land on this message and
            // are dropped from the state either way.
            let agent_message = Effect::agent_message(
                content,
                pending_sources.clone(),
                Some(usage_to_data(usage, &context.model_id)),
            );

            match route(&tool_calls) {
                Route::Done => Ok(TransitionResult::new(ConvState::Idle)
                    .with_effect(agent_message)
                    .with_effect(Effect::CompleteTurn {
                        kind: TurnKind::Answered,
                    })),

                Route::NeedsClarification {
                    question,
                    invocation_id,
                    skipped,
                } => Ok(TransitionResult::new(ConvState::Idle)
                    .with_effect(agent_message)
                    .with_effects(clarify(&question, &invocation_id, &skipped))
                    .with_effect(Effect::CompleteTurn {
                        kind: TurnKind::Clarification,
                    })),

                Route::ToolDispatch(calls) => {
                    let mut calls = calls.into_iter();
                    let Some(first) = calls.next() else {
                        return Err(TransitionError::InvalidTransition(
                            "tool dispatch without tools".to_string(),
                        ));
                    };
                    Ok(TransitionResult::new(ConvState::ToolDispatch {
                        current_tool: first.clone(),
                        remaining_tools: calls.collect(),
                        resolved_tool_ids: std::collections::HashSet::new(),
                        pending_sources: vec![],
                    })
                    .with_effect(agent_message)
                    .with_effect(Effect::execute_tool(first)))
                }
            }
        }

        // ============================================================
        // Error handling and retry
        // ============================================================
        (
            ConvState::AwaitingModel {
                attempt,
                pending_sources,
            },
            Event::LlmError { error_kind, .. },
        ) if error_kind.is_retryable() && *attempt < MAX_RETRY_ATTEMPTS => {
            let new_attempt = attempt + 1;
            Ok(TransitionResult::new(ConvState::AwaitingModel {
                attempt: new_attempt,
                pending_sources: pending_sources.clone(),
            })
            .with_effect(Effect::ScheduleRetry {
                delay: retry_delay(new_attempt),
                attempt: new_attempt,
            }))
        }

        (
            ConvState::AwaitingModel { attempt, .. },
            Event::LlmError {
                message,
                error_kind,
                ..
            },
        ) => {
            let message = if error_kind.is_retryable() {
                format!("Failed after {attempt} attempts: {message}")
            } else {
                message
            };
            Ok(TransitionResult::new(ConvState::Error {
                message: message.clone(),
                error_kind,
            })
            .with_effect(Effect::FailTurn {
                message,
                error_kind,
            }))
        }

        (ConvState::AwaitingModel { attempt, .. }, Event::RetryTimeout { attempt: retry })
            if *attempt == retry =>
        {
            Ok(TransitionResult::new(state.clone()).with_effect(Effect::RequestLlm))
        }

        // ============================================================
        // Tool execution
        // ============================================================

        // Replayed completion for an invocation already recorded
        (
            ConvState::ToolDispatch {
                resolved_tool_ids, ..
            },
            Event::ToolComplete { tool_use_id, .. },
        ) if resolved_tool_ids.contains(&tool_use_id) => Ok(TransitionResult::new(state.clone())),

        // Completion arriving after dispatch already finished
        (ConvState::AwaitingModel { .. }, Event::ToolComplete { .. }) => {
            Ok(TransitionResult::new(state.clone()))
        }

        (
            ConvState::ToolDispatch {
                current_tool,
                remaining_tools,
                resolved_tool_ids,
                pending_sources,
            },
            Event::ToolComplete {
                tool_use_id,
                result,
            },
        ) if tool_use_id == current_tool.id => {
            let mut sources = pending_sources.clone();
            merge_sources(&mut sources, &result.sources);

            let tool_message = Effect::tool_message(tool_use_id, result.output, result.is_error);

            match remaining_tools.split_first() {
                Some((next, rest)) => {
                    let mut resolved = resolved_tool_ids.clone();
                    resolved.insert(current_tool.id.clone());
                    Ok(TransitionResult::new(ConvState::ToolDispatch {
                        current_tool: next.clone(),
                        remaining_tools: rest.to_vec(),
                        resolved_tool_ids: resolved,
                        pending_sources: sources,
                    })
                    .with_effect(tool_message)
                    .with_effect(Effect::execute_tool(next.clone())))
                }
                None => Ok(TransitionResult::new(ConvState::AwaitingModel {
                    attempt: 1,
                    pending_sources: sources,
                })
                .with_effect(tool_message)
                .with_effect(Effect::RequestLlm)),
            }
        }

        // ============================================================
        // Everything else
        // ============================================================
        (state, event) => Err(TransitionError::InvalidTransition(format!(
            "No transition from {state:?} with {event:?}"
        ))),
    }
}

fn usage_to_data(usage: Usage, model: &str) -> UsageData {
    UsageData {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        model: model.to_string(),
    }
}

fn retry_delay(attempt: u32) -> Duration {
    // 1s before the second attempt, 2s before the third
    Duration::from_secs(1 << attempt.saturating_sub(2).min(5))
}
