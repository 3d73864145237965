//! Turns an ask-user invocation into an assistant-authored question

use super::state::ToolCall;
use super::Effect;
use crate::llm::ContentBlock;

/// Recorded as the result of the ask-user invocation itself
pub const CLARIFICATION_ACK: &str = "Question forwarded to the user. Their reply follows as the next user message.";

/// Recorded for invocations dropped because the turn ended with a question
pub const SKIPPED_RESULT: &str = "Not executed: the turn ended with a clarifying question.";

/// Messages that end a turn with a question to the user.
///
/// The ask-user invocation and every skipped sibling get a tool result so
/// the next model request is well-formed; the question itself becomes a
/// plain assistant message with no invocations.
pub(crate) fn clarify(question: &str, invocation_id: &str, skipped: &[ToolCall]) -> Vec<Effect> {
    let mut effects = Vec::with_capacity(skipped.len() + 2);
    effects.push(Effect::tool_message(invocation_id, CLARIFICATION_ACK, false));
    for call in skipped {
        effects.push(Effect::tool_message(&call.id, SKIPPED_RESULT, true));
    }
    effects.push(Effect::agent_message(
        vec![ContentBlock::text(question)],
        vec![],
        None,
    ));
    effects
}
