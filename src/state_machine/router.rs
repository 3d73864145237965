//! Routing decision after each model response

use super::state::{ToolCall, ToolInput};

/// Where the turn goes after the model has answered
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// No invocations: the response is the final answer
    Done,
    /// Execute these invocations serially, in emitted order
    ToolDispatch(Vec<ToolCall>),
    /// The model wants to ask the user something
    NeedsClarification {
        question: String,
        invocation_id: String,
        /// Other invocations from the same response, answered as skipped
        skipped: Vec<ToolCall>,
    },
}

/// Pick the next step from the invocations of the latest model message.
///
/// The first well-formed ask-user invocation wins over everything else.
/// Malformed and unknown invocations are dispatched like ordinary tools so
/// they resolve to a failure result the model can see.
pub fn route(tool_calls: &[ToolCall]) -> Route {
    if tool_calls.is_empty() {
        return Route::Done;
    }

    let ask = tool_calls.iter().find_map(|call| match &call.input {
        ToolInput::AskUser(input) => Some((call.id.clone(), input.question.clone())),
        _ => None,
    });

    match ask {
        Some((invocation_id, question)) => Route::NeedsClarification {
            skipped: tool_calls
                .iter()
                .filter(|c| c.id != invocation_id)
                .cloned()
                .collect(),
            question,
            invocation_id,
        },
        None => Route::ToolDispatch(tool_calls.to_vec()),
    }
}
