//! Ask-user marker tool
//!
//! Offered to the model so it can request clarification. The router turns
//! a well-formed invocation into a question for the user, so `run` is only
//! reached if something upstream misroutes it.

use super::{Tool, ToolContext, ToolOutput};
use crate::state_machine::state::ASK_USER_TOOL;
use async_trait::async_trait;
use serde_json::{json, Value};

pub struct AskUserTool;

#[async_trait]
impl Tool for AskUserTool {
    fn name(&self) -> &'static str {
        ASK_USER_TOOL
    }

    fn description(&self) -> String {
        "Ask the user for clarification or missing details. The question is shown to the user verbatim and the turn ends until they reply.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["question"],
            "properties": {
                "question": {
                    "type": "string",
                    "description": "The question to ask the user"
                }
            }
        })
    }

    async fn run(&self, _input: Value, ctx: ToolContext) -> ToolOutput {
        tracing::warn!(conv_id = %ctx.conversation_id, "user_ask reached the tool executor");
        ToolOutput::error("user_ask is answered by the user and cannot be executed")
    }
}
