use crate::completion::{ChatCompletionMessage, ChatCompletionToolCall};
use crate::tools::registry::LocalTool;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

pub const INVALID_JSON: &str = "Tool arguments must be valid JSON.";
pub const NOT_AN_OBJECT: &str = "Tool arguments must be a JSON object.";
pub const EXECUTION_FAILED: &str = "Tool execution failed.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalToolExecutionResult {
    pub tool_call_id: String,
    pub name: String,
    /// Raw arguments string as received from the model.
    pub arguments: String,
    pub status: ToolStatus,
    /// Stringified payload on success, error message otherwise.
    pub result: String,
    pub message: ChatCompletionMessage,
}

fn parse_arguments(raw: &str) -> Result<Map<String, Value>, &'static str> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(NOT_AN_OBJECT),
        Err(_) => Err(INVALID_JSON),
    }
}

fn run_call(call: &ChatCompletionToolCall) -> Result<Value, String> {
    let args = parse_arguments(&call.function.arguments).map_err(str::to_string)?;
    let tool = LocalTool::from_name(&call.function.name)
        .ok_or_else(|| format!("Unknown tool: {}", call.function.name))?;
    tool.run(&args).map_err(|e| {
        warn!("Tool {} ({}) failed: {:#}", call.function.name, call.id, e);
        EXECUTION_FAILED.to_string()
    })
}

pub fn execute_local_tool_call(call: &ChatCompletionToolCall) -> LocalToolExecutionResult {
    let (status, result, envelope) = match run_call(call) {
        Ok(payload) => {
            let result = payload.to_string();
            (ToolStatus::Success, result, json!({"ok": true, "result": payload}))
        }
        Err(error) => {
            let envelope = json!({"ok": false, "error": error});
            (ToolStatus::Error, error, envelope)
        }
    };
    debug!("Tool {} ({}) -> {:?}", call.function.name, call.id, status);

    LocalToolExecutionResult {
        tool_call_id: call.id.clone(),
        name: call.function.name.clone(),
        arguments: call.function.arguments.clone(),
        status,
        result,
        message: ChatCompletionMessage::tool(call.id.clone(), envelope.to_string()),
    }
}

/// Runs every call independently; the output keeps the input order so the
/// follow-up transcript is deterministic.
pub fn execute_local_tool_calls(calls: &[ChatCompletionToolCall]) -> Vec<LocalToolExecutionResult> {
    calls.iter().map(execute_local_tool_call).collect()
}

pub fn to_tool_result_messages(results: &[LocalToolExecutionResult]) -> Vec<ChatCompletionMessage> {
    results.iter().map(|r| r.message.clone()).collect()
}
