use crate::completion::ChatCompletionToolCall;
use crate::tools::executor::{LocalToolExecutionResult, ToolStatus};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Pending,
    Success,
    Error,
}

/// Display-facing record of a tool call; not consumed by the executor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: String,
    pub status: InvocationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

pub fn to_pending_tool_invocations(calls: &[ChatCompletionToolCall]) -> Vec<ToolInvocation> {
    calls
        .iter()
        .map(|call| ToolInvocation {
            id: call.id.clone(),
            name: call.function.name.clone(),
            arguments: call.function.arguments.clone(),
            status: InvocationStatus::Pending,
            result: None,
        })
        .collect()
}

pub fn to_completed_tool_invocations(results: &[LocalToolExecutionResult]) -> Vec<ToolInvocation> {
    results
        .iter()
        .map(|r| ToolInvocation {
            id: r.tool_call_id.clone(),
            name: r.name.clone(),
            arguments: r.arguments.clone(),
            status: match r.status {
                ToolStatus::Success => InvocationStatus::Success,
                ToolStatus::Error => InvocationStatus::Error,
            },
            result: Some(r.result.clone()),
        })
        .collect()
}
