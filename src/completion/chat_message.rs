use crate::completion::message_content::MessageContent;
use crate::completion::tool_call::ChatCompletionToolCall;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn parse(role: &str) -> Option<Role> {
        match role {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionMessage {
    pub role: Role,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ChatCompletionToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatCompletionMessage {
    fn with_role(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// Assistant turn that requested tool calls; echoed back so the follow-up
    /// turn can join tool results to their calls.
    pub fn assistant_with_tool_calls(
        content: impl Into<MessageContent>,
        tool_calls: Vec<ChatCompletionToolCall>,
    ) -> Self {
        Self {
            tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
            ..Self::with_role(Role::Assistant, content)
        }
    }

    /// A tool result always references the id of the call it answers.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<MessageContent>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::with_role(Role::Tool, content)
        }
    }
}
