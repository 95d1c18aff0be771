use crate::completion::chat_message::Role;
use crate::completion::tool_call::ChatCompletionToolCall;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ChatCompletionToolCall>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseChoice {
    pub index: u32,
    pub message: ResponseMessage,
    pub finish_reason: Option<String>,
}

/// Terminal state of a stream, derived once by folding its chunks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub choices: Vec<ResponseChoice>,
}

impl ChatCompletionResponse {
    /// The choice the conversation continues with: index 0, else the first one.
    pub fn primary_choice(&self) -> Option<&ResponseChoice> {
        self.choices
            .iter()
            .find(|c| c.index == 0)
            .or_else(|| self.choices.first())
    }

    pub fn assistant_text(&self) -> String {
        self.primary_choice()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default()
    }

    pub fn tool_calls(&self) -> &[ChatCompletionToolCall] {
        self.primary_choice()
            .and_then(|c| c.message.tool_calls.as_deref())
            .unwrap_or(&[])
    }
}
