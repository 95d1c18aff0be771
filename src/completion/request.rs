use crate::completion::chat_message::ChatCompletionMessage;
use crate::completion::tool_declaration::ToolDeclaration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatCompletionMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDeclaration>>,
    #[serde(flatten)]
    pub extra_fields: HashMap<String, serde_json::Value>,
}

impl ChatCompletionRequest {
    pub fn streaming(model: impl Into<String>, messages: Vec<ChatCompletionMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: true,
            tools: None,
            extra_fields: HashMap::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDeclaration>) -> Self {
        self.tools = if tools.is_empty() { None } else { Some(tools) };
        self
    }
}
