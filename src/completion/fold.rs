use crate::completion::chat_message::Role;
use crate::completion::response::{ChatCompletionResponse, ResponseChoice, ResponseMessage};
use crate::completion::stream_chunk::{StreamChunk, StreamToolCall};
use crate::completion::tool_call::ChatCompletionToolCall;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Default)]
struct ToolCallState {
    id: Option<String>,
    r#type: Option<String>,
    name: Option<String>,
    arguments: String,
}

#[derive(Debug, Default)]
struct ChoiceState {
    role: Option<Role>,
    content: Option<String>,
    finish_reason: Option<String>,
    // (tool call index, state) in first-seen order
    tool_calls: Vec<(u32, ToolCallState)>,
}

impl ChoiceState {
    fn apply_tool_call(&mut self, fragment: &StreamToolCall) {
        let pos = match self.tool_calls.iter().position(|(i, _)| *i == fragment.index) {
            Some(pos) => pos,
            None => {
                self.tool_calls.push((fragment.index, ToolCallState::default()));
                self.tool_calls.len() - 1
            }
        };
        let state = &mut self.tool_calls[pos].1;

        if let Some(id) = fragment.id.as_deref().filter(|s| !s.is_empty()) {
            state.id.get_or_insert_with(|| id.to_string());
        }
        if let Some(kind) = fragment.r#type.as_deref().filter(|s| !s.is_empty()) {
            state.r#type.get_or_insert_with(|| kind.to_string());
        }
        if let Some(function) = &fragment.function {
            if let Some(name) = function.name.as_deref().filter(|s| !s.is_empty()) {
                state.name.get_or_insert_with(|| name.to_string());
            }
            if let Some(arguments) = &function.arguments {
                state.arguments.push_str(arguments);
            }
        }
    }

    fn into_choice(self, index: u32) -> ResponseChoice {
        let tool_calls: Vec<ChatCompletionToolCall> = self
            .tool_calls
            .into_iter()
            .filter_map(|(tc_index, state)| match (state.id, state.name) {
                (Some(id), Some(name)) => {
                    let mut call = ChatCompletionToolCall::new(id, name, state.arguments);
                    if let Some(kind) = state.r#type {
                        call.r#type = kind;
                    }
                    Some(call)
                }
                _ => {
                    debug!("Dropping incomplete tool call fragment at index {}", tc_index);
                    None
                }
            })
            .collect();

        ResponseChoice {
            index,
            message: ResponseMessage {
                role: self.role.unwrap_or(Role::Assistant),
                content: self.content,
                tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
            },
            finish_reason: self.finish_reason,
        }
    }
}

/// Folds the chunks of one streamed response into its final [`ChatCompletionResponse`].
///
/// Content deltas are concatenated per choice index in arrival order, so the
/// result does not depend on where the server split the text. The last
/// non-null `finish_reason` of each choice wins.
#[derive(Debug, Default)]
pub struct StreamFold {
    id: Option<String>,
    choices: BTreeMap<u32, ChoiceState>,
}

impl StreamFold {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &StreamChunk) {
        if self.id.is_none() {
            if let Some(id) = chunk.id.as_deref().filter(|s| !s.is_empty()) {
                self.id = Some(id.to_string());
            }
        }

        for choice in &chunk.choices {
            let state = self.choices.entry(choice.index).or_default();
            let delta = &choice.delta;

            if let Some(role) = delta.role.as_deref().and_then(Role::parse) {
                state.role = Some(role);
            }
            if let Some(text) = delta.text() {
                state.content.get_or_insert_with(String::new).push_str(&text);
            }
            if let Some(fragments) = &delta.tool_calls {
                for fragment in fragments {
                    state.apply_tool_call(fragment);
                }
            }
            if let Some(reason) = &choice.finish_reason {
                state.finish_reason = Some(reason.clone());
            }
        }
    }

    pub fn finish(self) -> ChatCompletionResponse {
        ChatCompletionResponse {
            id: self.id,
            choices: self
                .choices
                .into_iter()
                .map(|(index, state)| state.into_choice(index))
                .collect(),
        }
    }
}
