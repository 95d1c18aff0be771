use crate::completion::sanitize::strip_box_markers;
use crate::completion::{ChatCompletionMessage, ChatCompletionRequest};
use crate::error::ChatStreamError;
use crate::stream::{StreamCallbacks, StreamingCompletionClient, TurnOutcome};
use crate::tools::{
    LocalToolExecutionResult, execute_local_tool_calls, to_pending_tool_invocations,
    to_tool_result_messages, tool_declarations,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shown in place of a reply when a turn fails.
pub const FALLBACK_REPLY: &str =
    "Sorry, I couldn't get a response from the model. Please try again.";

/// Forwards to the caller's callbacks while remembering what was shown.
struct Tracking<'a, C: ?Sized> {
    inner: &'a mut C,
    last_update: Option<String>,
    completed: Option<String>,
}

impl<C: StreamCallbacks + ?Sized> StreamCallbacks for Tracking<'_, C> {
    fn on_stream_update(&mut self, text: &str) {
        self.last_update = Some(text.to_string());
        self.inner.on_stream_update(text);
    }

    fn on_stream_complete(&mut self, text: &str) {
        self.completed = Some(text.to_string());
        self.inner.on_stream_complete(text);
    }

    fn on_error(&mut self, error: &ChatStreamError) {
        self.inner.on_error(error);
    }

    fn on_settled(&mut self) {
        self.inner.on_settled();
    }
}

/// Result of [`Conversation::submit`].
#[derive(Debug)]
pub struct ConversationReply {
    pub outcome: TurnOutcome,
    /// Assistant text appended to the history by the last round, if any.
    pub text: Option<String>,
    /// Tool executions across all rounds of this turn, in order.
    pub tool_results: Vec<LocalToolExecutionResult>,
}

/// Owns the message list and runs turns one at a time, including tool-call
/// round trips. `&mut self` keeps a second turn from starting while one is
/// in flight.
#[derive(Debug)]
pub struct Conversation {
    client: StreamingCompletionClient,
    model: String,
    messages: Vec<ChatCompletionMessage>,
    tools_enabled: bool,
    max_tool_rounds: u32,
}

impl Conversation {
    pub fn new(client: StreamingCompletionClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            messages: Vec::new(),
            tools_enabled: true,
            max_tool_rounds: 4,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.messages.insert(0, ChatCompletionMessage::system(prompt.into()));
        self
    }

    pub fn with_tools(mut self, enabled: bool, max_rounds: u32) -> Self {
        self.tools_enabled = enabled;
        self.max_tool_rounds = max_rounds;
        self
    }

    pub fn messages(&self) -> &[ChatCompletionMessage] {
        &self.messages
    }

    fn build_request(&self, offer_tools: bool) -> ChatCompletionRequest {
        let request = ChatCompletionRequest::streaming(self.model.clone(), self.messages.clone());
        if offer_tools {
            request.with_tools(tool_declarations())
        } else {
            request
        }
    }

    /// Appends `user_text`, streams the reply, and feeds tool results back to
    /// the model until it answers without tool calls or the round limit is hit.
    ///
    /// `callbacks` sees every model round, so `on_settled` fires once per round.
    pub async fn submit<C>(
        &mut self,
        user_text: &str,
        cancel: &CancellationToken,
        callbacks: &mut C,
    ) -> ConversationReply
    where
        C: StreamCallbacks + ?Sized,
    {
        self.messages.push(ChatCompletionMessage::user(user_text));
        let mut tool_results = Vec::new();
        let mut round = 0;

        loop {
            let offer_tools = self.tools_enabled && round < self.max_tool_rounds;
            let request = self.build_request(offer_tools);
            let mut tracking = Tracking {
                inner: &mut *callbacks,
                last_update: None,
                completed: None,
            };
            let outcome = self.client.send(&request, cancel, &mut tracking).await;

            // An empty completion leaves the last partial update standing.
            let shown = tracking.completed.or_else(|| {
                tracking
                    .last_update
                    .map(|t| strip_box_markers(&t).trim().to_string())
                    .filter(|t| !t.is_empty())
            });

            let response = match outcome {
                TurnOutcome::Completed(response) => response,
                outcome => {
                    match &outcome {
                        TurnOutcome::Errored(e) => warn!("Turn failed: {}", e),
                        _ => info!("Turn aborted"),
                    }
                    return ConversationReply { outcome, text: None, tool_results };
                }
            };

            let calls = response.tool_calls().to_vec();
            if calls.is_empty() || !offer_tools {
                if !calls.is_empty() {
                    warn!("Ignoring {} tool calls past the round limit", calls.len());
                }
                if let Some(text) = &shown {
                    self.messages.push(ChatCompletionMessage::assistant(text.clone()));
                }
                return ConversationReply {
                    outcome: TurnOutcome::Completed(response),
                    text: shown,
                    tool_results,
                };
            }

            info!(round, calls = calls.len(), "Executing local tool calls");
            for pending in to_pending_tool_invocations(&calls) {
                debug!("pending tool call {} {}({})", pending.id, pending.name, pending.arguments);
            }
            self.messages.push(ChatCompletionMessage::assistant_with_tool_calls(
                shown.unwrap_or_default(),
                calls.clone(),
            ));
            let results = execute_local_tool_calls(&calls);
            self.messages.extend(to_tool_result_messages(&results));
            tool_results.extend(results);
            round += 1;
        }
    }
}
