use crate::completion::sanitize::strip_box_markers;
use crate::completion::{ChatCompletionRequest, ChatCompletionResponse, StreamChunk, StreamFold};
use crate::error::ChatStreamError;
use crate::llm_client::LlmClient;
use crate::request_id::RequestId;
use crate::stream::callbacks::StreamCallbacks;
use crate::stream::coalescer::{DEFAULT_FLUSH_INTERVAL, UpdateCoalescer};
use eventsource_stream::{EventStreamError, Eventsource};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// How a `send` call ended. `on_settled` has already fired by the time this is returned.
#[derive(Debug)]
pub enum TurnOutcome {
    Completed(ChatCompletionResponse),
    Errored(ChatStreamError),
    Aborted,
}

impl TurnOutcome {
    pub fn response(&self) -> Option<&ChatCompletionResponse> {
        match self {
            TurnOutcome::Completed(resp) => Some(resp),
            _ => None,
        }
    }
}

enum Payload {
    Chunk,
    Done,
}

/// Streams one chat completion turn at a time.
///
/// The client does not guard against overlapping turns; callers serialize
/// `send` calls (see [`crate::conversation::Conversation`]).
#[derive(Debug, Clone)]
pub struct StreamingCompletionClient {
    llm_client: LlmClient,
    flush_interval: Duration,
}

impl StreamingCompletionClient {
    pub fn new(llm_client: LlmClient) -> Self {
        Self {
            llm_client,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Runs one turn: opens the stream, reports coalesced updates, and always
    /// ends with exactly one `on_settled`.
    pub async fn send<C>(
        &self,
        body: &ChatCompletionRequest,
        cancel: &CancellationToken,
        callbacks: &mut C,
    ) -> TurnOutcome
    where
        C: StreamCallbacks + ?Sized,
    {
        let request_id = RequestId::generate();
        let span = info_span!("chat_turn", trace_id = %request_id, model = %body.model);

        async {
            let mut body = body.clone();
            body.stream = true;

            let response = match self.open(&body, &request_id, cancel).await {
                Ok(Some(response)) => response,
                Ok(None) => return settle(TurnOutcome::Aborted, callbacks),
                Err(e) => return settle(TurnOutcome::Errored(e), callbacks),
            };

            // The decoder only dispatches an event on a blank line, so a body
            // whose last `data:` line lacks one would lose its final chunk.
            let raw = response
                .bytes_stream()
                .chain(futures::stream::once(async { Ok(Bytes::from_static(b"\n\n")) }));
            let payloads = raw.eventsource().map(|event| match event {
                Ok(event) => Ok(event.data),
                Err(EventStreamError::Transport(e)) => Err(ChatStreamError::Transport(e)),
                Err(e) => Err(ChatStreamError::Stream(e.to_string())),
            });
            self.drive(payloads, cancel, callbacks).await
        }
        .instrument(span)
        .await
    }

    /// Awaits response headers; `Ok(None)` means the turn was cancelled first.
    async fn open(
        &self,
        body: &ChatCompletionRequest,
        request_id: &RequestId,
        cancel: &CancellationToken,
    ) -> Result<Option<reqwest::Response>, ChatStreamError> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            result = self.llm_client.open_chat_stream(body, request_id) => result?,
        };

        if !response.status().is_success() {
            let status = response.status();
            let error_text = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                text = response.text() => text.unwrap_or_else(|_| "Unknown error".to_string()),
            };
            warn!("Completion request failed with status {}: {}", status, error_text);
            return Err(ChatStreamError::Status { status, body: error_text });
        }
        Ok(Some(response))
    }

    /// Consumes SSE `data:` payloads and settles the turn. Independent of the
    /// transport so any payload stream can be replayed through it.
    pub async fn drive<S, C>(
        &self,
        payloads: S,
        cancel: &CancellationToken,
        callbacks: &mut C,
    ) -> TurnOutcome
    where
        S: Stream<Item = Result<String, ChatStreamError>>,
        C: StreamCallbacks + ?Sized,
    {
        let outcome = self.consume(payloads, cancel, callbacks).await;
        settle(outcome, callbacks)
    }

    async fn consume<S, C>(
        &self,
        payloads: S,
        cancel: &CancellationToken,
        callbacks: &mut C,
    ) -> TurnOutcome
    where
        S: Stream<Item = Result<String, ChatStreamError>>,
        C: StreamCallbacks + ?Sized,
    {
        let mut payloads = std::pin::pin!(payloads);
        let mut fold = StreamFold::new();
        let mut coalescer = UpdateCoalescer::new(self.flush_interval);

        loop {
            let deadline = coalescer.deadline();
            let flush_timer = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Completion stream aborted");
                    coalescer.clear();
                    return TurnOutcome::Aborted;
                }
                _ = flush_timer => {
                    if let Some(text) = coalescer.flush() {
                        callbacks.on_stream_update(text);
                    }
                }
                next = payloads.next() => match next {
                    Some(Ok(data)) => {
                        if let Payload::Done = apply_payload(&data, &mut fold, &mut coalescer) {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Completion stream failed: {}", e);
                        coalescer.clear();
                        return TurnOutcome::Errored(e);
                    }
                    None => break,
                },
            }
        }

        if let Some(text) = coalescer.flush() {
            callbacks.on_stream_update(text);
        }

        let response = fold.finish();
        let final_text = strip_box_markers(&response.assistant_text()).trim().to_string();
        if final_text.is_empty() {
            debug!("Stream produced no assistant text; keeping last update");
        } else {
            callbacks.on_stream_complete(&final_text);
        }
        info!(
            choices = response.choices.len(),
            tool_calls = response.tool_calls().len(),
            "Completion stream finished"
        );
        TurnOutcome::Completed(response)
    }
}

fn apply_payload(data: &str, fold: &mut StreamFold, coalescer: &mut UpdateCoalescer) -> Payload {
    let data = data.trim();
    if data.is_empty() {
        return Payload::Chunk;
    }
    if data == "[DONE]" {
        return Payload::Done;
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => {
            let now = Instant::now();
            for choice in &chunk.choices {
                if let Some(text) = choice.delta.text() {
                    coalescer.push(&text, now);
                }
            }
            fold.push(&chunk);
        }
        Err(e) => debug!("Skipping unparsable stream chunk: {}, data: {}", e, data),
    }
    Payload::Chunk
}

fn settle<C>(outcome: TurnOutcome, callbacks: &mut C) -> TurnOutcome
where
    C: StreamCallbacks + ?Sized,
{
    if let TurnOutcome::Errored(e) = &outcome {
        callbacks.on_error(e);
    }
    callbacks.on_settled();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::ChatCompletionMessage;
    use crate::config::LlmParams;
    use futures::channel::mpsc;
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl Recorder {
        fn count(&self, prefix: &str) -> usize {
            self.events.iter().filter(|e| e.starts_with(prefix)).count()
        }
    }

    impl StreamCallbacks for Recorder {
        fn on_stream_update(&mut self, text: &str) {
            self.events.push(format!("update:{}", text));
        }
        fn on_stream_complete(&mut self, text: &str) {
            self.events.push(format!("complete:{}", text));
        }
        fn on_error(&mut self, error: &ChatStreamError) {
            self.events.push(format!("error:{}", error));
        }
        fn on_settled(&mut self) {
            self.events.push("settled".to_string());
        }
    }

    fn test_client(api_base: &str) -> StreamingCompletionClient {
        StreamingCompletionClient::new(LlmClient::new(
            Arc::new(reqwest::Client::new()),
            LlmParams {
                api_base: api_base.to_string(),
                api_key: None,
                model: "m".to_string(),
            },
        ))
    }

    fn content_chunk(text: &str) -> String {
        json!({"choices": [{"index": 0, "delta": {"content": text}}]}).to_string()
    }

    fn sse_body(payloads: &[String]) -> String {
        payloads.iter().map(|p| format!("data: {}\n\n", p)).collect()
    }

    fn request() -> ChatCompletionRequest {
        ChatCompletionRequest::streaming("m", vec![ChatCompletionMessage::user("hi")])
    }

    #[tokio::test]
    async fn test_stream_completes_with_folded_text() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(sse_body(&[
                content_chunk("Hel"),
                content_chunk("lo"),
                "[DONE]".to_string(),
            ]))
            .create_async()
            .await;

        let mut rec = Recorder::default();
        let outcome = test_client(&server.url())
            .send(&request(), &CancellationToken::new(), &mut rec)
            .await;

        assert_eq!(outcome.response().unwrap().assistant_text(), "Hello");
        let n = rec.events.len();
        assert_eq!(rec.events[n - 3], "update:Hello");
        assert_eq!(rec.events[n - 2], "complete:Hello");
        assert_eq!(rec.events[n - 1], "settled");
        assert_eq!(rec.count("error"), 0);
    }

    #[tokio::test]
    async fn test_stream_without_done_marker() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(sse_body(&[content_chunk("Hel"), content_chunk("lo")]))
            .create_async()
            .await;

        let mut rec = Recorder::default();
        test_client(&server.url())
            .send(&request(), &CancellationToken::new(), &mut rec)
            .await;
        assert!(rec.events.contains(&"complete:Hello".to_string()));
        assert_eq!(rec.events.last().unwrap(), "settled");
    }

    #[tokio::test]
    async fn test_last_event_without_blank_line_is_kept() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(format!(
                "data: {}\n\ndata: {}\n",
                content_chunk("Hel"),
                content_chunk("lo")
            ))
            .create_async()
            .await;

        let mut rec = Recorder::default();
        let outcome = test_client(&server.url())
            .send(&request(), &CancellationToken::new(), &mut rec)
            .await;
        assert_eq!(outcome.response().unwrap().assistant_text(), "Hello");
        assert!(rec.events.contains(&"complete:Hello".to_string()));
        assert_eq!(rec.events.last().unwrap(), "settled");
    }

    #[tokio::test]
    async fn test_malformed_chunk_is_skipped() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(sse_body(&[
                content_chunk("Hel"),
                "{not json".to_string(),
                content_chunk("lo"),
                "[DONE]".to_string(),
            ]))
            .create_async()
            .await;

        let mut rec = Recorder::default();
        test_client(&server.url())
            .send(&request(), &CancellationToken::new(), &mut rec)
            .await;
        assert!(rec.events.contains(&"complete:Hello".to_string()));
        assert_eq!(rec.count("error"), 0);
    }

    #[tokio::test]
    async fn test_non_success_status_reports_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/chat/completions")
            .with_status(500)
            .with_body("upstream exploded")
            .create_async()
            .await;

        let mut rec = Recorder::default();
        let outcome = test_client(&server.url())
            .send(&request(), &CancellationToken::new(), &mut rec)
            .await;

        match outcome {
            TurnOutcome::Errored(e) => assert_eq!(e.status().map(|s| s.as_u16()), Some(500)),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(rec.events.len(), 2);
        assert!(rec.events[0].starts_with("error:"));
        assert!(rec.events[0].contains("upstream exploded"));
        assert_eq!(rec.events[1], "settled");
    }

    #[tokio::test]
    async fn test_connection_failure_reports_error() {
        // Nothing listens on port 9 locally.
        let mut rec = Recorder::default();
        let outcome = test_client("http://127.0.0.1:9")
            .send(&request(), &CancellationToken::new(), &mut rec)
            .await;
        assert!(matches!(outcome, TurnOutcome::Errored(ChatStreamError::Transport(_))));
        assert_eq!(rec.count("error"), 1);
        assert_eq!(rec.events.last().unwrap(), "settled");
    }

    #[tokio::test]
    async fn test_empty_stream_does_not_complete() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(sse_body(&[
                json!({"choices": [{"index": 0, "delta": {"role": "assistant"}}]}).to_string(),
                content_chunk("   "),
                json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}).to_string(),
                "[DONE]".to_string(),
            ]))
            .create_async()
            .await;

        let mut rec = Recorder::default();
        let outcome = test_client(&server.url())
            .send(&request(), &CancellationToken::new(), &mut rec)
            .await;
        assert!(outcome.response().is_some());
        assert_eq!(rec.count("complete"), 0);
        assert_eq!(rec.count("settled"), 1);
    }

    #[tokio::test]
    async fn test_final_text_is_sanitized() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(sse_body(&[
                content_chunk("  <begin_of_box>42"),
                content_chunk("<end_of_box>\n"),
                "[DONE]".to_string(),
            ]))
            .create_async()
            .await;

        let mut rec = Recorder::default();
        test_client(&server.url())
            .send(&request(), &CancellationToken::new(), &mut rec)
            .await;
        assert!(rec.events.contains(&"complete:42".to_string()));
    }

    #[tokio::test]
    async fn test_tool_calls_are_returned() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(sse_body(&[
                json!({"id": "chatcmpl-1", "choices": [{"index": 0, "delta": {"role": "assistant", "tool_calls": [
                    {"index": 0, "id": "call_1", "type": "function", "function": {"name": "echo", "arguments": ""}}
                ]}}]}).to_string(),
                json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                    {"index": 0, "function": {"arguments": "{\"text\":\"hi\"}"}}
                ]}, "finish_reason": "tool_calls"}]}).to_string(),
                "[DONE]".to_string(),
            ]))
            .create_async()
            .await;

        let mut rec = Recorder::default();
        let outcome = test_client(&server.url())
            .send(&request(), &CancellationToken::new(), &mut rec)
            .await;
        let resp = outcome.response().unwrap();
        assert_eq!(resp.id.as_deref(), Some("chatcmpl-1"));
        assert_eq!(resp.tool_calls()[0].function.arguments, "{\"text\":\"hi\"}");
        assert_eq!(rec.events, vec!["settled".to_string()]);
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut rec = Recorder::default();
        let outcome = test_client("http://127.0.0.1:9").send(&request(), &cancel, &mut rec).await;
        assert!(matches!(outcome, TurnOutcome::Aborted));
        assert_eq!(rec.events, vec!["settled".to_string()]);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_headers() {
        // Accepts the connection but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let mut rec = Recorder::default();
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            test_client(&format!("http://{}", addr)).send(&request(), &cancel, &mut rec),
        )
        .await
        .expect("send did not return after cancellation");

        assert!(matches!(outcome, TurnOutcome::Aborted));
        assert_eq!(rec.events, vec!["settled".to_string()]);
        server.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_coalesced_into_one_update() {
        let client = test_client("http://unused");
        let (tx, rx) = mpsc::unbounded::<Result<String, ChatStreamError>>();
        let cancel = CancellationToken::new();
        let mut rec = Recorder::default();

        let feed = async move {
            for delta in ["a", "b", "c"] {
                tx.unbounded_send(Ok(content_chunk(delta))).unwrap();
            }
            tokio::time::sleep(Duration::from_millis(150)).await;
            drop(tx);
        };
        let (outcome, _) = tokio::join!(client.drive(rx, &cancel, &mut rec), feed);

        assert!(outcome.response().is_some());
        assert_eq!(rec.events, vec!["update:abc", "complete:abc", "settled"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_are_cumulative_across_flushes() {
        let client = test_client("http://unused");
        let (tx, rx) = mpsc::unbounded::<Result<String, ChatStreamError>>();
        let cancel = CancellationToken::new();
        let mut rec = Recorder::default();

        let feed = async move {
            tx.unbounded_send(Ok(content_chunk("ab"))).unwrap();
            tokio::time::sleep(Duration::from_millis(150)).await;
            tx.unbounded_send(Ok(content_chunk("cd"))).unwrap();
            tokio::time::sleep(Duration::from_millis(150)).await;
            tx.unbounded_send(Ok(content_chunk("e"))).unwrap();
            tx.unbounded_send(Ok("[DONE]".to_string())).unwrap();
        };
        tokio::join!(client.drive(rx, &cancel, &mut rec), feed);

        assert_eq!(
            rec.events,
            vec!["update:ab", "update:abcd", "update:abcde", "complete:abcde", "settled"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_mid_stream_is_silent() {
        let client = test_client("http://unused");
        let (tx, rx) = mpsc::unbounded::<Result<String, ChatStreamError>>();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut rec = Recorder::default();

        let feed = async move {
            tx.unbounded_send(Ok(content_chunk("partial"))).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
            tokio::time::sleep(Duration::from_millis(500)).await;
            tx.unbounded_send(Ok(content_chunk(" ignored"))).ok();
        };
        let (outcome, _) = tokio::join!(client.drive(rx, &cancel, &mut rec), feed);

        assert!(matches!(outcome, TurnOutcome::Aborted));
        assert_eq!(rec.events, vec!["settled"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_after_update_keeps_error_silent() {
        let client = test_client("http://unused");
        let (tx, rx) = mpsc::unbounded::<Result<String, ChatStreamError>>();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut rec = Recorder::default();

        let feed = async move {
            tx.unbounded_send(Ok(content_chunk("first"))).unwrap();
            tokio::time::sleep(Duration::from_millis(120)).await;
            tx.unbounded_send(Ok(content_chunk(" second"))).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        };
        tokio::join!(client.drive(rx, &cancel, &mut rec), feed);

        assert_eq!(rec.events, vec!["update:first", "settled"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_body_error_reports_once_then_settles() {
        let client = test_client("http://unused");
        let (tx, rx) = mpsc::unbounded::<Result<String, ChatStreamError>>();
        let cancel = CancellationToken::new();
        let mut rec = Recorder::default();

        tx.unbounded_send(Ok(content_chunk("Hel"))).unwrap();
        tx.unbounded_send(Err(ChatStreamError::Stream("connection reset".to_string())))
            .unwrap();
        drop(tx);
        let outcome = client.drive(rx, &cancel, &mut rec).await;

        assert!(matches!(outcome, TurnOutcome::Errored(ChatStreamError::Stream(_))));
        assert_eq!(
            rec.events,
            vec!["error:stream error: connection reset", "settled"]
        );
    }
}
