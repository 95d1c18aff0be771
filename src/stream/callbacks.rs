use crate::error::ChatStreamError;

/// Lifecycle notifications of one `send` call.
///
/// `on_settled` is always the last call and happens exactly once, whether the
/// turn completed, failed or was aborted.
pub trait StreamCallbacks {
    /// Cumulative assistant text so far; called at most once per flush interval.
    fn on_stream_update(&mut self, text: &str);

    /// Final sanitized text. Not called when the final text is empty, in which
    /// case the last update stands.
    fn on_stream_complete(&mut self, text: &str);

    /// Not called for aborted turns.
    fn on_error(&mut self, error: &ChatStreamError);

    fn on_settled(&mut self);
}
