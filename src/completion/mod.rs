pub mod chat_message;
pub mod fold;
pub mod message_content;
pub mod request;
pub mod response;
pub mod sanitize;
pub mod stream_chunk;
pub mod tool_call;
pub mod tool_declaration;

pub use chat_message::ChatCompletionMessage;
pub use fold::StreamFold;
pub use request::ChatCompletionRequest;
pub use response::ChatCompletionResponse;
pub use stream_chunk::StreamChunk;
pub use tool_call::ChatCompletionToolCall;
pub use tool_declaration::ToolDeclaration;
