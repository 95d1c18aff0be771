pub mod clock;
pub mod echo;
pub mod executor;
pub mod invocation;
pub mod registry;

pub use executor::{LocalToolExecutionResult, execute_local_tool_calls, to_tool_result_messages};
pub use invocation::{to_completed_tool_invocations, to_pending_tool_invocations};
pub use registry::tool_declarations;
