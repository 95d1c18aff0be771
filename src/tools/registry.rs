use crate::completion::ToolDeclaration;
use crate::tools::{clock, echo};
use serde_json::{Map, Value};

/// Closed set of tools this client can run locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalTool {
    CurrentTime,
    Echo,
}

impl LocalTool {
    pub const ALL: [LocalTool; 2] = [LocalTool::CurrentTime, LocalTool::Echo];

    pub fn from_name(name: &str) -> Option<LocalTool> {
        Self::ALL.into_iter().find(|tool| tool.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            LocalTool::CurrentTime => clock::NAME,
            LocalTool::Echo => echo::NAME,
        }
    }

    pub fn declaration(self) -> ToolDeclaration {
        match self {
            LocalTool::CurrentTime => ToolDeclaration::function(
                clock::NAME,
                "Get the current date and time at a UTC offset.",
                clock::parameters(),
            ),
            LocalTool::Echo => ToolDeclaration::function(
                echo::NAME,
                "Return the given text unchanged.",
                echo::parameters(),
            ),
        }
    }

    pub fn run(self, args: &Map<String, Value>) -> anyhow::Result<Value> {
        match self {
            LocalTool::CurrentTime => clock::run(args),
            LocalTool::Echo => echo::run(args),
        }
    }
}

/// Declarations sent with the request when tool use is enabled.
pub fn tool_declarations() -> Vec<ToolDeclaration> {
    LocalTool::ALL.into_iter().map(LocalTool::declaration).collect()
}
