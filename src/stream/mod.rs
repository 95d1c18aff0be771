pub mod callbacks;
pub mod client;
pub mod coalescer;

pub use callbacks::StreamCallbacks;
pub use client::{StreamingCompletionClient, TurnOutcome};
