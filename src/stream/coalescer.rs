use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Buffers content deltas and releases them at most once per interval.
///
/// The deadline is armed by the first delta after a flush and stays put while
/// more deltas arrive, so a burst inside one interval produces one update.
#[derive(Debug)]
pub struct UpdateCoalescer {
    interval: Duration,
    buffer: String,
    accumulated: String,
    deadline: Option<Instant>,
}

impl UpdateCoalescer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            buffer: String::new(),
            accumulated: String::new(),
            deadline: None,
        }
    }

    pub fn push(&mut self, delta: &str, now: Instant) {
        if delta.is_empty() {
            return;
        }
        self.buffer.push_str(delta);
        if self.deadline.is_none() {
            self.deadline = Some(now + self.interval);
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Moves buffered text into the accumulator and returns the cumulative
    /// text, or `None` when nothing was buffered since the last flush.
    pub fn flush(&mut self) -> Option<&str> {
        self.deadline = None;
        if self.buffer.is_empty() {
            return None;
        }
        self.accumulated.push_str(&self.buffer);
        self.buffer.clear();
        Some(&self.accumulated)
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.accumulated.clear();
        self.deadline = None;
    }
}
