//! Telemetry collaborator.
//!
//! Nodes and the coordinator report notable events through a [`LogSink`].
//! Writes are fire-and-forget and never influence protocol behavior.

use std::sync::{Arc, Mutex};

/// Destination for telemetry lines.
pub trait LogSink: Send + Sync {
    fn write(&self, message: &str);
}

/// Shared handle to a sink.
pub type SharedSink = Arc<dyn LogSink>;

/// Forwards telemetry to `tracing` under the `geogrid::telemetry` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, message: &str) {
        tracing::info!(target: "geogrid::telemetry", "{}", message);
    }
}

/// Keeps telemetry lines in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Number of lines containing `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.lines().iter().filter(|l| l.contains(needle)).count()
    }
}

impl LogSink for MemorySink {
    fn write(&self, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(message.to_string());
        }
    }
}

/// Default sink.
pub fn tracing_sink() -> SharedSink {
    Arc::new(TracingSink)
}
