//! Sliding-window load estimate.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Rate of recent events relative to a configured limit.
///
/// Events older than the window are purged lazily, only when the load is
/// read. The load is not capped: a node taking twice its limit reports 2.0.
#[derive(Debug, Clone)]
pub struct LoadTracker {
    events: VecDeque<Instant>,
    limit: u32,
    window: Duration,
}

impl LoadTracker {
    /// `limit` events inside `window` is a load of 1.0. A zero limit counts as one.
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            events: VecDeque::new(),
            limit: limit.max(1),
            window,
        }
    }

    pub fn add_event(&mut self) {
        self.add_event_at(Instant::now());
    }

    /// Record an event at `at`. Events must be recorded in time order.
    pub fn add_event_at(&mut self, at: Instant) {
        self.events.push_back(at);
    }

    pub fn get_load(&mut self) -> f64 {
        self.load_at(Instant::now())
    }

    /// Load as seen at `now`. Events more than one window older than `now` are dropped.
    pub fn load_at(&mut self, now: Instant) -> f64 {
        while let Some(&oldest) = self.events.front() {
            if now.saturating_duration_since(oldest) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
        self.events.len() as f64 / f64::from(self.limit)
    }

    pub fn reset(&mut self) {
        self.events.clear();
    }

    /// Events currently held, including ones not yet purged.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
