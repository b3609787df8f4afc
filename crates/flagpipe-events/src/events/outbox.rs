//! Bounded buffer of pending output events plus the live summary.
//!
//! Owned by the dispatcher task and never shared, so it has no locking.

use tracing::warn;

use super::summary::{EventSummarizer, EventSummary};
use super::types::{EvaluationRecord, OutputEvent};

/// Owned copy of one flush window.
#[derive(Debug, Clone, Default)]
pub struct FlushSnapshot {
    pub events: Vec<OutputEvent>,
    pub summary: EventSummary,
}

impl FlushSnapshot {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.summary.is_empty()
    }

    /// Payload elements: the events plus the summary, if any.
    pub fn len(&self) -> usize {
        self.events.len() + usize::from(!self.summary.is_empty())
    }
}

/// Pending events for the current window.
#[derive(Debug)]
pub struct Outbox {
    capacity: usize,
    events: Vec<OutputEvent>,
    summarizer: EventSummarizer,
    dropped: u64,
    was_full: bool,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: Vec::with_capacity(capacity.min(1024)),
            summarizer: EventSummarizer::new(),
            dropped: 0,
            was_full: false,
        }
    }

    /// Append an event. Returns false (and counts a drop) when full.
    pub fn add_event(&mut self, event: OutputEvent) -> bool {
        if self.events.len() >= self.capacity {
            if !self.was_full {
                self.was_full = true;
                warn!(
                    capacity = self.capacity,
                    "Event buffer full, dropping events until the next flush"
                );
            }
            self.dropped += 1;
            return false;
        }
        self.was_full = false;
        self.events.push(event);
        true
    }

    pub fn add_to_summary(&mut self, event: &EvaluationRecord) {
        self.summarizer.summarize(event);
    }

    /// Copy of the current window. Does not clear anything.
    pub fn snapshot(&self) -> FlushSnapshot {
        FlushSnapshot {
            events: self.events.clone(),
            summary: self.summarizer.summary().clone(),
        }
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.summarizer.reset();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.summarizer.is_empty()
    }

    /// Events rejected because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::{BaseEvent, IndexRecord};
    use flagpipe_common::ContextBuilder;

    fn index_event(key: &str) -> OutputEvent {
        OutputEvent::Index(IndexRecord {
            base: BaseEvent::new(ContextBuilder::new(key).build().unwrap()),
        })
    }

    #[test]
    fn test_capacity_drops_excess() {
        let mut outbox = Outbox::new(3);
        for i in 0..5 {
            outbox.add_event(index_event(&format!("u{i}")));
        }
        assert_eq!(outbox.len(), 3);
        assert_eq!(outbox.dropped(), 2);
    }

    #[test]
    fn test_room_after_clear() {
        let mut outbox = Outbox::new(1);
        assert!(outbox.add_event(index_event("a")));
        assert!(!outbox.add_event(index_event("b")));

        outbox.clear();
        assert!(outbox.add_event(index_event("c")));
        assert_eq!(outbox.dropped(), 1);
    }

    #[test]
    fn test_snapshot_is_independent() {
        let mut outbox = Outbox::new(10);
        outbox.add_event(index_event("a"));

        let snapshot = outbox.snapshot();
        outbox.clear();
        outbox.add_event(index_event("b"));
        outbox.add_event(index_event("c"));

        assert_eq!(snapshot.events.len(), 1);
        assert_eq!(outbox.len(), 2);
    }

    #[test]
    fn test_empty() {
        let outbox = Outbox::new(10);
        assert!(outbox.is_empty());
        assert!(outbox.snapshot().is_empty());
    }
}
