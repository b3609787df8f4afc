//! Per-flag evaluation counters.
//!
//! Evaluations that do not need a full event are only counted here. One
//! counter exists per distinct (variation, version) pair of a flag, and the
//! whole summary is reset when it is flushed.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use super::types::EvaluationRecord;

/// Counter key within one flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariationKey {
    pub variation: Option<usize>,
    pub version: Option<u64>,
}

/// One counter.
#[derive(Debug, Clone, PartialEq)]
pub struct VariationSummary {
    pub count: u64,
    /// Value served, captured when the counter was created.
    pub value: Value,
}

/// Counters for one flag.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagSummary {
    pub default: Value,
    pub context_kinds: BTreeSet<String>,
    pub counters: BTreeMap<VariationKey, VariationSummary>,
}

/// Accumulated counters for one flush window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventSummary {
    /// Earliest summarized creation date, epoch milliseconds.
    pub start_date: i64,
    /// Latest summarized creation date, epoch milliseconds.
    pub end_date: i64,
    pub features: BTreeMap<String, FlagSummary>,
}

impl EventSummary {
    /// True when there is nothing to report.
    pub fn is_empty(&self) -> bool {
        self.features.values().all(|f| f.counters.is_empty())
    }
}

/// Accumulates an [`EventSummary`].
#[derive(Debug, Default)]
pub struct EventSummarizer {
    summary: EventSummary,
}

impl EventSummarizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summarize(&mut self, event: &EvaluationRecord) {
        let timestamp = event.base.creation_date;
        if self.summary.features.is_empty() {
            self.summary.start_date = timestamp;
            self.summary.end_date = timestamp;
        } else {
            self.summary.start_date = self.summary.start_date.min(timestamp);
            self.summary.end_date = self.summary.end_date.max(timestamp);
        }

        let flag = self
            .summary
            .features
            .entry(event.key.clone())
            .or_insert_with(|| FlagSummary {
                default: event.default.clone(),
                context_kinds: BTreeSet::new(),
                counters: BTreeMap::new(),
            });

        for kind in event.base.context.kinds() {
            if !flag.context_kinds.contains(kind.as_str()) {
                flag.context_kinds.insert(kind.to_string());
            }
        }

        let key = VariationKey {
            variation: event.variation,
            version: event.version,
        };
        flag.counters
            .entry(key)
            .and_modify(|counter| counter.count += 1)
            .or_insert_with(|| VariationSummary {
                count: 1,
                value: event.value.clone(),
            });
    }

    pub fn summary(&self) -> &EventSummary {
        &self.summary
    }

    pub fn is_empty(&self) -> bool {
        self.summary.is_empty()
    }

    pub fn reset(&mut self) {
        self.summary = EventSummary::default();
    }
}
