//! Event types flowing through the pipeline.
//!
//! `InputEvent` is what producers submit. `OutputEvent` is what the dispatcher
//! keeps in the outbox after applying sampling, tracking and dedup rules; it is
//! a closed set rendered by a single exhaustive match in the output formatter.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json::value::RawValue;

use flagpipe_common::{Context, EvaluationDetail, FlagEventInfo, Reason};

/// Current time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Fields shared by every context-bearing event.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseEvent {
    /// Creation time, epoch milliseconds.
    pub creation_date: i64,
    pub context: Context,
}

impl BaseEvent {
    pub fn new(context: Context) -> Self {
        Self {
            creation_date: now_millis(),
            context,
        }
    }
}

/// A flag evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationRecord {
    pub base: BaseEvent,
    pub key: String,
    pub version: Option<u64>,
    pub variation: Option<usize>,
    pub value: Value,
    pub default: Value,
    pub reason: Option<Reason>,
    /// Key of the flag this one was evaluated as a prerequisite of.
    pub prereq_of: Option<String>,
    /// A full `feature` event is wanted, not just a summary counter.
    pub track_events: bool,
    pub debug_events_until_date: Option<i64>,
    pub exclude_from_summaries: bool,
    pub sampling_ratio: Option<u32>,
}

/// An identify call.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifyRecord {
    pub base: BaseEvent,
    pub sampling_ratio: Option<u32>,
}

/// A custom (track) event.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomRecord {
    pub base: BaseEvent,
    pub key: String,
    pub data: Option<Value>,
    pub metric_value: Option<f64>,
    pub sampling_ratio: Option<u32>,
}

/// A context announcement, emitted the first time a context is seen in a
/// dedup window.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub base: BaseEvent,
}

/// Migration operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Write,
}

/// Which side of a migration an operation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Old,
    New,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Old => "old",
            Origin::New => "new",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Migration stage reported as the evaluation default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Off,
    DualWrite,
    Shadow,
    Live,
    Rampdown,
    Complete,
}

/// Result of comparing old and new reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsistencyCheck {
    pub consistent: bool,
    pub sampling_ratio: u32,
}

/// Measurements recorded while running one migration operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationMeasurements {
    pub invoked: BTreeSet<Origin>,
    pub consistency_check: Option<ConsistencyCheck>,
    /// Latency per origin in milliseconds.
    pub latency_ms: BTreeMap<Origin, f64>,
    pub errors: BTreeSet<Origin>,
}

/// A migration operation.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationOpRecord {
    pub base: BaseEvent,
    pub operation: Operation,
    pub key: String,
    pub version: Option<u64>,
    pub variation: Option<usize>,
    pub value: Value,
    pub default_stage: Stage,
    pub reason: Reason,
    pub sampling_ratio: Option<u32>,
    pub measurements: MigrationMeasurements,
}

/// An event submitted to the pipeline.
#[derive(Debug, Clone)]
pub enum InputEvent {
    Evaluation(EvaluationRecord),
    Identify(IdentifyRecord),
    Custom(CustomRecord),
    MigrationOp(Box<MigrationOpRecord>),
    Index(IndexRecord),
    /// Already-serialized JSON, forwarded without re-serialization.
    Raw(Box<RawValue>),
}

impl InputEvent {
    /// Short name used in logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            InputEvent::Evaluation(_) => "evaluation",
            InputEvent::Identify(_) => "identify",
            InputEvent::Custom(_) => "custom",
            InputEvent::MigrationOp(_) => "migration_op",
            InputEvent::Index(_) => "index",
            InputEvent::Raw(_) => "raw",
        }
    }
}

/// An event waiting in the outbox.
#[derive(Debug, Clone)]
pub enum OutputEvent {
    Feature(EvaluationRecord),
    Debug(EvaluationRecord),
    Identify(IdentifyRecord),
    Custom(CustomRecord),
    MigrationOp(Box<MigrationOpRecord>),
    Index(IndexRecord),
    Raw(Box<RawValue>),
}

/// Builds input events stamped with the current time.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventFactory {
    send_reason: bool,
}

impl EventFactory {
    /// `send_reason` includes the evaluation reason in every evaluation event,
    /// not only the ones that require it.
    pub fn new(send_reason: bool) -> Self {
        Self { send_reason }
    }

    pub fn new_evaluation(
        &self,
        flag: &FlagEventInfo,
        context: Context,
        detail: &EvaluationDetail,
        default: Value,
        prereq_of: Option<String>,
    ) -> InputEvent {
        let experiment = detail.reason.is_in_experiment()
            || (flag.track_events_fallthrough && detail.reason.is_fallthrough());
        let reason = (self.send_reason || experiment).then(|| detail.reason.clone());

        InputEvent::Evaluation(EvaluationRecord {
            base: BaseEvent::new(context),
            key: flag.key.clone(),
            version: flag.version,
            variation: detail.variation_index,
            value: detail.value.clone().unwrap_or_else(|| default.clone()),
            default,
            reason,
            prereq_of,
            track_events: flag.track_events || experiment,
            debug_events_until_date: flag.debug_events_until_date,
            exclude_from_summaries: flag.exclude_from_summaries,
            sampling_ratio: flag.sampling_ratio,
        })
    }

    /// An evaluation of a flag that does not exist. Only counted in the summary.
    pub fn new_unknown_flag(
        &self,
        key: &str,
        context: Context,
        detail: &EvaluationDetail,
        default: Value,
    ) -> InputEvent {
        InputEvent::Evaluation(EvaluationRecord {
            base: BaseEvent::new(context),
            key: key.to_string(),
            version: None,
            variation: None,
            value: default.clone(),
            default,
            reason: self.send_reason.then(|| detail.reason.clone()),
            prereq_of: None,
            track_events: false,
            debug_events_until_date: None,
            exclude_from_summaries: false,
            sampling_ratio: None,
        })
    }

    pub fn new_identify(&self, context: Context) -> InputEvent {
        InputEvent::Identify(IdentifyRecord {
            base: BaseEvent::new(context),
            sampling_ratio: None,
        })
    }

    pub fn new_custom(
        &self,
        context: Context,
        key: impl Into<String>,
        data: Option<Value>,
        metric_value: Option<f64>,
    ) -> InputEvent {
        InputEvent::Custom(CustomRecord {
            base: BaseEvent::new(context),
            key: key.into(),
            data,
            metric_value,
            sampling_ratio: None,
        })
    }

    pub fn new_migration_op(
        &self,
        context: Context,
        flag: &FlagEventInfo,
        operation: Operation,
        detail: &EvaluationDetail,
        default_stage: Stage,
        measurements: MigrationMeasurements,
    ) -> InputEvent {
        InputEvent::MigrationOp(Box::new(MigrationOpRecord {
            base: BaseEvent::new(context),
            operation,
            key: flag.key.clone(),
            version: flag.version,
            variation: detail.variation_index,
            value: detail
                .value
                .clone()
                .unwrap_or_else(|| Value::from(stage_name(default_stage))),
            default_stage,
            reason: detail.reason.clone(),
            sampling_ratio: flag.sampling_ratio,
            measurements,
        }))
    }
}

fn stage_name(stage: Stage) -> &'static str {
    match stage {
        Stage::Off => "off",
        Stage::DualWrite => "dualwrite",
        Stage::Shadow => "shadow",
        Stage::Live => "live",
        Stage::Rampdown => "rampdown",
        Stage::Complete => "complete",
    }
}
