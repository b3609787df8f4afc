//! Evaluation results as seen by the event pipeline.
//!
//! The rule engine produces these; the pipeline only reads them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn is_false(value: &bool) -> bool {
    !*value
}

/// Category of an evaluation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ClientNotReady,
    FlagNotFound,
    MalformedFlag,
    UserNotSpecified,
    WrongType,
    Exception,
}

/// Why an evaluation produced its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    Off,
    #[serde(rename_all = "camelCase")]
    Fallthrough {
        #[serde(default, skip_serializing_if = "is_false")]
        in_experiment: bool,
    },
    TargetMatch,
    #[serde(rename_all = "camelCase")]
    RuleMatch {
        rule_index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule_id: Option<String>,
        #[serde(default, skip_serializing_if = "is_false")]
        in_experiment: bool,
    },
    #[serde(rename_all = "camelCase")]
    PrerequisiteFailed { prerequisite_key: String },
    #[serde(rename_all = "camelCase")]
    Error { error_kind: ErrorKind },
}

impl Reason {
    /// True when the evaluation is part of an experiment, which always
    /// requires a full evaluation event.
    pub fn is_in_experiment(&self) -> bool {
        match self {
            Reason::Fallthrough { in_experiment } => *in_experiment,
            Reason::RuleMatch { in_experiment, .. } => *in_experiment,
            _ => false,
        }
    }

    pub fn is_fallthrough(&self) -> bool {
        matches!(self, Reason::Fallthrough { .. })
    }
}

/// Flag properties that drive event generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlagEventInfo {
    pub key: String,
    pub version: Option<u64>,
    /// Emit a full evaluation event for every evaluation.
    pub track_events: bool,
    /// Emit a full evaluation event when the reason is a fallthrough.
    pub track_events_fallthrough: bool,
    /// Epoch milliseconds until which debug events are emitted.
    pub debug_events_until_date: Option<i64>,
    pub exclude_from_summaries: bool,
    pub sampling_ratio: Option<u32>,
    pub migration_check_ratio: Option<u32>,
}

impl FlagEventInfo {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }
}

/// Result of evaluating one flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationDetail {
    /// `None` when evaluation failed and the caller's default applies.
    pub value: Option<Value>,
    pub variation_index: Option<usize>,
    pub reason: Reason,
}

impl EvaluationDetail {
    pub fn new(value: Value, variation_index: Option<usize>, reason: Reason) -> Self {
        Self {
            value: Some(value),
            variation_index,
            reason,
        }
    }

    /// An error result; the default value will be reported.
    pub fn error(kind: ErrorKind) -> Self {
        Self {
            value: None,
            variation_index: None,
            reason: Reason::Error { error_kind: kind },
        }
    }
}
