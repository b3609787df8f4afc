//! Wire rendering of a flush snapshot.
//!
//! The payload is a JSON array: one element per buffered event, followed by a
//! `summary` element when any counters were recorded. Raw events are copied
//! into the array byte for byte.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::warn;

use flagpipe_common::{ContextError, Reason, Reference};

use super::context_format::ContextFormatter;
use super::outbox::FlushSnapshot;
use super::summary::EventSummary;
use super::types::{
    CustomRecord, EvaluationRecord, IdentifyRecord, IndexRecord, MigrationMeasurements,
    MigrationOpRecord, Operation, OutputEvent, Stage,
};

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("malformed context: {0}")]
    Context(#[from] ContextError),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// A rendered payload ready for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct FormattedPayload {
    pub body: Vec<u8>,
    /// Elements written, including the summary.
    pub event_count: usize,
    /// Events omitted because their context was malformed.
    pub skipped: usize,
}

/// Renders snapshots into the wire JSON array.
#[derive(Debug, Clone)]
pub struct OutputFormatter {
    contexts: ContextFormatter,
}

/// A sampling ratio of 1 is the default and is left off the wire.
fn reported_ratio(ratio: Option<u32>) -> Option<u32> {
    ratio.filter(|&r| r != 1)
}

// ============================================================================
// Wire shapes
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EvaluationOut<'a> {
    kind: &'static str,
    creation_date: i64,
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
    context: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    variation: Option<usize>,
    value: &'a Value,
    default: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    prereq_of: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a Reason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sampling_ratio: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ContextEventOut {
    kind: &'static str,
    creation_date: i64,
    context: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    sampling_ratio: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CustomOut<'a> {
    kind: &'static str,
    creation_date: i64,
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a Value>,
    context_keys: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metric_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sampling_ratio: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MigrationEvaluationOut<'a> {
    key: &'a str,
    value: &'a Value,
    reason: &'a Reason,
    default: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    variation: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MigrationOpOut<'a> {
    kind: &'static str,
    creation_date: i64,
    operation: Operation,
    #[serde(skip_serializing_if = "Option::is_none")]
    sampling_ratio: Option<u32>,
    context_keys: BTreeMap<String, String>,
    evaluation: MigrationEvaluationOut<'a>,
    measurements: Vec<Value>,
}

// ============================================================================
// Formatter
// ============================================================================

impl OutputFormatter {
    pub fn new(all_attributes_private: bool, private_attributes: &[Reference]) -> Self {
        Self {
            contexts: ContextFormatter::new(all_attributes_private, private_attributes),
        }
    }

    pub fn format(&self, snapshot: &FlushSnapshot) -> Result<FormattedPayload, FormatError> {
        let mut body = Vec::with_capacity(snapshot.events.len() * 256 + 2);
        let mut event_count = 0;
        let mut skipped = 0;

        body.push(b'[');
        for event in &snapshot.events {
            if let OutputEvent::Raw(raw) = event {
                if event_count > 0 {
                    body.push(b',');
                }
                body.extend_from_slice(raw.get().as_bytes());
                event_count += 1;
                continue;
            }

            match self.render_event(event) {
                Ok(value) => {
                    if event_count > 0 {
                        body.push(b',');
                    }
                    serde_json::to_writer(&mut body, &value)?;
                    event_count += 1;
                }
                Err(FormatError::Context(e)) => {
                    warn!(error = %e, "Omitting event with malformed context");
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if !snapshot.summary.is_empty() {
            if event_count > 0 {
                body.push(b',');
            }
            serde_json::to_writer(&mut body, &render_summary(&snapshot.summary))?;
            event_count += 1;
        }
        body.push(b']');

        Ok(FormattedPayload {
            body,
            event_count,
            skipped,
        })
    }

    fn render_event(&self, event: &OutputEvent) -> Result<Value, FormatError> {
        let value = match event {
            OutputEvent::Feature(e) => self.render_evaluation(e, "feature", true)?,
            OutputEvent::Debug(e) => self.render_evaluation(e, "debug", false)?,
            OutputEvent::Identify(e) => self.render_identify(e)?,
            OutputEvent::Custom(e) => render_custom(e)?,
            OutputEvent::MigrationOp(e) => render_migration_op(e)?,
            OutputEvent::Index(e) => self.render_index(e)?,
            OutputEvent::Raw(raw) => serde_json::from_str(raw.get())?,
        };
        Ok(value)
    }

    fn render_evaluation(
        &self,
        event: &EvaluationRecord,
        kind: &'static str,
        redact_anonymous: bool,
    ) -> Result<Value, FormatError> {
        let context = self.contexts.render(&event.base.context, redact_anonymous)?;
        Ok(serde_json::to_value(EvaluationOut {
            kind,
            creation_date: event.base.creation_date,
            key: &event.key,
            version: event.version,
            context,
            variation: event.variation,
            value: &event.value,
            default: &event.default,
            prereq_of: event.prereq_of.as_deref(),
            reason: event.reason.as_ref(),
            sampling_ratio: reported_ratio(event.sampling_ratio),
        })?)
    }

    fn render_identify(&self, event: &IdentifyRecord) -> Result<Value, FormatError> {
        let context = self.contexts.render(&event.base.context, false)?;
        Ok(serde_json::to_value(ContextEventOut {
            kind: "identify",
            creation_date: event.base.creation_date,
            context,
            sampling_ratio: reported_ratio(event.sampling_ratio),
        })?)
    }

    fn render_index(&self, event: &IndexRecord) -> Result<Value, FormatError> {
        let context = self.contexts.render(&event.base.context, false)?;
        Ok(serde_json::to_value(ContextEventOut {
            kind: "index",
            creation_date: event.base.creation_date,
            context,
            sampling_ratio: None,
        })?)
    }
}

fn render_custom(event: &CustomRecord) -> Result<Value, FormatError> {
    event.base.context.validate()?;
    Ok(serde_json::to_value(CustomOut {
        kind: "custom",
        creation_date: event.base.creation_date,
        key: &event.key,
        data: event.data.as_ref(),
        context_keys: event.base.context.context_keys(),
        metric_value: event.metric_value,
        sampling_ratio: reported_ratio(event.sampling_ratio),
    })?)
}

fn render_migration_op(event: &MigrationOpRecord) -> Result<Value, FormatError> {
    event.base.context.validate()?;
    Ok(serde_json::to_value(MigrationOpOut {
        kind: "migration_op",
        creation_date: event.base.creation_date,
        operation: event.operation,
        sampling_ratio: reported_ratio(event.sampling_ratio),
        context_keys: event.base.context.context_keys(),
        evaluation: MigrationEvaluationOut {
            key: &event.key,
            value: &event.value,
            reason: &event.reason,
            default: event.default_stage,
            variation: event.variation,
            version: event.version,
        },
        measurements: render_measurements(&event.measurements),
    })?)
}

fn render_measurements(measurements: &MigrationMeasurements) -> Vec<Value> {
    let mut out = Vec::with_capacity(4);

    let invoked: Map<String, Value> = measurements
        .invoked
        .iter()
        .map(|origin| (origin.to_string(), Value::Bool(true)))
        .collect();
    out.push(json!({"key": "invoked", "values": invoked}));

    if let Some(check) = measurements.consistency_check {
        let mut consistent = json!({"key": "consistent", "value": check.consistent});
        if let Some(ratio) = reported_ratio(Some(check.sampling_ratio)) {
            consistent["samplingRatio"] = Value::from(ratio);
        }
        out.push(consistent);
    }

    if !measurements.latency_ms.is_empty() {
        let latency: Map<String, Value> = measurements
            .latency_ms
            .iter()
            .map(|(origin, ms)| (origin.to_string(), Value::from(*ms)))
            .collect();
        out.push(json!({"key": "latency_ms", "values": latency}));
    }

    if !measurements.errors.is_empty() {
        let errors: Map<String, Value> = measurements
            .errors
            .iter()
            .map(|origin| (origin.to_string(), Value::Bool(true)))
            .collect();
        out.push(json!({"key": "error", "values": errors}));
    }

    out
}

fn render_summary(summary: &EventSummary) -> Value {
    let mut features = Map::new();
    for (key, flag) in &summary.features {
        let counters: Vec<Value> = flag
            .counters
            .iter()
            .map(|(variation_key, counter)| {
                let mut out = Map::new();
                if let Some(variation) = variation_key.variation {
                    out.insert("variation".to_string(), Value::from(variation));
                }
                match variation_key.version {
                    Some(version) => out.insert("version".to_string(), Value::from(version)),
                    None => out.insert("unknown".to_string(), Value::Bool(true)),
                };
                out.insert("value".to_string(), counter.value.clone());
                out.insert("count".to_string(), Value::from(counter.count));
                Value::Object(out)
            })
            .collect();

        features.insert(
            key.clone(),
            json!({
                "default": flag.default,
                "counters": counters,
                "contextKinds": flag.context_kinds,
            }),
        );
    }

    json!({
        "kind": "summary",
        "startDate": summary.start_date,
        "endDate": summary.end_date,
        "features": features,
    })
}
