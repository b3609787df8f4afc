//! Recorded events for the `flagpipe` binary.
//!
//! One JSON object per line, tagged by `type`:
//!
//! ```text
//! {"type":"evaluation","context":{"kind":"user","key":"u1"},"flag":{"key":"beta","version":5,"trackEvents":true},"detail":{"value":true,"variationIndex":0,"reason":{"kind":"FALLTHROUGH"}},"default":false}
//! {"type":"identify","context":{"key":"u1"}}
//! {"type":"custom","context":{"key":"u1"},"key":"purchase","metric_value":9.5}
//! {"type":"raw","event":{"kind":"custom","key":"x","creationDate":1}}
//! ```

use std::io::BufRead;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use flagpipe_common::{Context, EvaluationDetail, FlagEventInfo};

use crate::events::{EventFactory, InputEvent};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to read input: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplayRecord {
    Evaluation {
        context: Context,
        flag: FlagEventInfo,
        detail: EvaluationDetail,
        #[serde(default)]
        default: Value,
        #[serde(default)]
        prereq_of: Option<String>,
    },
    Identify {
        context: Context,
    },
    Custom {
        context: Context,
        key: String,
        #[serde(default)]
        data: Option<Value>,
        #[serde(default)]
        metric_value: Option<f64>,
    },
    Raw {
        event: Value,
    },
}

impl ReplayRecord {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    pub fn into_event(self, factory: &EventFactory) -> Result<InputEvent, serde_json::Error> {
        let event = match self {
            ReplayRecord::Evaluation {
                context,
                flag,
                detail,
                default,
                prereq_of,
            } => factory.new_evaluation(&flag, context, &detail, default, prereq_of),
            ReplayRecord::Identify { context } => factory.new_identify(context),
            ReplayRecord::Custom {
                context,
                key,
                data,
                metric_value,
            } => factory.new_custom(context, key, data, metric_value),
            ReplayRecord::Raw { event } => {
                InputEvent::Raw(serde_json::value::to_raw_value(&event)?)
            }
        };
        Ok(event)
    }
}

/// Read every record from a JSON-lines source. Blank lines and lines starting
/// with `#` are skipped.
pub fn read_records<R: BufRead>(reader: R) -> Result<Vec<ReplayRecord>, ReplayError> {
    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let record = ReplayRecord::parse(trimmed).map_err(|source| ReplayError::Parse {
            line: index + 1,
            source,
        })?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const INPUT: &str = r#"
# recorded session
{"type":"evaluation","context":{"kind":"user","key":"u1"},"flag":{"key":"beta","version":5,"trackEvents":true},"detail":{"value":true,"variationIndex":0,"reason":{"kind":"FALLTHROUGH"}},"default":false}
{"type":"identify","context":{"key":"u2","name":"Bo"}}

{"type":"custom","context":{"key":"u1"},"key":"purchase","metric_value":9.5}
{"type":"raw","event":{"kind":"custom","key":"x","creationDate":1}}
"#;

    #[test]
    fn test_read_records() {
        let records = read_records(INPUT.as_bytes()).unwrap();
        assert_eq!(records.len(), 4);
        assert!(matches!(records[0], ReplayRecord::Evaluation { .. }));
        assert!(matches!(records[3], ReplayRecord::Raw { .. }));
    }

    #[test]
    fn test_into_event() {
        let factory = EventFactory::new(false);
        let records = read_records(INPUT.as_bytes()).unwrap();
        let events: Vec<InputEvent> = records
            .into_iter()
            .map(|r| r.into_event(&factory).unwrap())
            .collect();

        match &events[0] {
            InputEvent::Evaluation(e) => {
                assert_eq!(e.key, "beta");
                assert_eq!(e.version, Some(5));
                assert_eq!(e.variation, Some(0));
                assert_eq!(e.value, json!(true));
                assert!(e.track_events);
            }
            other => panic!("unexpected {}", other.kind_name()),
        }
        match &events[2] {
            InputEvent::Custom(e) => assert_eq!(e.metric_value, Some(9.5)),
            other => panic!("unexpected {}", other.kind_name()),
        }
        match &events[3] {
            InputEvent::Raw(raw) => {
                let value: Value = serde_json::from_str(raw.get()).unwrap();
                assert_eq!(value["key"], json!("x"));
            }
            other => panic!("unexpected {}", other.kind_name()),
        }
    }

    #[test]
    fn test_parse_error_reports_line() {
        let input = "{\"type\":\"identify\",\"context\":{\"key\":\"u1\"}}\nnot json\n";
        match read_records(input.as_bytes()) {
            Err(ReplayError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {other:?}"),
        }
    }
}
