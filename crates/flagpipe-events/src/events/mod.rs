//! Event model and the single-owner components the dispatcher drives.

pub mod context_format;
pub mod dedup;
pub mod outbox;
pub mod output;
pub mod redaction;
pub mod summary;
pub mod types;

pub use context_format::ContextFormatter;
pub use dedup::DedupCache;
pub use outbox::{FlushSnapshot, Outbox};
pub use output::{FormatError, FormattedPayload, OutputFormatter};
pub use redaction::{AttributeRedactionIndex, Lookup};
pub use summary::{EventSummarizer, EventSummary, FlagSummary, VariationKey, VariationSummary};
pub use types::{
    BaseEvent, ConsistencyCheck, CustomRecord, EvaluationRecord, EventFactory, IdentifyRecord,
    IndexRecord, InputEvent, MigrationMeasurements, MigrationOpRecord, Operation, Origin,
    OutputEvent, Stage,
};
