//! Analytics event pipeline for feature-flag SDKs.
//!
//! Turns flag evaluations, identify calls, custom events and migration
//! operations into batched, privacy-filtered JSON payloads and delivers them
//! to a collector.
//!
//! ## Modules
//!
//! - `events`: event model, redaction, summarization, dedup and wire output
//! - `delivery`: HTTP delivery with one retry and status classification
//! - `processor`: the producer handle and the dispatcher task
//! - `diagnostics`: periodic SDK diagnostics
//! - `config`: configuration loading and validation
//! - `replay`: recorded-event input for the `flagpipe` binary

pub mod config;
pub mod delivery;
pub mod diagnostics;
pub mod events;
pub mod processor;
pub mod replay;

pub use config::{Config, DiagnosticsConfig, EventsConfig};
pub use delivery::{
    EventPayload, EventSender, EventSenderResult, HttpEventSender, PayloadKind,
    RecordingEventSender, ReqwestTransport, Transport, TransportError, TransportResponse,
};
pub use diagnostics::DiagnosticsManager;
pub use events::{EventFactory, InputEvent, OutputFormatter};
pub use processor::{EventProcessor, EventStats, EventStatsSnapshot, ProcessorConfig};
pub use replay::{ReplayRecord, read_records};
