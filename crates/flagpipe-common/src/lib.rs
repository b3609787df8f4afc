//! Shared types for the flagpipe event pipeline.
//!
//! This crate contains the collaborators the pipeline reads but never mutates:
//! - Evaluation contexts (single and multi-kind) and their builders
//! - Attribute references with the `/`-path escaping rules
//! - Evaluation results (value, variation, reason, flag event properties)

pub mod context;
pub mod evaluation;
pub mod reference;

pub use context::{Context, ContextBuilder, ContextError, Kind, MultiContextBuilder};
pub use evaluation::{ErrorKind, EvaluationDetail, FlagEventInfo, Reason};
pub use reference::{Reference, ReferenceError};
