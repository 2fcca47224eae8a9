//! Pointer file generation.
//!
//! The [`pipeline`] walks a task's remote root and hands each file to the
//! [`engine`], which applies the naming rules from [`naming`].

pub mod engine;
pub mod naming;
pub mod pipeline;

pub use engine::{EntryOutcome, GenerationContext, GenerationEngine, ProcessedEntry};
pub use naming::{FileKind, SuffixRules};
pub use pipeline::{NoProgress, PipelineReport, ProgressSink, SyncPipeline};
