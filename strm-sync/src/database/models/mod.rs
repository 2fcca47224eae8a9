//! Database models for strm-sync.
//!
//! These models map directly to the database schema and handle
//! serialization/deserialization of JSON fields.

pub mod config;
pub mod file_history;
pub mod notification;
pub mod run_log;
pub mod task;

pub use config::*;
pub use file_history::*;
pub use notification::*;
pub use run_log::*;
pub use task::*;
