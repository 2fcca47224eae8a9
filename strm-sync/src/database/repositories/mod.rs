//! Repository layer for database access.
//!
//! Each repository is a trait with a sqlx-backed implementation so services
//! can be exercised against fakes in tests.

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
