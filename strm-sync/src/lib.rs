//! strm-sync library crate.
//!
//! Mirrors a remote file index into a local tree of `.strm` pointer files
//! and sidecars. This module exposes the core functionality for integration
//! testing.

pub mod config;
pub mod database;
pub mod error;
pub mod generator;
pub mod logging;
pub mod notification;
pub mod remote;
pub mod scheduler;
pub mod services;
pub mod utils;

pub use error::{Error, Result};
