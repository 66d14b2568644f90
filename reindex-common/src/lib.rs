//! # Reindex Common Library
//!
//! Shared code for the catalog reindex services:
//! - Error type and result alias
//! - Bootstrap configuration (TOML file, environment, defaults)
//! - SQLite initialization and schema
//! - Event types (ReindexEvent enum) and EventBus
//! - Time helpers

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
