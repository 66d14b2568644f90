//! Test Helper Utilities
//!
//! Shared fakes and setup for reindex-watcher integration tests

#![allow(dead_code)]

pub mod fakes;
pub mod setup;

pub use fakes::{FakeSource, MemoryDocumentStore};
pub use setup::{create_test_pool, create_test_reindexer, drain_events, test_config};
