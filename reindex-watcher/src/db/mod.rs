//! Database access: broker, dedup store, settings

pub mod broker;
pub mod dedup;
pub mod settings;

pub use broker::{Broker, REINDEX_PAUSE_SCOPE};
pub use dedup::DedupStore;
