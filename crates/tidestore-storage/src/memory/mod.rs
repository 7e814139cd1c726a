//! In-memory log and store.
//!
//! Both behave like their production counterparts as far as the ingest path
//! can observe (consumer group offsets, sorted rows, shards, versioned cells)
//! and support fault injection. Used by the test suite and the demo mode of
//! the ingest binary.

mod log;
mod store;

pub use log::{InMemoryLog, InMemoryLogClient};
pub use store::{CellKey, CellVersion, InMemoryStore, WriteFault};
