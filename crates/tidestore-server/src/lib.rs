//! Tidestore Ingest Server
//!
//! Wiring for the `tidestore-ingest` binary:
//! - [`settings`]: TOML file plus `TIDESTORE_*` environment overrides
//! - [`traffic`]: synthetic log traffic for running against the in-memory log

pub mod settings;
pub mod traffic;

pub use traffic::{TrafficConfig, TrafficGenerator, TrafficStats};
