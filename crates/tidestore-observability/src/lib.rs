//! Tidestore Observability
//!
//! Prometheus metrics for the ingest path and the router that exposes them.
//!
//! # Usage
//!
//! ```no_run
//! use tidestore_observability::{exporter, metrics};
//!
//! metrics::init();
//! let router = exporter::create_metrics_router();
//! ```

pub mod exporter;
pub mod metrics;

pub use metrics::{init as init_metrics, REGISTRY};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_init_is_safe() {
        init_metrics();
        init_metrics();
        let _registry = &*REGISTRY;
    }
}
