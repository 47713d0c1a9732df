//! Common test utilities for integration tests.

pub mod assertions;
pub mod cluster_sim;

pub use assertions::*;
pub use cluster_sim::*;

use strata_dlm::config::DlmConfig;
use strata_dlm::observability;

/// Install a quiet subscriber once; later calls are no-ops.
pub fn init_logging() {
    let mut config = DlmConfig::development().observability;
    config.log_level = "warn".to_string();
    let _ = observability::init(&config);
}
