//! Observability module for the lock manager.
//!
//! Installs the `tracing` subscriber used by every module in the crate.

use crate::config::ObservabilityConfig;
use crate::error::{LockError, Result};
use ::tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies log at this level unless `log_level` says otherwise.
const DEPENDENCY_LEVEL: &str = "warn";

/// Initialize logging.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => default_filter(&config.log_level)?,
    };

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_current_span(false))
            .try_init()
    } else {
        subscriber.with(fmt::layer().with_thread_ids(true)).try_init()
    };
    installed.map_err(|e| LockError::Internal(format!("Failed to init logging: {}", e)))?;

    info!(level = %config.log_level, json = config.json_logs, "Lock manager logging initialized");
    Ok(())
}

/// Filter for `log_level`.
///
/// A bare level such as `debug` applies to this crate only. Anything
/// containing a target (`=`) or several directives (`,`) is used as is.
fn default_filter(log_level: &str) -> Result<EnvFilter> {
    let directives = if log_level.contains('=') || log_level.contains(',') {
        log_level.to_string()
    } else {
        format!("{},{}={}", DEPENDENCY_LEVEL, env!("CARGO_CRATE_NAME"), log_level)
    };
    EnvFilter::try_new(&directives).map_err(|e| LockError::InvalidConfig {
        field: "observability.log_level".to_string(),
        reason: format!("{:?}: {}", log_level, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_level_is_scoped_to_this_crate() {
        let filter = default_filter("debug").unwrap().to_string();
        assert!(filter.contains("strata_dlm=debug"));
        assert!(filter.contains("warn"));
    }

    #[test]
    fn test_full_directives_pass_through() {
        let filter = default_filter("info,strata_dlm::server=trace").unwrap().to_string();
        assert!(filter.contains("strata_dlm::server=trace"));
        assert!(!filter.contains("strata_dlm=info"));
    }

    #[test]
    fn test_unknown_level_is_a_config_error() {
        let err = default_filter("loud").unwrap_err();
        assert!(matches!(err, LockError::InvalidConfig { ref field, .. } if field == "observability.log_level"));
    }

    #[test]
    fn test_second_init_fails() {
        let config = ObservabilityConfig::default();
        // Another test may have installed a subscriber first; either way the
        // second call must fail rather than panic.
        let _ = init(&config);
        assert!(matches!(init(&config), Err(LockError::Internal(_))));
    }
}
