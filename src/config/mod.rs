//! Configuration module for the Strata lock manager.

use crate::error::{LockError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Shortest GC period the client registry will run with.
pub const MIN_GC_INTERVAL: Duration = Duration::from_millis(100);

/// Main configuration for a lock manager deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DlmConfig {
    /// Client-side lock registry configuration.
    #[serde(default)]
    pub client: ClientLockConfig,
    /// Server-side lock manager configuration.
    #[serde(default)]
    pub server: ServerLockConfig,
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl DlmConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LockError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| LockError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.client.gc_interval.is_zero() {
            return Err(LockError::InvalidConfig {
                field: "client.gc_interval".to_string(),
                reason: "GC interval must be non-zero".to_string(),
            });
        }

        if self.server.segments == 0 {
            return Err(LockError::InvalidConfig {
                field: "server.segments".to_string(),
                reason: "Lock store needs at least one segment".to_string(),
            });
        }

        if let Some(lease) = self.server.greedy_lease {
            if lease.is_zero() {
                return Err(LockError::InvalidConfig {
                    field: "server.greedy_lease".to_string(),
                    reason: "Lease must be non-zero when set".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Create a development configuration.
    pub fn development() -> Self {
        Self {
            client: ClientLockConfig {
                gc_interval: Duration::from_secs(5),
                initial_capacity: 64,
            },
            server: ServerLockConfig {
                segments: 4,
                policy: LockPolicy::Greedy,
                greedy_lease: None,
            },
            observability: ObservabilityConfig {
                log_level: "debug".to_string(),
                json_logs: false,
            },
        }
    }
}

/// Client registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientLockConfig {
    /// Period of the idle lock collection sweep.
    pub gc_interval: Duration,
    /// Initial capacity of the lock registry.
    pub initial_capacity: usize,
}

impl ClientLockConfig {
    /// GC period actually used, never shorter than [`MIN_GC_INTERVAL`].
    pub fn effective_gc_interval(&self) -> Duration {
        self.gc_interval.max(MIN_GC_INTERVAL)
    }
}

impl Default for ClientLockConfig {
    fn default() -> Self {
        Self {
            gc_interval: Duration::from_secs(60),
            initial_capacity: 1024,
        }
    }
}

/// Award policy of server locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    /// Grant whole locks to clients and recall them under contention.
    #[default]
    Greedy,
    /// Award every request to the literal requesting thread.
    NonGreedy,
}

/// Server lock manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerLockConfig {
    /// Number of lock store segments.
    pub segments: usize,
    /// Award policy for new locks.
    pub policy: LockPolicy,
    /// Lease attached to recall messages, if any.
    pub greedy_lease: Option<Duration>,
}

impl Default for ServerLockConfig {
    fn default() -> Self {
        Self {
            segments: 32,
            policy: LockPolicy::Greedy,
            greedy_lease: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = DlmConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.segments, 32);
        assert_eq!(config.server.policy, LockPolicy::Greedy);
    }

    #[test]
    fn test_zero_segments_rejected() {
        let mut config = DlmConfig::development();
        config.server.segments = 0;
        match config.validate() {
            Err(LockError::InvalidConfig { field, .. }) => assert_eq!(field, "server.segments"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_gc_interval_clamped() {
        let config = ClientLockConfig {
            gc_interval: Duration::from_millis(5),
            initial_capacity: 1,
        };
        assert_eq!(config.effective_gc_interval(), MIN_GC_INTERVAL);
    }

    #[test]
    fn test_from_file() {
        let config = DlmConfig::development();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string(&config).unwrap().as_bytes())
            .unwrap();

        let loaded = DlmConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded.server.segments, 4);
        assert_eq!(loaded.observability.log_level, "debug");
    }

    #[test]
    fn test_from_file_partial_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(br#"{"server": {"segments": 8, "policy": "non_greedy", "greedy_lease": null}}"#)
            .unwrap();

        let loaded = DlmConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded.server.policy, LockPolicy::NonGreedy);
        assert_eq!(loaded.client.initial_capacity, 1024);
    }

    #[test]
    fn test_from_file_rejects_garbage() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        assert!(matches!(
            DlmConfig::from_file(file.path()),
            Err(LockError::Config(_))
        ));
    }
}
