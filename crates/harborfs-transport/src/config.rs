//! Configuration for the transport subsystem.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Process-wide connection-manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionManagerConfig {
    /// Master switch. When false every connection is admitted immediately as
    /// unmanaged and no cluster coordination happens.
    pub enable_connection_manager: bool,
    /// Deadline for draining peers on admit and for the local drain, in
    /// seconds.
    pub connection_manager_timeout_secs: u64,
    /// NFSv4 lease lifetime granted to clients, in seconds.
    pub lease_lifetime_secs: u64,
    /// Maximum time the cluster waits before declaring an unresponsive
    /// replica dead, in seconds. Added to the lease extension after a drain
    /// so reclaimable state survives the slowest possible migration.
    pub peer_eviction_timeout_secs: u64,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            enable_connection_manager: true,
            connection_manager_timeout_secs: 60,
            lease_lifetime_secs: 60,
            peer_eviction_timeout_secs: 120,
        }
    }
}

impl ConnectionManagerConfig {
    /// Parses the config from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| TransportError::InvalidConfig {
            msg: err.to_string(),
        })
    }

    /// Drain deadline as a [`Duration`].
    pub fn manager_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_manager_timeout_secs)
    }

    /// Lease extension applied after a successful local drain: the lease
    /// lifetime plus the longest the cluster can wait on a dead peer.
    pub fn lease_extension(&self) -> Duration {
        Duration::from_secs(self.lease_lifetime_secs + self.peer_eviction_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionManagerConfig::default();
        assert!(config.enable_connection_manager);
        assert_eq!(config.manager_timeout(), Duration::from_secs(60));
        assert_eq!(config.lease_extension(), Duration::from_secs(180));
    }

    #[test]
    fn test_from_toml_partial() {
        let config = ConnectionManagerConfig::from_toml_str(
            "enable_connection_manager = false\nconnection_manager_timeout_secs = 5\n",
        )
        .unwrap();
        assert!(!config.enable_connection_manager);
        assert_eq!(config.connection_manager_timeout_secs, 5);
        // Unset keys keep their defaults.
        assert_eq!(config.lease_lifetime_secs, 60);
    }

    #[test]
    fn test_from_toml_rejects_garbage() {
        assert!(matches!(
            ConnectionManagerConfig::from_toml_str("enable_connection_manager = \"maybe\""),
            Err(TransportError::InvalidConfig { .. })
        ));
    }
}
