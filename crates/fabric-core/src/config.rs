//! Centralized Configuration Management
//!
//! All tunables for the hub, the leaf, connections, the replay window and the
//! replicated record store live here. Every section deserializes with defaults
//! so a TOML file only has to name what it overrides.

use core::time::Duration;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{FabricError, FabricResult};

/// Protocol version string exchanged during handshakes
pub const PROTOCOL_VERSION: &str = "fabric/1";

// ----------------------------------------------------------------------------
// Replay Window Configuration
// ----------------------------------------------------------------------------

/// Replay window sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Number of recent sequence numbers retained per connection id
    pub capacity: usize,
    /// How far below the newest accepted sequence an old sequence may still land
    pub tolerance: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            tolerance: 10,
        }
    }
}

// ----------------------------------------------------------------------------
// Connection Configuration
// ----------------------------------------------------------------------------

/// Per-connection timers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Minimum spacing between keep-alives on one connection
    pub keep_alive_min_interval_ms: u64,
    /// Pending response callbacks older than this are purged
    pub callback_ttl_ms: u64,
    /// Minimum spacing between callback cleanup passes
    pub cleanup_interval_ms: u64,
    /// Default bound for `request()` helpers
    pub request_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keep_alive_min_interval_ms: 500,
            callback_ttl_ms: 5 * 60 * 1000,
            cleanup_interval_ms: 60 * 1000,
            request_timeout_ms: 5_000,
        }
    }
}

impl ConnectionConfig {
    pub fn keep_alive_min_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_min_interval_ms)
    }

    pub fn callback_ttl(&self) -> Duration {
        Duration::from_millis(self.callback_ttl_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Hub Configuration
// ----------------------------------------------------------------------------

/// Hub acceptor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Address the listener binds to
    pub bind_address: String,
    /// Directory of public key files for admitted leaves
    pub key_directory: Option<PathBuf>,
    /// Connections unauthenticated for longer than this are dropped
    pub auth_timeout_ms: u64,
    /// Authenticated connections silent for longer than this are dropped
    pub downstream_timeout_ms: u64,
    /// Keep-alive and timeout sweep period
    pub sweep_interval_ms: u64,
    /// Delay before rebinding a failed listener
    pub restart_delay_ms: u64,
    /// Bounded wait on the connection set lock
    pub lock_timeout_ms: u64,
    /// Envelopes queued per leaf before further relays to it are dropped
    pub outbound_queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7500".to_string(),
            key_directory: None,
            auth_timeout_ms: 3_000,
            downstream_timeout_ms: 3_000,
            sweep_interval_ms: 1_000,
            restart_delay_ms: 5_000,
            lock_timeout_ms: 5_000,
            outbound_queue_capacity: 1_024,
        }
    }
}

impl HubConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn downstream_timeout(&self) -> Duration {
        Duration::from_millis(self.downstream_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Leaf Configuration
// ----------------------------------------------------------------------------

/// Leaf dialer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeafConfig {
    /// Hub address to dial
    pub hub_address: String,
    /// Private key file holding this leaf's identity
    pub key_file: Option<PathBuf>,
    /// Bound on TCP connect plus handshake
    pub connect_timeout_ms: u64,
    /// The hub link is dropped after this much silence
    pub upstream_timeout_ms: u64,
    /// Keep-alive period towards the hub and p2p peers
    pub keep_alive_interval_ms: u64,
    /// First reconnect delay
    pub backoff_initial_ms: u64,
    /// Reconnect delay ceiling
    pub backoff_max_ms: u64,
    /// Whether to open direct leaf-to-leaf channels
    pub p2p_enabled: bool,
    /// Address the p2p listener binds to
    pub p2p_bind_address: String,
    /// Host advertised to siblings instead of the address the hub sees
    pub p2p_advertise_host: Option<String>,
    /// Bound on a whole p2p handshake
    pub p2p_handshake_timeout_ms: u64,
}

impl Default for LeafConfig {
    fn default() -> Self {
        Self {
            hub_address: "127.0.0.1:7500".to_string(),
            key_file: None,
            connect_timeout_ms: 5_000,
            upstream_timeout_ms: 10_000,
            keep_alive_interval_ms: 1_000,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
            p2p_enabled: true,
            p2p_bind_address: "0.0.0.0:0".to_string(),
            p2p_advertise_host: None,
            p2p_handshake_timeout_ms: 3_000,
        }
    }
}

impl LeafConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn p2p_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.p2p_handshake_timeout_ms)
    }

    /// Reconnect delay after `failures` consecutive failures (exponential, capped)
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let millis = self
            .backoff_initial_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_ms);
        Duration::from_millis(millis)
    }
}

// ----------------------------------------------------------------------------
// Replication Configuration
// ----------------------------------------------------------------------------

/// Replicated record store settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Hub reconciliation tick (reap, hash, broadcast on change)
    pub hash_interval_ms: u64,
    /// Bounded wait on the record table lock
    pub lock_timeout_ms: u64,
    /// Bound on a snapshot request from a leaf
    pub snapshot_timeout_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            hash_interval_ms: 2_000,
            lock_timeout_ms: 5_000,
            snapshot_timeout_ms: 5_000,
        }
    }
}

impl ReplicationConfig {
    pub fn hash_interval(&self) -> Duration {
        Duration::from_millis(self.hash_interval_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Top-level Configuration
// ----------------------------------------------------------------------------

/// Complete fabric configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Exact-match protocol version string
    pub protocol_version: String,
    pub hub: HubConfig,
    pub leaf: LeafConfig,
    pub connection: ConnectionConfig,
    pub replay: ReplayConfig,
    pub replication: ReplicationConfig,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            hub: HubConfig::default(),
            leaf: LeafConfig::default(),
            connection: ConnectionConfig::default(),
            replay: ReplayConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl FabricConfig {
    /// Short timers on loopback, for tests
    pub fn testing() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            hub: HubConfig {
                bind_address: "127.0.0.1:0".to_string(),
                key_directory: None,
                auth_timeout_ms: 2_000,
                downstream_timeout_ms: 3_000,
                sweep_interval_ms: 200,
                restart_delay_ms: 100,
                lock_timeout_ms: 1_000,
                outbound_queue_capacity: 64,
            },
            leaf: LeafConfig {
                hub_address: "127.0.0.1:7500".to_string(),
                key_file: None,
                connect_timeout_ms: 2_000,
                upstream_timeout_ms: 3_000,
                keep_alive_interval_ms: 200,
                backoff_initial_ms: 50,
                backoff_max_ms: 500,
                p2p_enabled: false,
                p2p_bind_address: "127.0.0.1:0".to_string(),
                p2p_advertise_host: None,
                p2p_handshake_timeout_ms: 2_000,
            },
            connection: ConnectionConfig {
                keep_alive_min_interval_ms: 100,
                ..ConnectionConfig::default()
            },
            replay: ReplayConfig::default(),
            replication: ReplicationConfig {
                hash_interval_ms: 200,
                lock_timeout_ms: 1_000,
                snapshot_timeout_ms: 2_000,
            },
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> FabricResult<()> {
        if self.protocol_version.is_empty() {
            return Err(FabricError::config_error("Protocol version cannot be empty"));
        }
        if self.replay.capacity == 0 {
            return Err(FabricError::config_error("Replay capacity cannot be zero"));
        }
        if self.hub.sweep_interval_ms == 0 {
            return Err(FabricError::config_error("Sweep interval cannot be zero"));
        }
        if self.hub.outbound_queue_capacity == 0 {
            return Err(FabricError::config_error(
                "Outbound queue capacity cannot be zero",
            ));
        }
        if self.leaf.keep_alive_interval_ms == 0 {
            return Err(FabricError::config_error(
                "Keep-alive interval cannot be zero",
            ));
        }
        if self.leaf.backoff_initial_ms > self.leaf.backoff_max_ms {
            return Err(FabricError::config_error(
                "Initial backoff cannot be greater than max backoff",
            ));
        }
        if self.replication.hash_interval_ms == 0 {
            return Err(FabricError::config_error("Hash interval cannot be zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(FabricConfig::default().validate().is_ok());
        assert!(FabricConfig::testing().validate().is_ok());
    }

    #[test]
    fn test_backoff_is_capped() {
        let leaf = LeafConfig::default();
        assert_eq!(leaf.backoff_delay(1), Duration::from_millis(500));
        assert_eq!(leaf.backoff_delay(2), Duration::from_millis(1_000));
        assert_eq!(leaf.backoff_delay(40), Duration::from_millis(30_000));
    }

    #[test]
    fn test_zero_replay_capacity_rejected() {
        let mut config = FabricConfig::default();
        config.replay.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_outbound_queue_rejected() {
        let mut config = FabricConfig::testing();
        config.hub.outbound_queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: FabricConfig =
            serde_json::from_str(r#"{"hub": {"bind_address": "127.0.0.1:9000"}}"#).unwrap();
        assert_eq!(config.hub.bind_address, "127.0.0.1:9000");
        assert_eq!(config.hub.downstream_timeout_ms, 3_000);
        assert_eq!(config.replay.capacity, 10);
    }
}
