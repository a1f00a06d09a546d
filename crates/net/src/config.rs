//! Tunables for sessions and replication.

use serde::{Deserialize, Serialize};

/// Entity replication timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Lag applied to remote entities so two snapshots are usually available.
    pub render_delay_ms: f64,
    /// Minimum gap between two broadcasts of the same authoritative entity.
    pub min_send_interval_ms: f64,
    /// Snapshot history kept per remote entity.
    pub max_queued_snapshots: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            render_delay_ms: 100.0,
            min_send_interval_ms: 50.0,
            max_queued_snapshots: 32,
        }
    }
}

/// Server session admission policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Deny every remote connection.
    pub single_player: bool,
    /// Upper bound on connected plus pending peers.
    pub max_peers: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            single_player: false,
            max_peers: 64,
        }
    }
}
