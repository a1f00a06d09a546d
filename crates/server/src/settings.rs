use serde::{Deserialize, Serialize};
use skylark_net::{ReplicationConfig, SessionConfig};

/// Seed used when none is configured.
pub const DEFAULT_WORLD_SEED: u64 = 0x5EED_1A4C;

/// Everything the server host needs at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Terrain generator seed.
    pub world_seed: u64,
    /// Admission policy.
    pub session: SessionConfig,
    /// Entity replication timing.
    pub replication: ReplicationConfig,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            world_seed: DEFAULT_WORLD_SEED,
            session: SessionConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }
}
