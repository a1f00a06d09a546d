use anyhow::Result;
use serde::{Deserialize, Serialize};
use skylark_server::ServerSettings;
use std::{
    fs,
    net::{Ipv4Addr, SocketAddr},
    path::Path,
    time::Duration,
};
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config/skylark.toml";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SkylarkConfig {
    /// Simulation step in milliseconds.
    pub tick_millis: u64,
    /// Address `serve` listens on unless overridden on the command line.
    pub listen_addr: SocketAddr,
    pub server: ServerSettings,
}

impl Default for SkylarkConfig {
    fn default() -> Self {
        Self {
            tick_millis: 20,
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 4433)),
            server: ServerSettings::default(),
        }
    }
}

impl SkylarkConfig {
    /// Load configuration from the default path.
    pub fn load() -> Self {
        Self::load_from_path(Path::new(DEFAULT_CONFIG_PATH))
    }

    /// Load configuration from an explicit path, falling back to defaults on errors.
    pub fn load_from_path(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<SkylarkConfig>(&contents) {
                Ok(cfg) => cfg,
                Err(err) => {
                    warn!("Failed to parse {}: {err}. Using defaults", path.display());
                    SkylarkConfig::default()
                }
            },
            Err(err) => {
                let missing_default = err.kind() == std::io::ErrorKind::NotFound
                    && path == Path::new(DEFAULT_CONFIG_PATH);
                if missing_default {
                    warn!("Config not found at {}. Using defaults", path.display());
                } else {
                    warn!("Failed to read {}: {err}. Using defaults", path.display());
                }
                SkylarkConfig::default()
            }
        }
    }

    /// Save configuration to an explicit path.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let toml = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml)?;
        Ok(())
    }

    /// Length of one simulation step; never zero.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SkylarkConfig::load_from_path(&dir.path().join("absent.toml"));
        assert_eq!(cfg, SkylarkConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skylark.toml");
        fs::write(
            &path,
            concat!(
                "tick_millis = 50\n",
                "[server]\nworld_seed = 99\n",
                "[server.replication]\nrender_delay_ms = 150.0\n",
            ),
        )
        .unwrap();

        let cfg = SkylarkConfig::load_from_path(&path);
        assert_eq!(cfg.tick_millis, 50);
        assert_eq!(cfg.server.world_seed, 99);
        assert_eq!(cfg.server.replication.render_delay_ms, 150.0);
        assert_eq!(cfg.server.replication.min_send_interval_ms, 50.0);
        assert_eq!(cfg.server.session.max_peers, 64);
        assert_eq!(cfg.listen_addr, SkylarkConfig::default().listen_addr);
    }

    #[test]
    fn test_unparsable_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "tick_millis = \"soon\"").unwrap();
        assert_eq!(SkylarkConfig::load_from_path(&path), SkylarkConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/skylark.toml");
        let mut cfg = SkylarkConfig::default();
        cfg.server.session.single_player = true;
        cfg.save_to_path(&path).unwrap();
        assert_eq!(SkylarkConfig::load_from_path(&path), cfg);
    }

    #[test]
    fn test_zero_tick_is_clamped() {
        let cfg = SkylarkConfig {
            tick_millis: 0,
            ..Default::default()
        };
        assert_eq!(cfg.tick(), Duration::from_millis(1));
    }
}
