use anyhow::{Context, Result};
use skylark_client::MultiplayerClient;
use skylark_core::{ChunkPos, PeerId, Vec2};
use skylark_net::LoopbackNetwork;
use skylark_server::{MultiplayerServer, ServerSettings};
use skylark_world::{Layer, LocalPos};
use std::time::Duration;
use tracing::{debug, info};

/// Radius of the circle simulated players walk along.
const WALK_RADIUS: f32 = 24.0;

pub struct HeadlessConfig {
    pub settings: ServerSettings,
    pub tick: Duration,
    pub clients: usize,
    pub frames: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadlessReport {
    pub frames: usize,
    pub peers: usize,
    pub server_entities: usize,
    pub loaded_chunks: usize,
    /// Mirrored entity count per client, in join order.
    pub client_entities: Vec<usize>,
    /// Cached chunk count per client, in join order.
    pub client_chunks: Vec<usize>,
}

struct SimulatedPlayer {
    client: MultiplayerClient,
    phase: f32,
    chunk: Option<ChunkPos>,
}

impl SimulatedPlayer {
    fn position(&self, frame: usize) -> Vec2 {
        let angle = self.phase + frame as f32 * 0.02;
        Vec2::new(angle.cos(), angle.sin()) * WALK_RADIUS
    }

    fn walk(&mut self, frame: usize) -> Result<()> {
        if !self.client.is_connected() {
            return Ok(());
        }
        let position = self.position(frame);
        if !self.client.move_player(position) {
            return Ok(());
        }
        let chunk = ChunkPos::containing(position);
        if self.chunk != Some(chunk) {
            if let Some(old) = self.chunk.replace(chunk) {
                self.client.release_chunk(old)?;
            }
            self.client.request_chunk(chunk)?;
            debug!(peer = %self.client.identity(), chunk = %chunk, "entered chunk");
        }
        Ok(())
    }
}

/// Run a server and `clients` simulated players in-process for `frames` ticks.
pub fn run(cfg: HeadlessConfig) -> Result<HeadlessReport> {
    let network = LoopbackNetwork::new();
    let replication = cfg.settings.replication.clone();
    let mut server = MultiplayerServer::loopback(&network, cfg.settings)?;

    let mut players = Vec::with_capacity(cfg.clients);
    for i in 0..cfg.clients {
        let id = PeerId(i as u64 + 1);
        let name = format!("player{}", i + 1);
        let client = MultiplayerClient::loopback(&network, id, &name, replication.clone())
            .with_context(|| format!("Failed to create client {id}"))?;
        players.push(SimulatedPlayer {
            client,
            phase: i as f32 * std::f32::consts::TAU / cfg.clients.max(1) as f32,
            chunk: None,
        });
    }

    let mob = server.spawn_mob(1, 20, Vec2::ZERO)?;
    info!(clients = cfg.clients, frames = cfg.frames, "Starting loopback simulation");

    for frame in 0..cfg.frames {
        let t = frame as f32 * 0.05;
        server.move_entity(mob, Vec2::new(t.sin() * 4.0, 0.0));
        server.update(cfg.tick).context("server tick")?;

        for player in &mut players {
            player.walk(frame)?;
            player.client.update(cfg.tick).context("client tick")?;
        }

        // One edit mid-run so dirty-chunk streaming is exercised.
        if frame == cfg.frames / 2 {
            if let Some(player) = players.first_mut() {
                if let Some(chunk) = player.chunk {
                    player
                        .client
                        .edit_block(chunk, LocalPos::new(8, 8), Layer::Object, 1)?;
                }
            }
        }
    }

    let report = HeadlessReport {
        frames: cfg.frames,
        peers: server.client_count(),
        server_entities: server.world().replication().len(),
        loaded_chunks: server.world().chunks().loaded_count(),
        client_entities: players
            .iter()
            .map(|p| p.client.world().replication().len())
            .collect(),
        client_chunks: players
            .iter()
            .map(|p| p.client.world().cached_chunks())
            .collect(),
    };
    info!(
        peers = report.peers,
        entities = report.server_entities,
        chunks = report.loaded_chunks,
        "Loopback simulation finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_run_converges() {
        let report = run(HeadlessConfig {
            settings: ServerSettings::default(),
            tick: Duration::from_millis(20),
            clients: 3,
            frames: 120,
        })
        .unwrap();

        assert_eq!(report.peers, 3);
        // Three players plus the mob.
        assert_eq!(report.server_entities, 4);
        assert_eq!(report.client_entities, vec![4, 4, 4]);
        assert!(report.loaded_chunks >= 1);
        assert!(report.client_chunks.iter().all(|&n| n <= 1));
    }
}
