//! Chunk interest management and streaming.
//!
//! Chunks are generated lazily on first subscription, streamed in full to every
//! observer whenever they change, and evicted once nobody observes them.

use skylark_core::{ChunkPos, PeerId};
use skylark_net::protocol::ChunkData;
use skylark_net::{NetError, Outbox};
use skylark_world::{Chunk, ChunkGenerator, Layer, LocalPos, TileId, WorldError};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, trace};

/// Build the full wire snapshot of a chunk.
pub fn chunk_message(chunk: &Chunk) -> ChunkData {
    let layers = chunk.layers();
    ChunkData {
        position: chunk.position(),
        ground: layers.ground,
        object: layers.object,
        biome: layers.biome,
        heat: layers.heat,
        moisture: layers.moisture,
    }
}

struct ChunkRecord {
    chunk: Chunk,
    observers: BTreeSet<PeerId>,
}

/// Server-side chunk table keyed by position.
pub struct ChunkInterestService {
    generator: Box<dyn ChunkGenerator>,
    records: BTreeMap<ChunkPos, ChunkRecord>,
}

impl ChunkInterestService {
    /// Create an empty table backed by `generator`.
    pub fn new(generator: Box<dyn ChunkGenerator>) -> Self {
        Self {
            generator,
            records: BTreeMap::new(),
        }
    }

    /// Loaded chunk at `position`, if any.
    pub fn chunk(&self, position: ChunkPos) -> Option<&Chunk> {
        self.records.get(&position).map(|record| &record.chunk)
    }

    /// Whether a record exists for `position`.
    pub fn is_loaded(&self, position: ChunkPos) -> bool {
        self.records.contains_key(&position)
    }

    /// Number of loaded chunks.
    pub fn loaded_count(&self) -> usize {
        self.records.len()
    }

    /// Whether `peer` observes the chunk at `position`.
    pub fn is_observing(&self, peer: PeerId, position: ChunkPos) -> bool {
        self.records
            .get(&position)
            .is_some_and(|record| record.observers.contains(&peer))
    }

    /// Peers observing `position`, in id order.
    pub fn observers(&self, position: ChunkPos) -> Vec<PeerId> {
        self.records
            .get(&position)
            .map(|record| record.observers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Add `peer` as an observer of `position` and queue the full chunk for it.
    ///
    /// The chunk is generated if it is not loaded. Subscribing twice keeps a
    /// single observer entry but still resends the snapshot.
    pub fn subscribe(
        &mut self,
        peer: PeerId,
        position: ChunkPos,
        outbox: &mut Outbox,
    ) -> Result<(), NetError> {
        let generator = &self.generator;
        let record = self.records.entry(position).or_insert_with(|| {
            info!(chunk = %position, "generated chunk");
            ChunkRecord {
                chunk: generator.generate_chunk_at(position),
                observers: BTreeSet::new(),
            }
        });
        if record.observers.insert(peer) {
            debug!(%peer, chunk = %position, "peer subscribed to chunk");
        }
        outbox.send(peer, &chunk_message(&record.chunk))
    }

    /// Remove `peer` from the observers of `position`. Unknown pairs are ignored.
    pub fn unsubscribe(&mut self, peer: PeerId, position: ChunkPos) {
        if let Some(record) = self.records.get_mut(&position) {
            if record.observers.remove(&peer) {
                debug!(%peer, chunk = %position, "peer unsubscribed from chunk");
            }
        }
    }

    /// Drop `peer` from every observer set.
    pub fn remove_observer(&mut self, peer: PeerId) {
        for record in self.records.values_mut() {
            record.observers.remove(&peer);
        }
    }

    /// Overwrite one tile of a loaded chunk. Unloaded chunks are ignored and
    /// reported as `Ok(false)`.
    pub fn set_block(
        &mut self,
        position: ChunkPos,
        local: LocalPos,
        layer: Layer,
        value: TileId,
    ) -> Result<bool, WorldError> {
        match self.records.get_mut(&position) {
            Some(record) => {
                record.chunk.set_block(local, layer, value)?;
                trace!(chunk = %position, x = local.x, y = local.y, ?layer, value, "block set");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Evict unobserved chunks and stream dirty ones to their observers.
    ///
    /// Returns the positions evicted this pass.
    pub fn tick(&mut self, outbox: &mut Outbox) -> Result<Vec<ChunkPos>, NetError> {
        let mut evicted = Vec::new();
        for (position, record) in &mut self.records {
            if record.observers.is_empty() {
                evicted.push(*position);
            } else if record.chunk.is_dirty() {
                outbox.send_many(
                    record.observers.iter().copied(),
                    &chunk_message(&record.chunk),
                )?;
                record.chunk.clear_dirty();
                trace!(
                    chunk = %position,
                    observers = record.observers.len(),
                    "streamed dirty chunk"
                );
            }
        }
        for position in &evicted {
            self.records.remove(position);
            info!(chunk = %position, "evicted unobserved chunk");
        }
        Ok(evicted)
    }
}
