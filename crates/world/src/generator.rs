//! Deterministic chunk generators.
//!
//! A generator is a pure function of (seed, position): the streaming service may
//! evict a chunk and regenerate it later and must get identical initial content.

use crate::biome::BiomeId;
use crate::chunk::{Chunk, ChunkLayers, TileId, TILE_EMPTY};
use crate::noise::ClimateNoise;
use rand::Rng;
use skylark_core::{scoped_rng, ChunkPos, CHUNK_SIZE};
use tracing::trace;

/// Produces the initial content of a chunk.
pub trait ChunkGenerator {
    /// Generate the chunk at `position`. Must be side-effect free.
    fn generate_chunk_at(&self, position: ChunkPos) -> Chunk;
}

impl<F> ChunkGenerator for F
where
    F: Fn(ChunkPos) -> Chunk,
{
    fn generate_chunk_at(&self, position: ChunkPos) -> Chunk {
        self(position)
    }
}

/// Noise-driven terrain with biomes and scattered objects.
pub struct TerrainGenerator {
    world_seed: u64,
    climate: ClimateNoise,
}

impl TerrainGenerator {
    /// Create a generator for `world_seed`.
    pub fn new(world_seed: u64) -> Self {
        Self {
            world_seed,
            climate: ClimateNoise::new(world_seed),
        }
    }

    /// Seed this generator was built with.
    pub fn world_seed(&self) -> u64 {
        self.world_seed
    }
}

impl ChunkGenerator for TerrainGenerator {
    fn generate_chunk_at(&self, position: ChunkPos) -> Chunk {
        let mut layers = ChunkLayers::default();
        let mut rng = scoped_rng(self.world_seed, position);
        let origin_x = position.x as f64 * CHUNK_SIZE as f64;
        let origin_y = position.y as f64 * CHUNK_SIZE as f64;

        for cy in 0..CHUNK_SIZE {
            for cx in 0..CHUNK_SIZE {
                let index = cy * CHUNK_SIZE + cx;
                let (elevation, heat, moisture) =
                    self.climate.sample(origin_x + cx as f64, origin_y + cy as f64);
                let biome = BiomeId::classify(elevation, heat, moisture);

                layers.ground[index] = biome.ground_tile();
                layers.biome[index] = biome as u8;
                layers.heat[index] = heat;
                layers.moisture[index] = moisture;

                // Draw for every cell so the RNG stream does not depend on biome layout.
                let roll: f64 = rng.gen();
                let (object, chance) = biome.scatter();
                if roll < chance {
                    layers.object[index] = object;
                }
            }
        }

        trace!(chunk = %position, "generated terrain chunk");
        Chunk::from_layers(position, layers)
    }
}

/// Uniform chunks, handy for tests and empty worlds.
#[derive(Debug, Clone, Copy)]
pub struct FlatGenerator {
    /// Ground tile painted everywhere.
    pub ground: TileId,
    /// Biome id recorded everywhere.
    pub biome: BiomeId,
}

impl Default for FlatGenerator {
    fn default() -> Self {
        Self {
            ground: BiomeId::Plains.ground_tile(),
            biome: BiomeId::Plains,
        }
    }
}

impl ChunkGenerator for FlatGenerator {
    fn generate_chunk_at(&self, position: ChunkPos) -> Chunk {
        let mut layers = ChunkLayers::default();
        layers.ground.fill(self.ground);
        layers.object.fill(TILE_EMPTY);
        layers.biome.fill(self.biome as u8);
        layers.heat.fill(128);
        layers.moisture.fill(128);
        Chunk::from_layers(position, layers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terrain_is_deterministic() {
        let a = TerrainGenerator::new(1234);
        let b = TerrainGenerator::new(1234);
        let pos = ChunkPos::new(2, 3);
        assert_eq!(a.generate_chunk_at(pos), b.generate_chunk_at(pos));
    }

    #[test]
    fn test_generated_chunks_are_clean() {
        let gen = TerrainGenerator::new(5);
        let chunk = gen.generate_chunk_at(ChunkPos::new(-4, 9));
        assert!(!chunk.is_dirty());
        assert_eq!(chunk.position(), ChunkPos::new(-4, 9));
    }

    #[test]
    fn test_ground_matches_biome() {
        let gen = TerrainGenerator::new(77);
        let chunk = gen.generate_chunk_at(ChunkPos::new(0, 0));
        let layers = chunk.layers();
        for i in 0..layers.ground.len() {
            let biome = BiomeId::try_from(layers.biome[i]).unwrap();
            assert_eq!(layers.ground[i], biome.ground_tile());
        }
    }

    #[test]
    fn test_different_positions_differ() {
        let gen = TerrainGenerator::new(8);
        let a = gen.generate_chunk_at(ChunkPos::new(0, 0));
        let b = gen.generate_chunk_at(ChunkPos::new(40, -40));
        assert_ne!(a.layers(), b.layers());
    }

    #[test]
    fn test_closure_generator() {
        let gen = |pos: ChunkPos| Chunk::new(pos);
        assert_eq!(gen.generate_chunk_at(ChunkPos::new(1, 1)).position(), ChunkPos::new(1, 1));
    }

    #[test]
    fn test_flat_generator_fills_ground() {
        let chunk = FlatGenerator::default().generate_chunk_at(ChunkPos::new(0, 0));
        assert!(chunk
            .layers()
            .ground
            .iter()
            .all(|&tile| tile == BiomeId::Plains.ground_tile()));
    }
}
