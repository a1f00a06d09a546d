//! Biome system for terrain generation.
//!
//! Assigns biomes based on elevation, heat and moisture samples.

use crate::chunk::{TileId, TILE_EMPTY};
use serde::{Deserialize, Serialize};

/// Ground tile: open water.
pub const TILE_WATER: TileId = 1;
/// Ground tile: sand.
pub const TILE_SAND: TileId = 2;
/// Ground tile: grass.
pub const TILE_GRASS: TileId = 3;
/// Ground tile: dry dirt.
pub const TILE_DIRT: TileId = 4;
/// Ground tile: snow.
pub const TILE_SNOW: TileId = 5;
/// Ground tile: mud.
pub const TILE_MUD: TileId = 6;

/// Object tile: tree.
pub const TILE_TREE: TileId = 16;
/// Object tile: cactus.
pub const TILE_CACTUS: TileId = 17;
/// Object tile: boulder.
pub const TILE_BOULDER: TileId = 18;

/// Biome identifier, stored per cell as its `u8` discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BiomeId {
    /// Below sea level.
    Ocean = 0,
    /// Shoreline band.
    Beach = 1,
    /// Hot and dry.
    Desert = 2,
    /// Hot, moderately dry.
    Savanna = 3,
    /// Temperate default.
    Plains = 4,
    /// Temperate and wet.
    Forest = 5,
    /// Hot and wet.
    Swamp = 6,
    /// Cold.
    Tundra = 7,
}

impl BiomeId {
    /// Sea level on the normalized elevation scale [-1, 1].
    pub const SEA_LEVEL: f64 = -0.15;

    /// Width of the beach band above sea level.
    pub const SHORE_BAND: f64 = 0.05;

    /// Pick a biome for a cell.
    pub fn classify(elevation: f64, heat: u8, moisture: u8) -> Self {
        if elevation < Self::SEA_LEVEL {
            return BiomeId::Ocean;
        }
        if elevation < Self::SEA_LEVEL + Self::SHORE_BAND {
            return BiomeId::Beach;
        }
        match (heat, moisture) {
            (0..=60, _) => BiomeId::Tundra,
            (181..=255, 0..=90) => BiomeId::Desert,
            (181..=255, 91..=170) => BiomeId::Savanna,
            (141..=255, 171..=255) => BiomeId::Swamp,
            (_, 151..=255) => BiomeId::Forest,
            _ => BiomeId::Plains,
        }
    }

    /// Ground tile painted for this biome.
    pub fn ground_tile(self) -> TileId {
        match self {
            BiomeId::Ocean => TILE_WATER,
            BiomeId::Beach | BiomeId::Desert => TILE_SAND,
            BiomeId::Savanna => TILE_DIRT,
            BiomeId::Plains | BiomeId::Forest => TILE_GRASS,
            BiomeId::Swamp => TILE_MUD,
            BiomeId::Tundra => TILE_SNOW,
        }
    }

    /// Object scattered in this biome and its per-cell probability.
    pub fn scatter(self) -> (TileId, f64) {
        match self {
            BiomeId::Ocean | BiomeId::Beach => (TILE_EMPTY, 0.0),
            BiomeId::Desert => (TILE_CACTUS, 0.02),
            BiomeId::Savanna => (TILE_TREE, 0.03),
            BiomeId::Plains => (TILE_BOULDER, 0.01),
            BiomeId::Forest => (TILE_TREE, 0.25),
            BiomeId::Swamp => (TILE_TREE, 0.08),
            BiomeId::Tundra => (TILE_BOULDER, 0.04),
        }
    }
}

impl TryFrom<u8> for BiomeId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => BiomeId::Ocean,
            1 => BiomeId::Beach,
            2 => BiomeId::Desert,
            3 => BiomeId::Savanna,
            4 => BiomeId::Plains,
            5 => BiomeId::Forest,
            6 => BiomeId::Swamp,
            7 => BiomeId::Tundra,
            other => return Err(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_water_below_sea_level() {
        assert_eq!(BiomeId::classify(-0.8, 200, 200), BiomeId::Ocean);
        assert_eq!(BiomeId::classify(-0.12, 200, 200), BiomeId::Beach);
    }

    #[test]
    fn test_climate_bands() {
        assert_eq!(BiomeId::classify(0.3, 20, 100), BiomeId::Tundra);
        assert_eq!(BiomeId::classify(0.3, 220, 30), BiomeId::Desert);
        assert_eq!(BiomeId::classify(0.3, 220, 120), BiomeId::Savanna);
        assert_eq!(BiomeId::classify(0.3, 160, 220), BiomeId::Swamp);
        assert_eq!(BiomeId::classify(0.3, 100, 200), BiomeId::Forest);
        assert_eq!(BiomeId::classify(0.3, 100, 100), BiomeId::Plains);
    }

    #[test]
    fn test_discriminant_roundtrip() {
        for raw in 0u8..8 {
            let biome = BiomeId::try_from(raw).unwrap();
            assert_eq!(biome as u8, raw);
        }
        assert_eq!(BiomeId::try_from(8), Err(8));
    }
}
