use crate::error::WorldError;
use skylark_core::{ChunkPos, CHUNK_CELLS, CHUNK_SIZE};

/// Tile identifier stored in the ground and object layers.
pub type TileId = u16;

/// Reserved tile id for "nothing here" in the object layer.
pub const TILE_EMPTY: TileId = 0;

/// Addressable mutable layers of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Layer {
    /// Terrain surface tiles.
    Ground = 0,
    /// Objects placed on top of the terrain.
    Object = 1,
}

impl TryFrom<u8> for Layer {
    type Error = WorldError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Layer::Ground),
            1 => Ok(Layer::Object),
            other => Err(WorldError::UnknownLayer(other)),
        }
    }
}

/// Chunk-local cell coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalPos {
    /// Column within the chunk.
    pub x: u8,
    /// Row within the chunk.
    pub y: u8,
}

impl LocalPos {
    /// Create a local position. Bounds are checked on use, not here.
    pub const fn new(x: u8, y: u8) -> Self {
        Self { x, y }
    }

    /// Row-major cell index, or `OutOfBounds` when outside the chunk extent.
    pub fn index(self) -> Result<usize, WorldError> {
        let (x, y) = (self.x as usize, self.y as usize);
        if x >= CHUNK_SIZE || y >= CHUNK_SIZE {
            return Err(WorldError::OutOfBounds {
                x: self.x,
                y: self.y,
            });
        }
        Ok(y * CHUNK_SIZE + x)
    }
}

/// Fixed-size grids making up a chunk's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLayers {
    /// Ground tiles.
    pub ground: [TileId; CHUNK_CELLS],
    /// Object tiles (`TILE_EMPTY` where nothing is placed).
    pub object: [TileId; CHUNK_CELLS],
    /// Biome id per cell.
    pub biome: [u8; CHUNK_CELLS],
    /// Heat per cell (0 = frozen, 255 = scorching).
    pub heat: [u8; CHUNK_CELLS],
    /// Moisture per cell (0 = arid, 255 = saturated).
    pub moisture: [u8; CHUNK_CELLS],
}

impl Default for ChunkLayers {
    fn default() -> Self {
        Self {
            ground: [0; CHUNK_CELLS],
            object: [TILE_EMPTY; CHUNK_CELLS],
            biome: [0; CHUNK_CELLS],
            heat: [0; CHUNK_CELLS],
            moisture: [0; CHUNK_CELLS],
        }
    }
}

/// A 16x16 tile chunk.
///
/// The dirty flag is raised by every authoritative mutation and cleared by the
/// streaming service once observers have been sent the new content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    position: ChunkPos,
    layers: ChunkLayers,
    dirty: bool,
}

impl Chunk {
    /// Create an empty, clean chunk.
    pub fn new(position: ChunkPos) -> Self {
        Self::from_layers(position, ChunkLayers::default())
    }

    /// Wrap already-populated layers (generator output or a received snapshot).
    pub fn from_layers(position: ChunkPos, layers: ChunkLayers) -> Self {
        Self {
            position,
            layers,
            dirty: false,
        }
    }

    /// Chunk coordinate.
    pub fn position(&self) -> ChunkPos {
        self.position
    }

    /// Read-only access to all grids.
    pub fn layers(&self) -> &ChunkLayers {
        &self.layers
    }

    /// Read one tile.
    pub fn tile(&self, local: LocalPos, layer: Layer) -> Result<TileId, WorldError> {
        let index = local.index()?;
        Ok(match layer {
            Layer::Ground => self.layers.ground[index],
            Layer::Object => self.layers.object[index],
        })
    }

    /// Overwrite one tile of `layer` and mark the chunk dirty.
    ///
    /// Addressing a cell outside the chunk is a caller bug and is reported as
    /// `WorldError::OutOfBounds`; the chunk is left untouched in that case.
    pub fn set_block(
        &mut self,
        local: LocalPos,
        layer: Layer,
        value: TileId,
    ) -> Result<(), WorldError> {
        let index = local.index()?;
        let grid = match layer {
            Layer::Ground => &mut self.layers.ground,
            Layer::Object => &mut self.layers.object,
        };
        grid[index] = value;
        self.dirty = true;
        Ok(())
    }

    /// Whether the chunk changed since its last broadcast.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clear the dirty flag after a successful broadcast.
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_chunk_is_clean() {
        let chunk = Chunk::new(ChunkPos::new(1, -1));
        assert!(!chunk.is_dirty());
        assert_eq!(chunk.position(), ChunkPos::new(1, -1));
    }

    #[test]
    fn test_set_block_marks_dirty() {
        let mut chunk = Chunk::new(ChunkPos::new(0, 0));
        chunk
            .set_block(LocalPos::new(3, 4), Layer::Object, 42)
            .unwrap();

        assert!(chunk.is_dirty());
        assert_eq!(chunk.tile(LocalPos::new(3, 4), Layer::Object).unwrap(), 42);
        assert_eq!(chunk.layers().object[4 * CHUNK_SIZE + 3], 42);
        assert_eq!(chunk.tile(LocalPos::new(3, 4), Layer::Ground).unwrap(), 0);

        chunk.clear_dirty();
        assert!(!chunk.is_dirty());
    }

    #[test]
    fn test_set_block_out_of_bounds() {
        let mut chunk = Chunk::new(ChunkPos::new(0, 0));
        let err = chunk
            .set_block(LocalPos::new(16, 0), Layer::Ground, 1)
            .unwrap_err();
        assert_eq!(err, WorldError::OutOfBounds { x: 16, y: 0 });
        assert!(!chunk.is_dirty());

        assert!(chunk.set_block(LocalPos::new(0, 200), Layer::Ground, 1).is_err());
    }

    #[test]
    fn test_corner_cells_are_in_bounds() {
        assert_eq!(LocalPos::new(0, 0).index().unwrap(), 0);
        assert_eq!(LocalPos::new(15, 15).index().unwrap(), CHUNK_CELLS - 1);
    }

    #[test]
    fn test_layer_tags() {
        assert_eq!(Layer::try_from(0).unwrap(), Layer::Ground);
        assert_eq!(Layer::try_from(1).unwrap(), Layer::Object);
        assert_eq!(Layer::try_from(9), Err(WorldError::UnknownLayer(9)));
    }
}
