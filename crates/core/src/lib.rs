#![warn(missing_docs)]
//! Core primitives shared across the workspace.

use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub use glam::Vec2;

/// Edge length of a chunk in cells.
pub const CHUNK_SIZE: usize = 16;

/// Number of cells in one chunk layer (16 x 16).
pub const CHUNK_CELLS: usize = CHUNK_SIZE * CHUNK_SIZE;

/// Entity identifier, unique and stable for the entity's lifetime.
pub type EntityId = u64;

/// Stable numeric identity of a participant.
///
/// `PeerId::WORLD` (0) denotes the server itself and any world-owned entity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct PeerId(pub u64);

impl PeerId {
    /// The authoritative server / world owner.
    pub const WORLD: Self = Self(0);

    /// Whether this identity refers to the server / world.
    pub fn is_world(self) -> bool {
        self == Self::WORLD
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_world() {
            write!(f, "world")
        } else {
            write!(f, "peer#{}", self.0)
        }
    }
}

/// Integer coordinate of a chunk in chunk space.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ChunkPos {
    /// Chunk X coordinate.
    pub x: i32,
    /// Chunk Y coordinate.
    pub y: i32,
}

impl ChunkPos {
    /// Create a chunk position.
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Chunk containing the given world-space position.
    pub fn containing(position: Vec2) -> Self {
        let size = CHUNK_SIZE as f32;
        Self {
            x: (position.x / size).floor() as i32,
            y: (position.y / size).floor() as i32,
        }
    }

    /// Stable 64-bit mix of the coordinate, used to seed per-chunk RNGs.
    pub fn hash64(self) -> u64 {
        let x = self.x as u32 as u64;
        let y = self.y as u32 as u64;
        ((x << 32) | y).wrapping_mul(0x9E37_79B9_7F4A_7C15)
    }
}

impl fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Simulation clock reading in milliseconds since the session started.
///
/// Kept as `f64` so render-delayed times may go negative early in a session.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize, Default)]
pub struct SimTime(pub f64);

impl SimTime {
    /// Session start.
    pub const ZERO: Self = Self(0.0);

    /// Construct from milliseconds.
    pub const fn from_millis(ms: f64) -> Self {
        Self(ms)
    }

    /// Milliseconds since session start.
    pub fn as_millis(self) -> f64 {
        self.0
    }

    /// Advance by a wall-clock delta.
    pub fn advance(self, delta: Duration) -> Self {
        Self(self.0 + delta.as_secs_f64() * 1000.0)
    }

    /// Shift by a signed number of milliseconds.
    pub fn offset(self, ms: f64) -> Self {
        Self(self.0 + ms)
    }

    /// Milliseconds elapsed since `earlier` (negative if `earlier` is in the future).
    pub fn since(self, earlier: SimTime) -> f64 {
        self.0 - earlier.0
    }
}

/// Helper to derive a reproducible RNG seeded by world + chunk domains.
pub fn scoped_rng(world_seed: u64, chunk: ChunkPos) -> StdRng {
    StdRng::seed_from_u64(world_seed ^ chunk.hash64())
}
