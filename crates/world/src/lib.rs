#![warn(missing_docs)]
//! Tile-chunk world data and the deterministic chunk generators.

mod biome;
mod chunk;
mod error;
mod generator;
mod noise;

pub use biome::*;
pub use chunk::*;
pub use error::*;
pub use generator::*;
pub use self::noise::*;
