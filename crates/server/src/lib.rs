#![warn(missing_docs)]
//! Authoritative host: session, entity replication and chunk streaming wired
//! into one per-tick update.

mod chunk_interest;
pub mod multiplayer;
mod settings;

pub use chunk_interest::{chunk_message, ChunkInterestService};
pub use multiplayer::{MultiplayerServer, ServerWorld};
pub use settings::{ServerSettings, DEFAULT_WORLD_SEED};
