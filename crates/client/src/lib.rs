#![warn(missing_docs)]
//! Client host: mirrors server entities, drives the local player and caches
//! streamed chunks.

pub mod multiplayer;

pub use multiplayer::{ClientWorld, MultiplayerClient};
