//! Delivery channels a message kind can declare.

use crate::wire::WireError;

/// Channel type identifier carried alongside every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelType {
    /// Session control, spawns and despawns (reliable, ordered).
    Control = 0,
    /// Entity move batches (unreliable).
    EntityState = 1,
    /// Chunk subscriptions and chunk data (reliable, ordered).
    ChunkStream = 2,
}

impl ChannelType {
    /// Check if this channel type should use reliable delivery.
    pub fn is_reliable(&self) -> bool {
        matches!(self, ChannelType::Control | ChannelType::ChunkStream)
    }

    /// Check if this channel type should use unreliable delivery.
    pub fn is_unreliable(&self) -> bool {
        !self.is_reliable()
    }
}

impl TryFrom<u8> for ChannelType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ChannelType::Control),
            1 => Ok(ChannelType::EntityState),
            2 => Ok(ChannelType::ChunkStream),
            tag => Err(WireError::UnknownTag {
                what: "channel",
                tag,
            }),
        }
    }
}
