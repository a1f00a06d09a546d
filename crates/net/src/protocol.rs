//! Protocol message definitions for client-server communication.
//!
//! Each kind writes its own payload through [`WireWriter`]; the connection
//! handshake is the one exception and travels as a `postcard` blob inside the
//! transport's approval request.

use crate::channel::ChannelType;
use crate::registry::{MessageRegistry, NetMessage};
use crate::wire::{WireError, WireReader, WireWriter};
use serde::{Deserialize, Serialize};
use skylark_core::{ChunkPos, EntityId, PeerId, Vec2, CHUNK_CELLS};

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u16 = 1;

/// Maximum display name length (bytes).
pub const MAX_NAME_LEN: usize = 32;

/// Maximum number of moves accepted in one batch.
pub const MAX_MOVES_PER_BATCH: usize = 4096;

/// Connection request carried by the transport's approval event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Handshake {
    /// Protocol version the client was built with.
    pub protocol_version: u16,
    /// Schema hash of the client's message registry.
    pub schema_hash: u64,
    /// Identity the peer declares for itself.
    pub peer_id: PeerId,
    /// Human-readable name.
    pub display_name: String,
}

impl Handshake {
    /// Build a handshake for the current protocol version.
    pub fn new(schema_hash: u64, peer_id: PeerId, display_name: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            schema_hash,
            peer_id,
            display_name: display_name.into(),
        }
    }

    /// Serialize for the approval payload.
    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Parse an approval payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

fn put_vec2(w: &mut WireWriter, v: Vec2) {
    w.put_f32(v.x);
    w.put_f32(v.y);
}

fn get_vec2(r: &mut WireReader<'_>) -> Result<Vec2, WireError> {
    Ok(Vec2::new(r.get_f32()?, r.get_f32()?))
}

fn put_chunk_pos(w: &mut WireWriter, pos: ChunkPos) {
    w.put_i32(pos.x);
    w.put_i32(pos.y);
}

fn get_chunk_pos(r: &mut WireReader<'_>) -> Result<ChunkPos, WireError> {
    Ok(ChunkPos::new(r.get_i32()?, r.get_i32()?))
}

/// Sent by the server once a peer is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Welcome {
    /// Identity the server registered the peer under.
    pub peer_id: PeerId,
    /// Entity the peer controls.
    pub player_entity: EntityId,
}

impl NetMessage for Welcome {
    const NAME: &'static str = "skylark::protocol::Welcome";
    const CHANNEL: ChannelType = ChannelType::Control;

    fn write(&self, w: &mut WireWriter) {
        w.put_u64(self.peer_id.0);
        w.put_u64(self.player_entity);
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            peer_id: PeerId(r.get_u64()?),
            player_entity: r.get_u64()?,
        })
    }
}

/// Kind-specific entity data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityKind {
    /// A participant's avatar.
    Player {
        /// Display name shown above the avatar.
        name: String,
    },
    /// A world creature.
    Mob {
        /// Species identifier.
        species: u16,
        /// Current health.
        health: u16,
    },
}

impl EntityKind {
    const PLAYER_TAG: u8 = 0;
    const MOB_TAG: u8 = 1;

    fn write(&self, w: &mut WireWriter) {
        match self {
            EntityKind::Player { name } => {
                w.put_u8(Self::PLAYER_TAG);
                w.put_str(name);
            }
            EntityKind::Mob { species, health } => {
                w.put_u8(Self::MOB_TAG);
                w.put_u16(*species);
                w.put_u16(*health);
            }
        }
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        match r.get_u8()? {
            Self::PLAYER_TAG => Ok(EntityKind::Player {
                name: r.get_str(MAX_NAME_LEN)?,
            }),
            Self::MOB_TAG => Ok(EntityKind::Mob {
                species: r.get_u16()?,
                health: r.get_u16()?,
            }),
            tag => Err(WireError::UnknownTag {
                what: "entity kind",
                tag,
            }),
        }
    }
}

/// Announces a new entity.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnEntity {
    /// Entity id.
    pub entity_id: EntityId,
    /// Owning peer (`PeerId::WORLD` for server-owned).
    pub owner: PeerId,
    /// Kind and kind-specific payload.
    pub kind: EntityKind,
    /// Spawn position.
    pub position: Vec2,
}

impl NetMessage for SpawnEntity {
    const NAME: &'static str = "skylark::protocol::SpawnEntity";
    const CHANNEL: ChannelType = ChannelType::Control;

    fn write(&self, w: &mut WireWriter) {
        w.put_u64(self.entity_id);
        w.put_u64(self.owner.0);
        self.kind.write(w);
        put_vec2(w, self.position);
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            entity_id: r.get_u64()?,
            owner: PeerId(r.get_u64()?),
            kind: EntityKind::read(r)?,
            position: get_vec2(r)?,
        })
    }
}

/// Removes an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DespawnEntity {
    /// Entity id.
    pub entity_id: EntityId,
}

impl NetMessage for DespawnEntity {
    const NAME: &'static str = "skylark::protocol::DespawnEntity";
    const CHANNEL: ChannelType = ChannelType::Control;

    fn write(&self, w: &mut WireWriter) {
        w.put_u64(self.entity_id);
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            entity_id: r.get_u64()?,
        })
    }
}

/// One entry of a [`MoveBatch`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityMove {
    /// Entity id.
    pub entity_id: EntityId,
    /// New position.
    pub position: Vec2,
}

/// Positions of every entity that moved since the last send window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MoveBatch {
    /// Moved entities.
    pub moves: Vec<EntityMove>,
}

impl MoveBatch {
    /// Whether the batch carries no moves.
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }
}

impl NetMessage for MoveBatch {
    const NAME: &'static str = "skylark::protocol::MoveBatch";
    const CHANNEL: ChannelType = ChannelType::EntityState;

    fn write(&self, w: &mut WireWriter) {
        w.put_varint(self.moves.len() as u64);
        for m in &self.moves {
            w.put_u64(m.entity_id);
            put_vec2(w, m.position);
        }
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let count = r.get_count(MAX_MOVES_PER_BATCH)?;
        let mut moves = Vec::with_capacity(count);
        for _ in 0..count {
            moves.push(EntityMove {
                entity_id: r.get_u64()?,
                position: get_vec2(r)?,
            });
        }
        Ok(Self { moves })
    }
}

/// Client asks to observe a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSubscribe {
    /// Chunk coordinate.
    pub position: ChunkPos,
}

impl NetMessage for ChunkSubscribe {
    const NAME: &'static str = "skylark::protocol::ChunkSubscribe";
    const CHANNEL: ChannelType = ChannelType::ChunkStream;

    fn write(&self, w: &mut WireWriter) {
        put_chunk_pos(w, self.position);
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            position: get_chunk_pos(r)?,
        })
    }
}

/// Client stops observing a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkUnsubscribe {
    /// Chunk coordinate.
    pub position: ChunkPos,
}

impl NetMessage for ChunkUnsubscribe {
    const NAME: &'static str = "skylark::protocol::ChunkUnsubscribe";
    const CHANNEL: ChannelType = ChannelType::ChunkStream;

    fn write(&self, w: &mut WireWriter) {
        put_chunk_pos(w, self.position);
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            position: get_chunk_pos(r)?,
        })
    }
}

/// Full contents of one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkData {
    /// Chunk coordinate.
    pub position: ChunkPos,
    /// Ground tiles.
    pub ground: [u16; CHUNK_CELLS],
    /// Object tiles.
    pub object: [u16; CHUNK_CELLS],
    /// Biome ids.
    pub biome: [u8; CHUNK_CELLS],
    /// Heat values.
    pub heat: [u8; CHUNK_CELLS],
    /// Moisture values.
    pub moisture: [u8; CHUNK_CELLS],
}

impl ChunkData {
    /// Encoded payload size.
    pub const ENCODED_LEN: usize = 8 + CHUNK_CELLS * (2 + 2 + 1 + 1 + 1);
}

impl NetMessage for ChunkData {
    const NAME: &'static str = "skylark::protocol::ChunkData";
    const CHANNEL: ChannelType = ChannelType::ChunkStream;

    fn write(&self, w: &mut WireWriter) {
        put_chunk_pos(w, self.position);
        for &tile in &self.ground {
            w.put_u16(tile);
        }
        for &tile in &self.object {
            w.put_u16(tile);
        }
        w.put_bytes(&self.biome);
        w.put_bytes(&self.heat);
        w.put_bytes(&self.moisture);
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let position = get_chunk_pos(r)?;
        let mut ground = [0u16; CHUNK_CELLS];
        for tile in ground.iter_mut() {
            *tile = r.get_u16()?;
        }
        let mut object = [0u16; CHUNK_CELLS];
        for tile in object.iter_mut() {
            *tile = r.get_u16()?;
        }
        let mut biome = [0u8; CHUNK_CELLS];
        biome.copy_from_slice(r.get_bytes(CHUNK_CELLS)?);
        let mut heat = [0u8; CHUNK_CELLS];
        heat.copy_from_slice(r.get_bytes(CHUNK_CELLS)?);
        let mut moisture = [0u8; CHUNK_CELLS];
        moisture.copy_from_slice(r.get_bytes(CHUNK_CELLS)?);
        Ok(Self {
            position,
            ground,
            object,
            biome,
            heat,
            moisture,
        })
    }
}

/// Client request to change one cell of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEdit {
    /// Target chunk.
    pub chunk: ChunkPos,
    /// Cell X within the chunk.
    pub x: u8,
    /// Cell Y within the chunk.
    pub y: u8,
    /// Layer tag (0 = ground, 1 = object).
    pub layer: u8,
    /// New tile id.
    pub value: u16,
}

impl NetMessage for BlockEdit {
    const NAME: &'static str = "skylark::protocol::BlockEdit";
    const CHANNEL: ChannelType = ChannelType::ChunkStream;

    fn write(&self, w: &mut WireWriter) {
        put_chunk_pos(w, self.chunk);
        w.put_u8(self.x);
        w.put_u8(self.y);
        w.put_u8(self.layer);
        w.put_u16(self.value);
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            chunk: get_chunk_pos(r)?,
            x: r.get_u8()?,
            y: r.get_u8()?,
            layer: r.get_u8()?,
            value: r.get_u16()?,
        })
    }
}

/// Register every protocol kind. Returns the number of kinds that registered
/// cleanly.
pub fn register_protocol(registry: &mut MessageRegistry) -> usize {
    [
        registry.register::<Welcome>(),
        registry.register::<SpawnEntity>(),
        registry.register::<DespawnEntity>(),
        registry.register::<MoveBatch>(),
        registry.register::<ChunkSubscribe>(),
        registry.register::<ChunkUnsubscribe>(),
        registry.register::<ChunkData>(),
        registry.register::<BlockEdit>(),
    ]
    .iter()
    .filter(|id| id.is_some())
    .count()
}

/// A registry holding the full protocol.
pub fn protocol_registry() -> MessageRegistry {
    let mut registry = MessageRegistry::new();
    register_protocol(&mut registry);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::split_envelope;

    fn reencode<T: NetMessage + std::fmt::Debug + PartialEq>(registry: &MessageRegistry, msg: &T) {
        let envelope = registry.encode(msg).unwrap();
        let (id, payload) = split_envelope(&envelope.bytes).unwrap();
        let decoded = registry.decode(id, payload).unwrap().unwrap();
        assert_eq!(decoded.downcast_ref::<T>(), Some(msg));
    }

    #[test]
    fn test_protocol_registers_without_collisions() {
        let registry = protocol_registry();
        assert_eq!(registry.len(), 8);
    }

    #[test]
    fn test_move_batch_layout() {
        let batch = MoveBatch {
            moves: vec![EntityMove {
                entity_id: 1,
                position: Vec2::new(5.0, 0.0),
            }],
        };
        let mut w = WireWriter::new();
        batch.write(&mut w);
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), 1 + 8 + 4 + 4);
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..9], &1u64.to_le_bytes());
        assert_eq!(&bytes[9..13], &5.0f32.to_le_bytes());
    }

    #[test]
    fn test_chunk_data_layout() {
        let mut data = ChunkData {
            position: ChunkPos::new(2, 3),
            ground: [3; CHUNK_CELLS],
            object: [0; CHUNK_CELLS],
            biome: [4; CHUNK_CELLS],
            heat: [128; CHUNK_CELLS],
            moisture: [64; CHUNK_CELLS],
        };
        data.object[17] = 16;

        let mut w = WireWriter::new();
        data.write(&mut w);
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), ChunkData::ENCODED_LEN);
        assert_eq!(&bytes[0..4], &2i32.to_le_bytes());
        assert_eq!(&bytes[4..8], &3i32.to_le_bytes());

        reencode(&protocol_registry(), &data);
    }

    #[test]
    fn test_spawn_carries_kind_payload() {
        let registry = protocol_registry();
        reencode(
            &registry,
            &SpawnEntity {
                entity_id: 9,
                owner: PeerId(2),
                kind: EntityKind::Player {
                    name: "ada".into(),
                },
                position: Vec2::new(1.0, -2.0),
            },
        );
        reencode(
            &registry,
            &SpawnEntity {
                entity_id: 10,
                owner: PeerId::WORLD,
                kind: EntityKind::Mob {
                    species: 3,
                    health: 20,
                },
                position: Vec2::ZERO,
            },
        );
    }

    #[test]
    fn test_unknown_entity_kind_tag_rejected() {
        let mut w = WireWriter::new();
        w.put_u64(1);
        w.put_u64(0);
        w.put_u8(9);
        let bytes = w.into_bytes();
        let err = SpawnEntity::read(&mut WireReader::new(&bytes)).unwrap_err();
        assert!(matches!(err, WireError::UnknownTag { tag: 9, .. }));
    }

    #[test]
    fn test_move_batch_count_limit() {
        let mut w = WireWriter::new();
        w.put_varint(MAX_MOVES_PER_BATCH as u64 + 1);
        let bytes = w.into_bytes();
        assert!(matches!(
            MoveBatch::read(&mut WireReader::new(&bytes)),
            Err(WireError::LengthLimit { .. })
        ));
    }

    #[test]
    fn test_handshake_postcard() {
        let hs = Handshake::new(0xABCD, PeerId(5), "bob");
        let bytes = hs.encode().unwrap();
        assert_eq!(Handshake::decode(&bytes).unwrap(), hs);
        assert!(Handshake::decode(&[0xFF]).is_err());
    }
}
