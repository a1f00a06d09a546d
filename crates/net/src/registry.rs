//! Message kind registry.
//!
//! Maps message kinds to stable ids and to the decode routine for each id. One
//! registry is built at startup and shared (`Arc`) by every session, so several
//! isolated sessions can coexist in one process.

use crate::channel::ChannelType;
use crate::codec::{compute_schema_hash, encode_envelope, kind_id, Envelope, MessageId};
use crate::error::NetError;
use crate::wire::{WireError, WireReader, WireWriter};
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// A message kind: knows its qualified name, its delivery channel, and how to
/// write itself to and read itself from a binary cursor.
pub trait NetMessage: Sized + 'static {
    /// Fully-qualified kind name; the message id is derived from it.
    const NAME: &'static str;

    /// Channel this kind travels on.
    const CHANNEL: ChannelType;

    /// Serialize the payload.
    fn write(&self, writer: &mut WireWriter);

    /// Deserialize the payload.
    fn read(reader: &mut WireReader<'_>) -> Result<Self, WireError>;
}

/// Hash from qualified name to message id.
pub type KindHasher = fn(&str) -> MessageId;

/// Decode routine stored per id; the factory that replaces reflective construction.
type DecodeFn = fn(&[u8]) -> Result<Box<dyn Any>, WireError>;

struct KindEntry {
    name: &'static str,
    type_id: TypeId,
    channel: ChannelType,
    decode: DecodeFn,
}

fn decode_boxed<T: NetMessage>(payload: &[u8]) -> Result<Box<dyn Any>, WireError> {
    let mut reader = WireReader::new(payload);
    let message = T::read(&mut reader)?;
    reader.finish()?;
    Ok(Box::new(message))
}

/// Registry of message kinds keyed by id and by Rust type.
pub struct MessageRegistry {
    kinds: BTreeMap<MessageId, KindEntry>,
    ids: HashMap<TypeId, MessageId>,
    hasher: KindHasher,
}

impl MessageRegistry {
    /// Create an empty registry using the default name hash.
    pub fn new() -> Self {
        Self::with_hasher(kind_id)
    }

    /// Create an empty registry with a custom name hash.
    pub fn with_hasher(hasher: KindHasher) -> Self {
        Self {
            kinds: BTreeMap::new(),
            ids: HashMap::new(),
            hasher,
        }
    }

    /// Register kind `T`.
    ///
    /// Returns the assigned id, or `None` when the id already belongs to a
    /// different kind. A conflict is logged and the first registration is kept.
    pub fn register<T: NetMessage>(&mut self) -> Option<MessageId> {
        let id = (self.hasher)(T::NAME);
        let type_id = TypeId::of::<T>();

        if let Some(existing) = self.kinds.get(&id) {
            if existing.type_id == type_id {
                return Some(id);
            }
            warn!(
                message_id = id,
                registered = existing.name,
                rejected = T::NAME,
                "message kind id collision; keeping the first registration"
            );
            return None;
        }

        self.kinds.insert(
            id,
            KindEntry {
                name: T::NAME,
                type_id,
                channel: T::CHANNEL,
                decode: decode_boxed::<T>,
            },
        );
        self.ids.insert(type_id, id);
        debug!(message_id = id, kind = T::NAME, "registered message kind");
        Some(id)
    }

    /// Id assigned to `T`, if registered.
    pub fn id_of<T: NetMessage>(&self) -> Option<MessageId> {
        self.ids.get(&TypeId::of::<T>()).copied()
    }

    /// Whether `id` names a registered kind.
    pub fn contains(&self, id: MessageId) -> bool {
        self.kinds.contains_key(&id)
    }

    /// Qualified name registered under `id`.
    pub fn name_of(&self, id: MessageId) -> Option<&'static str> {
        self.kinds.get(&id).map(|entry| entry.name)
    }

    /// Channel declared by the kind registered under `id`.
    pub fn channel_of(&self, id: MessageId) -> Option<ChannelType> {
        self.kinds.get(&id).map(|entry| entry.channel)
    }

    /// Number of registered kinds.
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Whether no kinds are registered.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Decode a payload with the routine registered for `id`.
    ///
    /// Returns `None` for unknown ids.
    pub fn decode(&self, id: MessageId, payload: &[u8]) -> Option<Result<Box<dyn Any>, WireError>> {
        self.kinds.get(&id).map(|entry| (entry.decode)(payload))
    }

    /// Encode `message` into an envelope.
    ///
    /// Fails only if `T` was never registered, which is a startup bug.
    pub fn encode<T: NetMessage>(&self, message: &T) -> Result<Envelope, NetError> {
        let id = self
            .id_of::<T>()
            .ok_or(NetError::UnregisteredKind(T::NAME))?;
        let mut writer = WireWriter::new();
        message.write(&mut writer);
        Ok(Envelope {
            id,
            channel: T::CHANNEL,
            bytes: encode_envelope(id, &writer.into_bytes()),
        })
    }

    /// Fingerprint of the registered kind table.
    pub fn schema_hash(&self) -> u64 {
        compute_schema_hash(self.kinds.iter().map(|(id, entry)| (*id, entry.name)))
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}
