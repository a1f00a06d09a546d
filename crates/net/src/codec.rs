//! Envelope framing and identifier hashing.
//!
//! Envelope format: `[message_id: u32 LE][payload: bytes]`. Framing of the
//! envelope itself (stream length prefixes, datagrams) belongs to the transport.

use crate::channel::ChannelType;
use crate::protocol::PROTOCOL_VERSION;
use crate::wire::WireError;

/// Stable numeric id of a registered message kind.
pub type MessageId = u32;

/// Size of the id header in front of every payload.
pub const ENVELOPE_HEADER_LEN: usize = 4;

/// Derive the message id for a kind from its qualified name.
///
/// CRC-32 (IEEE) of the UTF-8 name: stable across builds and platforms.
pub fn kind_id(qualified_name: &str) -> MessageId {
    crc32fast::hash(qualified_name.as_bytes())
}

/// Fingerprint of a registry's kind table, exchanged during the handshake so
/// peers built with different message sets refuse each other up front.
pub fn compute_schema_hash<'a, I>(kinds: I) -> u64
where
    I: IntoIterator<Item = (MessageId, &'a str)>,
{
    let mut hasher = blake3::Hasher::new();
    hasher.update(&PROTOCOL_VERSION.to_le_bytes());

    let mut kinds: Vec<_> = kinds.into_iter().collect();
    kinds.sort_unstable();
    for (id, name) in kinds {
        hasher.update(&id.to_le_bytes());
        hasher.update(name.as_bytes());
        hasher.update(&[0]);
    }

    let hash = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(head)
}

/// An encoded message ready to hand to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Message id.
    pub id: MessageId,
    /// Channel the kind declared.
    pub channel: ChannelType,
    /// Full envelope bytes (id header + payload).
    pub bytes: Vec<u8>,
}

/// Prefix `payload` with its message id.
pub fn encode_envelope(id: MessageId, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ENVELOPE_HEADER_LEN + payload.len());
    frame.extend_from_slice(&id.to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Split an envelope into its id and payload.
pub fn split_envelope(data: &[u8]) -> Result<(MessageId, &[u8]), WireError> {
    if data.len() < ENVELOPE_HEADER_LEN {
        return Err(WireError::UnexpectedEof {
            needed: ENVELOPE_HEADER_LEN,
            remaining: data.len(),
        });
    }
    let id = MessageId::from_le_bytes([data[0], data[1], data[2], data[3]]);
    Ok((id, &data[ENVELOPE_HEADER_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_id_deterministic() {
        let batch = "skylark::protocol::MoveBatch";
        assert_eq!(kind_id(batch), kind_id(batch));
        assert_ne!(kind_id(batch), kind_id("skylark::protocol::ChunkData"));
        // CRC-32/IEEE check value.
        assert_eq!(kind_id("123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_schema_hash_ignores_registration_order() {
        let a = compute_schema_hash([(1, "a"), (2, "b")]);
        let b = compute_schema_hash([(2, "b"), (1, "a")]);
        let c = compute_schema_hash([(1, "a")]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_envelope_layout() {
        let frame = encode_envelope(0x0403_0201, &[9, 9]);
        assert_eq!(frame, vec![1, 2, 3, 4, 9, 9]);

        let (id, payload) = split_envelope(&frame).unwrap();
        assert_eq!(id, 0x0403_0201);
        assert_eq!(payload, &[9, 9]);
    }

    #[test]
    fn test_split_too_short() {
        assert!(split_envelope(&[1, 2, 3]).is_err());
        let (_, payload) = split_envelope(&[1, 2, 3, 4]).unwrap();
        assert!(payload.is_empty());
    }
}
