//! Outbound message queue flushed once per tick.

use crate::codec::Envelope;
use crate::error::NetError;
use crate::registry::{MessageRegistry, NetMessage};
use skylark_core::PeerId;
use std::sync::Arc;
use tracing::trace;

/// Addressing of one queued envelope, resolved against the roster at flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    /// A single peer.
    One(PeerId),
    /// An explicit set.
    Many(Vec<PeerId>),
    /// Every connected peer.
    All,
    /// Every connected peer except one.
    AllExcept(PeerId),
}

/// Envelopes waiting for the end-of-tick flush.
pub struct Outbox {
    registry: Arc<MessageRegistry>,
    queued: Vec<(Recipients, Envelope)>,
}

impl Outbox {
    /// Create an empty outbox encoding through `registry`.
    pub fn new(registry: Arc<MessageRegistry>) -> Self {
        Self {
            registry,
            queued: Vec::new(),
        }
    }

    fn push<T: NetMessage>(&mut self, to: Recipients, message: &T) -> Result<(), NetError> {
        let envelope = self.registry.encode(message)?;
        trace!(kind = T::NAME, ?to, len = envelope.bytes.len(), "queued message");
        self.queued.push((to, envelope));
        Ok(())
    }

    /// Queue `message` for one peer.
    pub fn send<T: NetMessage>(&mut self, peer: PeerId, message: &T) -> Result<(), NetError> {
        self.push(Recipients::One(peer), message)
    }

    /// Queue `message` for a set of peers. An empty set queues nothing.
    pub fn send_many<T: NetMessage>(
        &mut self,
        peers: impl IntoIterator<Item = PeerId>,
        message: &T,
    ) -> Result<(), NetError> {
        let peers: Vec<PeerId> = peers.into_iter().collect();
        if peers.is_empty() {
            return Ok(());
        }
        self.push(Recipients::Many(peers), message)
    }

    /// Queue `message` for every connected peer.
    pub fn broadcast<T: NetMessage>(&mut self, message: &T) -> Result<(), NetError> {
        self.push(Recipients::All, message)
    }

    /// Queue `message` for every connected peer but `except`.
    pub fn broadcast_except<T: NetMessage>(
        &mut self,
        except: PeerId,
        message: &T,
    ) -> Result<(), NetError> {
        self.push(Recipients::AllExcept(except), message)
    }

    /// Discard everything addressed solely to `peer`, and strip it from
    /// explicit recipient sets.
    pub fn forget_peer(&mut self, peer: PeerId) {
        self.queued.retain_mut(|(to, _)| match to {
            Recipients::One(id) => *id != peer,
            Recipients::Many(ids) => {
                ids.retain(|id| *id != peer);
                !ids.is_empty()
            }
            Recipients::All | Recipients::AllExcept(_) => true,
        });
    }

    /// Take every queued envelope in enqueue order.
    pub fn drain(&mut self) -> Vec<(Recipients, Envelope)> {
        std::mem::take(&mut self.queued)
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.queued.clear();
    }

    /// Number of queued envelopes.
    pub fn len(&self) -> usize {
        self.queued.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Registry used for encoding.
    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.registry
    }
}
