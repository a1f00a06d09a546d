//! Connected peers and the server-side roster.

use crate::error::NetError;
use crate::transport::ConnectionId;
use skylark_core::PeerId;
use std::collections::{BTreeMap, HashMap};

/// Lifecycle of a peer on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Approved, waiting for the transport to report the connection.
    Pending,
    /// Live.
    Connected,
    /// Gone; must never be sent to.
    Disconnected,
}

/// One remote participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Stable identity.
    pub id: PeerId,
    /// Display name from the handshake.
    pub name: String,
    /// Live transport handle; `None` once disconnected.
    pub connection: Option<ConnectionId>,
    /// Lifecycle state.
    pub state: PeerState,
}

impl Peer {
    /// A peer awaiting its `Connected` event.
    pub fn pending(id: PeerId, name: impl Into<String>, connection: ConnectionId) -> Self {
        Self {
            id,
            name: name.into(),
            connection: Some(connection),
            state: PeerState::Pending,
        }
    }

    /// Whether the peer can be sent to.
    pub fn is_connected(&self) -> bool {
        self.state == PeerState::Connected && self.connection.is_some()
    }

    /// Mark the peer gone and drop its connection handle.
    pub fn mark_disconnected(&mut self) {
        self.state = PeerState::Disconnected;
        self.connection = None;
    }
}

/// Connected peers, iterated in identity order.
#[derive(Debug, Default)]
pub struct PeerRoster {
    peers: BTreeMap<PeerId, Peer>,
    by_connection: HashMap<ConnectionId, PeerId>,
}

impl PeerRoster {
    /// Create an empty roster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connected peer, replacing any previous entry with the same id.
    pub fn insert(&mut self, peer: Peer) {
        if let Some(old) = self.peers.remove(&peer.id) {
            if let Some(conn) = old.connection {
                self.by_connection.remove(&conn);
            }
        }
        if let Some(conn) = peer.connection {
            self.by_connection.insert(conn, peer.id);
        }
        self.peers.insert(peer.id, peer);
    }

    /// Look up a peer.
    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    /// Whether `id` is in the roster.
    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    /// Peer owning `connection`.
    pub fn by_connection(&self, connection: ConnectionId) -> Option<&Peer> {
        self.by_connection
            .get(&connection)
            .and_then(|id| self.peers.get(id))
    }

    /// Remove and return the peer owning `connection`, marked disconnected.
    pub fn remove_by_connection(&mut self, connection: ConnectionId) -> Option<Peer> {
        let id = self.by_connection.remove(&connection)?;
        let mut peer = self.peers.remove(&id)?;
        peer.mark_disconnected();
        Some(peer)
    }

    /// Live connection of `id`.
    pub fn connection_of(&self, id: PeerId) -> Result<ConnectionId, NetError> {
        self.peers
            .get(&id)
            .filter(|peer| peer.is_connected())
            .and_then(|peer| peer.connection)
            .ok_or(NetError::NoConnection(id))
    }

    /// Identities in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers.keys().copied()
    }

    /// Peers in identity order.
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Number of peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the roster is empty.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
