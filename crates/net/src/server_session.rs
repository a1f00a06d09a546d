//! Server-side network session.
//!
//! Owns the transport and the peer roster, admits peers through the handshake,
//! routes inbound envelopes to the dispatcher, and flushes the outbox.

use crate::codec::split_envelope;
use crate::config::SessionConfig;
use crate::dispatcher::{Dispatcher, MessageContext};
use crate::error::{NetError, TransportError};
use crate::outbox::{Outbox, Recipients};
use crate::peer::{Peer, PeerRoster, PeerState};
use crate::protocol::{Handshake, MAX_NAME_LEN, PROTOCOL_VERSION};
use crate::registry::MessageRegistry;
use crate::transport::{ConnectionId, ServerTransport, TransportEvent};
use skylark_core::{PeerId, SimTime};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Why a connection request was refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DenyReason {
    /// The session does not accept remote peers.
    #[error("server is in single-player mode")]
    SinglePlayer,
    /// The handshake payload did not decode.
    #[error("malformed handshake: {0}")]
    MalformedHandshake(String),
    /// Protocol version differs.
    #[error("protocol version mismatch: server {server}, client {client}")]
    ProtocolMismatch {
        /// Server version.
        server: u16,
        /// Client version.
        client: u16,
    },
    /// Message tables differ.
    #[error("schema hash mismatch: server {server:#x}, client {client:#x}")]
    SchemaMismatch {
        /// Server hash.
        server: u64,
        /// Client hash.
        client: u64,
    },
    /// Peer id 0 belongs to the server.
    #[error("peer id 0 is reserved for the world")]
    ReservedPeerId,
    /// Empty or oversized display name.
    #[error("invalid display name")]
    InvalidName,
    /// The id is already connected or pending.
    #[error("peer {0} is already connected")]
    DuplicatePeer(PeerId),
    /// `max_peers` reached.
    #[error("server is full")]
    ServerFull,
}

/// Notifications the session raises into host state.
pub trait ServerHooks {
    /// A peer finished connecting and is in the roster.
    fn on_peer_connected(
        &mut self,
        _peer: &Peer,
        _outbox: &mut Outbox,
        _now: SimTime,
    ) -> Result<(), NetError> {
        Ok(())
    }

    /// A connected peer left; it is already out of the roster.
    fn on_peer_disconnected(
        &mut self,
        _peer: &Peer,
        _outbox: &mut Outbox,
        _now: SimTime,
    ) -> Result<(), NetError> {
        Ok(())
    }
}

impl ServerHooks for () {}

/// Server session over one transport.
pub struct ServerSession<C> {
    transport: Box<dyn ServerTransport>,
    dispatcher: Dispatcher<C>,
    roster: PeerRoster,
    pending: HashMap<ConnectionId, Peer>,
    outbox: Outbox,
    config: SessionConfig,
    schema_hash: u64,
}

impl<C: ServerHooks + 'static> ServerSession<C> {
    /// Create a session. The registry must be fully populated.
    pub fn new(
        registry: Arc<MessageRegistry>,
        transport: Box<dyn ServerTransport>,
        config: SessionConfig,
    ) -> Self {
        let schema_hash = registry.schema_hash();
        Self {
            transport,
            dispatcher: Dispatcher::new(registry.clone()),
            roster: PeerRoster::new(),
            pending: HashMap::new(),
            outbox: Outbox::new(registry),
            config,
            schema_hash,
        }
    }

    /// Handler table.
    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher<C> {
        &mut self.dispatcher
    }

    /// Connected peers.
    pub fn roster(&self) -> &PeerRoster {
        &self.roster
    }

    /// Queue for outbound messages.
    pub fn outbox_mut(&mut self) -> &mut Outbox {
        &mut self.outbox
    }

    /// Number of approved peers still waiting for their connection.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Schema hash clients must present.
    pub fn schema_hash(&self) -> u64 {
        self.schema_hash
    }

    /// Drain every queued transport event in arrival order.
    ///
    /// Events produced while handling an event (for example the `Connected`
    /// that follows an approval) are drained in the same call. Returns the
    /// number of events handled.
    pub fn poll(&mut self, state: &mut C, now: SimTime) -> Result<usize, NetError> {
        let mut handled = 0;
        while let Some(event) = self.transport.poll_event() {
            handled += 1;
            match event {
                TransportEvent::ConnectionApprovalRequested {
                    connection,
                    payload,
                } => self.handle_approval(connection, &payload),
                TransportEvent::Connected { connection } => {
                    self.handle_connected(state, connection, now)?
                }
                TransportEvent::Disconnected { connection } => {
                    self.handle_disconnected(state, connection, now)?
                }
                TransportEvent::DataReceived {
                    connection,
                    payload,
                    ..
                } => self.handle_data(state, connection, &payload, now),
            }
        }
        Ok(handled)
    }

    /// Decide whether a handshake is admissible.
    pub fn evaluate_handshake(&self, payload: &[u8]) -> Result<Handshake, DenyReason> {
        if self.config.single_player {
            return Err(DenyReason::SinglePlayer);
        }
        let handshake = Handshake::decode(payload)
            .map_err(|e| DenyReason::MalformedHandshake(e.to_string()))?;
        if handshake.protocol_version != PROTOCOL_VERSION {
            return Err(DenyReason::ProtocolMismatch {
                server: PROTOCOL_VERSION,
                client: handshake.protocol_version,
            });
        }
        if handshake.schema_hash != self.schema_hash {
            return Err(DenyReason::SchemaMismatch {
                server: self.schema_hash,
                client: handshake.schema_hash,
            });
        }
        if handshake.peer_id.is_world() {
            return Err(DenyReason::ReservedPeerId);
        }
        if handshake.display_name.is_empty() || handshake.display_name.len() > MAX_NAME_LEN {
            return Err(DenyReason::InvalidName);
        }
        let id = handshake.peer_id;
        if self.roster.contains(id) || self.pending.values().any(|p| p.id == id) {
            return Err(DenyReason::DuplicatePeer(id));
        }
        if self.roster.len() + self.pending.len() >= self.config.max_peers {
            return Err(DenyReason::ServerFull);
        }
        Ok(handshake)
    }

    fn handle_approval(&mut self, connection: ConnectionId, payload: &[u8]) {
        match self.evaluate_handshake(payload) {
            Ok(handshake) => {
                info!(
                    %connection,
                    peer = %handshake.peer_id,
                    name = %handshake.display_name,
                    "approved connection"
                );
                self.pending.insert(
                    connection,
                    Peer::pending(handshake.peer_id, handshake.display_name, connection),
                );
                self.transport.respond_to_approval(connection, true);
            }
            Err(reason) => {
                warn!(%connection, %reason, "denied connection");
                self.transport.respond_to_approval(connection, false);
            }
        }
    }

    fn handle_connected(
        &mut self,
        state: &mut C,
        connection: ConnectionId,
        now: SimTime,
    ) -> Result<(), NetError> {
        let Some(mut peer) = self.pending.remove(&connection) else {
            if self.roster.by_connection(connection).is_some() {
                debug!(%connection, "duplicate connected event ignored");
            } else {
                warn!(%connection, "connection skipped approval; disconnecting");
                self.transport.disconnect(connection);
            }
            return Ok(());
        };

        peer.state = PeerState::Connected;
        info!(peer = %peer.id, name = %peer.name, %connection, "peer connected");
        self.roster.insert(peer.clone());
        state.on_peer_connected(&peer, &mut self.outbox, now)
    }

    fn handle_disconnected(
        &mut self,
        state: &mut C,
        connection: ConnectionId,
        now: SimTime,
    ) -> Result<(), NetError> {
        if let Some(peer) = self.pending.remove(&connection) {
            debug!(peer = %peer.id, %connection, "pending peer dropped before connecting");
            return Ok(());
        }
        let Some(peer) = self.roster.remove_by_connection(connection) else {
            trace!(%connection, "disconnect for unknown connection ignored");
            return Ok(());
        };

        info!(peer = %peer.id, name = %peer.name, "peer disconnected");
        self.outbox.forget_peer(peer.id);
        state.on_peer_disconnected(&peer, &mut self.outbox, now)
    }

    fn handle_data(
        &mut self,
        state: &mut C,
        connection: ConnectionId,
        payload: &[u8],
        now: SimTime,
    ) {
        let Some(sender) = self.roster.by_connection(connection) else {
            warn!(
                %connection,
                len = payload.len(),
                "dropping data from unauthenticated connection"
            );
            return;
        };
        let (id, body) = match split_envelope(payload) {
            Ok(split) => split,
            Err(e) => {
                warn!(peer = %sender.id, error = %e, "dropping truncated envelope");
                return;
            }
        };
        let mut cx = MessageContext {
            sender,
            outbox: &mut self.outbox,
            received_at: now,
        };
        self.dispatcher.dispatch(state, id, body, &mut cx);
    }

    /// Close a peer's connection. Cleanup happens when the transport reports
    /// the disconnect.
    pub fn kick(&mut self, peer: PeerId) -> Result<(), NetError> {
        let connection = self.roster.connection_of(peer)?;
        info!(%peer, "kicking peer");
        self.transport.disconnect(connection);
        Ok(())
    }

    fn resolve(&self, to: &Recipients) -> Result<Vec<ConnectionId>, NetError> {
        let everyone = |except: Option<PeerId>| -> Vec<ConnectionId> {
            self.roster
                .iter()
                .filter(|p| Some(p.id) != except && p.is_connected())
                .filter_map(|p| p.connection)
                .collect()
        };
        Ok(match to {
            Recipients::One(id) => vec![self.roster.connection_of(*id)?],
            Recipients::Many(ids) => ids
                .iter()
                .map(|id| self.roster.connection_of(*id))
                .collect::<Result<_, _>>()?,
            Recipients::All => everyone(None),
            Recipients::AllExcept(id) => everyone(Some(*id)),
        })
    }

    /// Send every queued envelope. Returns the number of envelopes that
    /// reached at least one connection.
    ///
    /// Addressing a peer that is not in the roster is a caller bug and fails
    /// with [`NetError::NoConnection`]. A link that died since the last poll
    /// only loses its own copy; its `Disconnected` event cleans the peer up on
    /// the next poll.
    pub fn flush(&mut self) -> Result<usize, NetError> {
        let queued = self.outbox.drain();
        let mut sent = 0;
        for (to, envelope) in queued {
            let connections = self.resolve(&to)?;
            let mut delivered = false;
            for connection in connections {
                match self
                    .transport
                    .send(connection, &envelope.bytes, envelope.channel)
                {
                    Ok(()) => delivered = true,
                    Err(TransportError::Closed) => return Err(TransportError::Closed.into()),
                    Err(e) => {
                        warn!(
                            %connection,
                            message_id = envelope.id,
                            error = %e,
                            "dropping envelope for dead link"
                        );
                    }
                }
            }
            if delivered {
                sent += 1;
            }
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackNetwork;
    use crate::protocol::{protocol_registry, DespawnEntity};
    use crate::transport::Transport;

    #[derive(Default)]
    struct Log {
        events: Vec<String>,
    }

    impl ServerHooks for Log {
        fn on_peer_connected(
            &mut self,
            peer: &Peer,
            _: &mut Outbox,
            _: SimTime,
        ) -> Result<(), NetError> {
            self.events.push(format!("join {}", peer.id));
            Ok(())
        }

        fn on_peer_disconnected(
            &mut self,
            peer: &Peer,
            _: &mut Outbox,
            _: SimTime,
        ) -> Result<(), NetError> {
            self.events.push(format!("leave {}", peer.id));
            Ok(())
        }
    }

    fn server(
        config: SessionConfig,
    ) -> (LoopbackNetwork, ServerSession<Log>, Arc<MessageRegistry>) {
        let registry = Arc::new(protocol_registry());
        let net = LoopbackNetwork::new();
        let session =
            ServerSession::new(registry.clone(), Box::new(net.server_transport()), config);
        (net, session, registry)
    }

    fn handshake(registry: &MessageRegistry, id: u64, name: &str) -> Vec<u8> {
        Handshake::new(registry.schema_hash(), PeerId(id), name)
            .encode()
            .unwrap()
    }

    #[test]
    fn test_approved_peer_joins_roster() {
        let (net, mut session, registry) = server(SessionConfig::default());
        let mut state = Log::default();
        let mut client = net.connect(handshake(&registry, 5, "eve"));

        assert_eq!(session.poll(&mut state, SimTime::ZERO).unwrap(), 2);
        assert_eq!(state.events, vec!["join peer#5"]);
        assert_eq!(session.roster().len(), 1);
        assert_eq!(session.pending_count(), 0);
        assert!(matches!(
            client.poll_event(),
            Some(TransportEvent::Connected { .. })
        ));
    }

    #[test]
    fn test_denials() {
        let (net, mut session, registry) = server(SessionConfig {
            max_peers: 1,
            ..Default::default()
        });
        let mut state = Log::default();

        net.connect(vec![0xFF, 0xFF]);
        net.connect(handshake(&registry, 0, "world"));
        net.connect(handshake(&registry, 1, ""));
        net.connect(Handshake::new(42, PeerId(1), "x").encode().unwrap());
        net.connect(handshake(&registry, 1, "a"));
        net.connect(handshake(&registry, 1, "again"));
        net.connect(handshake(&registry, 2, "b"));
        session.poll(&mut state, SimTime::ZERO).unwrap();

        assert_eq!(state.events, vec!["join peer#1"]);
        assert_eq!(
            session.evaluate_handshake(&handshake(&registry, 3, "c")),
            Err(DenyReason::ServerFull)
        );
        assert_eq!(
            session.evaluate_handshake(&handshake(&registry, 1, "c")),
            Err(DenyReason::DuplicatePeer(PeerId(1)))
        );
    }

    #[test]
    fn test_single_player_denies_everyone() {
        let (net, mut session, registry) = server(SessionConfig {
            single_player: true,
            ..Default::default()
        });
        let mut client = net.connect(handshake(&registry, 1, "a"));
        session.poll(&mut Log::default(), SimTime::ZERO).unwrap();
        assert!(session.roster().is_empty());
        assert!(matches!(
            client.poll_event(),
            Some(TransportEvent::Disconnected { .. })
        ));
    }

    #[test]
    fn test_anonymous_connection_is_disconnected() {
        let (net, mut session, _) = server(SessionConfig::default());
        let mut state = Log::default();
        let client = net.connect_anonymous();

        session.poll(&mut state, SimTime::ZERO).unwrap();
        assert!(session.roster().is_empty());
        assert!(state.events.is_empty());
        assert!(!net.is_open(client.connection()));
    }

    #[test]
    fn test_disconnect_fires_hook_and_drops_queued_sends() {
        let (net, mut session, registry) = server(SessionConfig::default());
        let mut state = Log::default();
        let client = net.connect(handshake(&registry, 1, "a"));
        session.poll(&mut state, SimTime::ZERO).unwrap();

        session
            .outbox_mut()
            .send(PeerId(1), &DespawnEntity { entity_id: 3 })
            .unwrap();
        net.sever(client.connection());
        session.poll(&mut state, SimTime::ZERO).unwrap();

        assert_eq!(state.events, vec!["join peer#1", "leave peer#1"]);
        assert_eq!(session.flush().unwrap(), 0);
    }

    #[test]
    fn test_dead_link_does_not_starve_other_peers() {
        let (net, mut session, registry) = server(SessionConfig::default());
        let mut state = Log::default();
        let first = net.connect(handshake(&registry, 1, "a"));
        let mut second = net.connect(handshake(&registry, 2, "b"));
        session.poll(&mut state, SimTime::ZERO).unwrap();
        while second.poll_event().is_some() {}

        // The link drops after the poll; the session has not seen it yet.
        net.sever(first.connection());
        let outbox = session.outbox_mut();
        outbox.broadcast(&DespawnEntity { entity_id: 1 }).unwrap();
        outbox.send(PeerId(2), &DespawnEntity { entity_id: 2 }).unwrap();

        assert_eq!(session.flush().unwrap(), 2);
        let received = std::iter::from_fn(|| second.poll_event())
            .filter(|e| matches!(e, TransportEvent::DataReceived { .. }))
            .count();
        assert_eq!(received, 2);

        session.poll(&mut state, SimTime::ZERO).unwrap();
        assert_eq!(
            state.events,
            vec!["join peer#1", "join peer#2", "leave peer#1"]
        );
        assert_eq!(session.roster().len(), 1);
    }

    #[test]
    fn test_send_to_unknown_peer_is_an_error() {
        let (_net, mut session, _) = server(SessionConfig::default());
        session
            .outbox_mut()
            .send(PeerId(9), &DespawnEntity { entity_id: 1 })
            .unwrap();
        assert!(matches!(session.flush(), Err(NetError::NoConnection(PeerId(9)))));
    }

    #[test]
    fn test_broadcast_with_no_peers_is_silent() {
        let (_net, mut session, _) = server(SessionConfig::default());
        session
            .outbox_mut()
            .broadcast(&DespawnEntity { entity_id: 1 })
            .unwrap();
        assert_eq!(session.flush().unwrap(), 0);
    }
}
