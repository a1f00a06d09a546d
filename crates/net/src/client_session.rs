//! Client-side network session: one connection to the server.

use crate::codec::split_envelope;
use crate::dispatcher::{Dispatcher, MessageContext};
use crate::error::NetError;
use crate::outbox::Outbox;
use crate::peer::{Peer, PeerState};
use crate::protocol::Handshake;
use crate::registry::{MessageRegistry, NetMessage};
use crate::transport::{ConnectionId, Transport, TransportEvent};
use skylark_core::{PeerId, SimTime};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Notifications the client session raises into host state.
pub trait ClientHooks {
    /// The server approved the connection.
    fn on_connected(&mut self, _server: &Peer, _now: SimTime) {}

    /// The connection closed or was refused.
    fn on_disconnected(&mut self, _server: &Peer, _now: SimTime) {}
}

impl ClientHooks for () {}

/// Client session over one transport connection.
pub struct ClientSession<C> {
    transport: Box<dyn Transport>,
    dispatcher: Dispatcher<C>,
    outbox: Outbox,
    server: Peer,
    identity: PeerId,
    display_name: String,
}

impl<C: ClientHooks + 'static> ClientSession<C> {
    /// Wrap a transport whose connection to the server is `connection`.
    pub fn new(
        registry: Arc<MessageRegistry>,
        transport: Box<dyn Transport>,
        connection: ConnectionId,
        identity: PeerId,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            dispatcher: Dispatcher::new(registry.clone()),
            outbox: Outbox::new(registry),
            server: Peer::pending(PeerId::WORLD, "server", connection),
            identity,
            display_name: display_name.into(),
        }
    }

    /// Handshake a client with this registry should present.
    pub fn handshake(
        registry: &MessageRegistry,
        identity: PeerId,
        display_name: impl Into<String>,
    ) -> Handshake {
        Handshake::new(registry.schema_hash(), identity, display_name)
    }

    /// Handler table.
    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher<C> {
        &mut self.dispatcher
    }

    /// Local identity.
    pub fn identity(&self) -> PeerId {
        self.identity
    }

    /// Local display name.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// The server as a peer.
    pub fn server(&self) -> &Peer {
        &self.server
    }

    /// Whether the server connection is live.
    pub fn is_connected(&self) -> bool {
        self.server.is_connected()
    }

    /// Drain queued transport events. Returns the number handled.
    pub fn poll(&mut self, state: &mut C, now: SimTime) -> usize {
        let mut handled = 0;
        while let Some(event) = self.transport.poll_event() {
            handled += 1;
            match event {
                TransportEvent::Connected { connection }
                    if Some(connection) == self.server.connection =>
                {
                    self.server.state = PeerState::Connected;
                    info!(identity = %self.identity, %connection, "connected to server");
                    state.on_connected(&self.server, now);
                }
                TransportEvent::Disconnected { connection }
                    if Some(connection) == self.server.connection =>
                {
                    info!(identity = %self.identity, %connection, "disconnected from server");
                    self.server.mark_disconnected();
                    self.outbox.clear();
                    state.on_disconnected(&self.server, now);
                }
                TransportEvent::DataReceived {
                    connection,
                    payload,
                    ..
                } => self.handle_data(state, connection, &payload, now),
                other => {
                    debug!(event = ?other, "ignoring unexpected transport event");
                }
            }
        }
        handled
    }

    fn handle_data(
        &mut self,
        state: &mut C,
        connection: ConnectionId,
        payload: &[u8],
        now: SimTime,
    ) {
        if !self.server.is_connected() || Some(connection) != self.server.connection {
            warn!(%connection, "dropping data from unknown connection");
            return;
        }
        let (id, body) = match split_envelope(payload) {
            Ok(split) => split,
            Err(e) => {
                warn!(error = %e, "dropping truncated envelope from server");
                return;
            }
        };
        let mut cx = MessageContext {
            sender: &self.server,
            outbox: &mut self.outbox,
            received_at: now,
        };
        self.dispatcher.dispatch(state, id, body, &mut cx);
    }

    /// Queue `message` for the server.
    pub fn send<T: NetMessage>(&mut self, message: &T) -> Result<(), NetError> {
        if !self.is_connected() {
            return Err(NetError::NotConnected);
        }
        self.outbox.send(PeerId::WORLD, message)
    }

    /// Send every queued envelope to the server. Returns the number sent.
    pub fn flush(&mut self) -> Result<usize, NetError> {
        let queued = self.outbox.drain();
        if queued.is_empty() {
            return Ok(0);
        }
        let connection = self
            .server
            .connection
            .filter(|_| self.server.is_connected())
            .ok_or(NetError::NotConnected)?;

        let mut sent = 0;
        // Everything a client queues is addressed to the server.
        for (_, envelope) in queued {
            self.transport
                .send(connection, &envelope.bytes, envelope.channel)?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Close the connection.
    pub fn disconnect(&mut self) {
        if let Some(connection) = self.server.connection {
            self.transport.disconnect(connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackNetwork;
    use crate::protocol::{protocol_registry, DespawnEntity};
    use crate::config::SessionConfig;
    use crate::server_session::ServerSession;

    struct Harness {
        net: LoopbackNetwork,
        server: ServerSession<()>,
        client: ClientSession<Vec<u64>>,
    }

    fn harness() -> Harness {
        let registry = Arc::new(protocol_registry());
        let net = LoopbackNetwork::new();
        let server = ServerSession::new(
            registry.clone(),
            Box::new(net.server_transport()),
            SessionConfig::default(),
        );
        let hs = ClientSession::<Vec<u64>>::handshake(&registry, PeerId(3), "c")
            .encode()
            .unwrap();
        let transport = net.connect(hs);
        let connection = transport.connection();
        let mut client =
            ClientSession::new(registry, Box::new(transport), connection, PeerId(3), "c");
        client
            .dispatcher_mut()
            .register_handler::<DespawnEntity, _>(|seen: &mut Vec<u64>, m, cx| {
                assert!(cx.sender.id.is_world());
                seen.push(m.entity_id);
            })
            .unwrap();
        Harness { net, server, client }
    }

    impl ClientHooks for Vec<u64> {}

    #[test]
    fn test_send_before_connect_fails() {
        let mut h = harness();
        assert!(matches!(
            h.client.send(&DespawnEntity { entity_id: 1 }),
            Err(NetError::NotConnected)
        ));
    }

    #[test]
    fn test_messages_flow_both_ways() {
        let mut h = harness();
        let mut seen = Vec::new();
        h.server.poll(&mut (), SimTime::ZERO).unwrap();
        h.client.poll(&mut seen, SimTime::ZERO);
        assert!(h.client.is_connected());

        h.server
            .outbox_mut()
            .broadcast(&DespawnEntity { entity_id: 11 })
            .unwrap();
        assert_eq!(h.server.flush().unwrap(), 1);
        h.client.poll(&mut seen, SimTime::ZERO);
        assert_eq!(seen, vec![11]);

        h.client.send(&DespawnEntity { entity_id: 12 }).unwrap();
        assert_eq!(h.client.flush().unwrap(), 1);
        assert_eq!(h.net.pending_server_events(), 1);
    }

    #[test]
    fn test_disconnect_clears_outbox() {
        let mut h = harness();
        let mut seen = Vec::new();
        h.server.poll(&mut (), SimTime::ZERO).unwrap();
        h.client.poll(&mut seen, SimTime::ZERO);

        h.client.send(&DespawnEntity { entity_id: 1 }).unwrap();
        h.client.disconnect();
        h.client.poll(&mut seen, SimTime::ZERO);

        assert!(!h.client.is_connected());
        assert_eq!(h.client.flush().unwrap(), 0);
    }
}
