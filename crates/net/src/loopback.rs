//! In-process transport for tests, demos and single-binary simulations.
//!
//! Every endpoint shares one [`LoopbackNetwork`]; sends land directly in the
//! peer endpoint's event queue, so delivery is instantaneous, ordered and
//! deterministic.

use crate::channel::ChannelType;
use crate::error::TransportError;
use crate::transport::{ConnectionId, ServerTransport, Transport, TransportEvent};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkStatus {
    AwaitingApproval,
    Open,
    Closed,
}

#[derive(Default)]
struct LoopbackState {
    next_connection: u64,
    server_events: VecDeque<TransportEvent>,
    client_events: HashMap<ConnectionId, VecDeque<TransportEvent>>,
    links: HashMap<ConnectionId, LinkStatus>,
}

impl LoopbackState {
    fn allocate(&mut self, status: LinkStatus) -> ConnectionId {
        self.next_connection += 1;
        let connection = ConnectionId(self.next_connection);
        self.links.insert(connection, status);
        self.client_events.insert(connection, VecDeque::new());
        connection
    }

    fn push_client(&mut self, connection: ConnectionId, event: TransportEvent) {
        if let Some(queue) = self.client_events.get_mut(&connection) {
            queue.push_back(event);
        }
    }

    fn is_open(&self, connection: ConnectionId) -> bool {
        self.links.get(&connection) == Some(&LinkStatus::Open)
    }

    fn close(&mut self, connection: ConnectionId) {
        let Some(status) = self.links.get_mut(&connection) else {
            return;
        };
        if *status == LinkStatus::Closed {
            return;
        }
        let was_open = *status == LinkStatus::Open;
        *status = LinkStatus::Closed;
        if was_open {
            self.server_events
                .push_back(TransportEvent::Disconnected { connection });
        }
        self.push_client(connection, TransportEvent::Disconnected { connection });
    }
}

/// Shared in-memory network linking one server endpoint to any number of
/// client endpoints.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Rc<RefCell<LoopbackState>>,
}

impl LoopbackNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Server endpoint for this network.
    pub fn server_transport(&self) -> LoopbackServerTransport {
        LoopbackServerTransport {
            network: self.clone(),
        }
    }

    /// Open a client endpoint; the server sees an approval request carrying
    /// `handshake`.
    pub fn connect(&self, handshake: Vec<u8>) -> LoopbackClientTransport {
        let mut state = self.state.borrow_mut();
        let connection = state.allocate(LinkStatus::AwaitingApproval);
        state
            .server_events
            .push_back(TransportEvent::ConnectionApprovalRequested {
                connection,
                payload: handshake,
            });
        LoopbackClientTransport {
            network: self.clone(),
            connection,
        }
    }

    /// Open a client endpoint that skips the approval step entirely. The
    /// server only sees `Connected`.
    pub fn connect_anonymous(&self) -> LoopbackClientTransport {
        let mut state = self.state.borrow_mut();
        let connection = state.allocate(LinkStatus::Open);
        state
            .server_events
            .push_back(TransportEvent::Connected { connection });
        LoopbackClientTransport {
            network: self.clone(),
            connection,
        }
    }

    /// Deliver raw bytes to the server as if they came from `connection`,
    /// whether or not that connection exists.
    pub fn inject_data(&self, connection: ConnectionId, channel: ChannelType, payload: Vec<u8>) {
        self.state
            .borrow_mut()
            .server_events
            .push_back(TransportEvent::DataReceived {
                connection,
                channel,
                payload,
            });
    }

    /// Drop a link as if the network failed; both sides see `Disconnected`.
    pub fn sever(&self, connection: ConnectionId) {
        self.state.borrow_mut().close(connection);
    }

    /// Whether `connection` is currently open.
    pub fn is_open(&self, connection: ConnectionId) -> bool {
        self.state.borrow().is_open(connection)
    }

    /// Number of events waiting for the server.
    pub fn pending_server_events(&self) -> usize {
        self.state.borrow().server_events.len()
    }
}

/// Server endpoint of a [`LoopbackNetwork`].
pub struct LoopbackServerTransport {
    network: LoopbackNetwork,
}

impl Transport for LoopbackServerTransport {
    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.network.state.borrow_mut().server_events.pop_front()
    }

    fn send(
        &mut self,
        connection: ConnectionId,
        bytes: &[u8],
        channel: ChannelType,
    ) -> Result<(), TransportError> {
        let mut state = self.network.state.borrow_mut();
        if !state.is_open(connection) {
            return Err(TransportError::UnknownConnection(connection));
        }
        trace!(%connection, len = bytes.len(), ?channel, "loopback server send");
        state.push_client(
            connection,
            TransportEvent::DataReceived {
                connection,
                channel,
                payload: bytes.to_vec(),
            },
        );
        Ok(())
    }

    fn disconnect(&mut self, connection: ConnectionId) {
        self.network.state.borrow_mut().close(connection);
    }
}

impl ServerTransport for LoopbackServerTransport {
    fn respond_to_approval(&mut self, connection: ConnectionId, approved: bool) {
        let mut state = self.network.state.borrow_mut();
        if state.links.get(&connection) != Some(&LinkStatus::AwaitingApproval) {
            return;
        }
        if approved {
            state.links.insert(connection, LinkStatus::Open);
            state
                .server_events
                .push_back(TransportEvent::Connected { connection });
            state.push_client(connection, TransportEvent::Connected { connection });
        } else {
            state.links.insert(connection, LinkStatus::Closed);
            state.push_client(connection, TransportEvent::Disconnected { connection });
        }
    }
}

/// Client endpoint of a [`LoopbackNetwork`].
pub struct LoopbackClientTransport {
    network: LoopbackNetwork,
    connection: ConnectionId,
}

impl LoopbackClientTransport {
    /// Handle of this client's link, as the server sees it.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }
}

impl Transport for LoopbackClientTransport {
    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.network
            .state
            .borrow_mut()
            .client_events
            .get_mut(&self.connection)?
            .pop_front()
    }

    fn send(
        &mut self,
        connection: ConnectionId,
        bytes: &[u8],
        channel: ChannelType,
    ) -> Result<(), TransportError> {
        let mut state = self.network.state.borrow_mut();
        if connection != self.connection || !state.is_open(connection) {
            return Err(TransportError::UnknownConnection(connection));
        }
        trace!(%connection, len = bytes.len(), ?channel, "loopback client send");
        state.server_events.push_back(TransportEvent::DataReceived {
            connection,
            channel,
            payload: bytes.to_vec(),
        });
        Ok(())
    }

    fn disconnect(&mut self, connection: ConnectionId) {
        if connection == self.connection {
            self.network.state.borrow_mut().close(connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approval_opens_link_both_ways() {
        let net = LoopbackNetwork::new();
        let mut server = net.server_transport();
        let mut client = net.connect(vec![1, 2]);
        let conn = client.connection();

        assert_eq!(
            server.poll_event(),
            Some(TransportEvent::ConnectionApprovalRequested {
                connection: conn,
                payload: vec![1, 2]
            })
        );
        assert!(server.send(conn, &[0], ChannelType::Control).is_err());

        server.respond_to_approval(conn, true);
        assert_eq!(
            server.poll_event(),
            Some(TransportEvent::Connected { connection: conn })
        );
        assert_eq!(
            client.poll_event(),
            Some(TransportEvent::Connected { connection: conn })
        );

        client.send(conn, &[7], ChannelType::EntityState).unwrap();
        server.send(conn, &[8], ChannelType::Control).unwrap();
        assert_eq!(
            server.poll_event(),
            Some(TransportEvent::DataReceived {
                connection: conn,
                channel: ChannelType::EntityState,
                payload: vec![7]
            })
        );
        assert_eq!(
            client.poll_event(),
            Some(TransportEvent::DataReceived {
                connection: conn,
                channel: ChannelType::Control,
                payload: vec![8]
            })
        );
    }

    #[test]
    fn test_denied_client_sees_disconnect() {
        let net = LoopbackNetwork::new();
        let mut server = net.server_transport();
        let mut client = net.connect(vec![]);
        server.poll_event();
        server.respond_to_approval(client.connection(), false);

        assert_eq!(server.poll_event(), None);
        assert_eq!(
            client.poll_event(),
            Some(TransportEvent::Disconnected {
                connection: client.connection()
            })
        );
        assert!(!net.is_open(client.connection()));
    }

    #[test]
    fn test_disconnect_notifies_both_sides_once() {
        let net = LoopbackNetwork::new();
        let mut server = net.server_transport();
        let mut client = net.connect_anonymous();
        let conn = client.connection();
        assert_eq!(
            server.poll_event(),
            Some(TransportEvent::Connected { connection: conn })
        );

        server.disconnect(conn);
        server.disconnect(conn);
        assert_eq!(
            server.poll_event(),
            Some(TransportEvent::Disconnected { connection: conn })
        );
        assert_eq!(server.poll_event(), None);
        assert_eq!(
            client.poll_event(),
            Some(TransportEvent::Disconnected { connection: conn })
        );
        assert!(client.send(conn, &[1], ChannelType::Control).is_err());
    }

    #[test]
    fn test_broadcast_stops_at_closed_link() {
        let net = LoopbackNetwork::new();
        let mut server = net.server_transport();
        let a = net.connect_anonymous().connection();
        let b = net.connect_anonymous().connection();
        net.sever(b);

        assert!(server.broadcast(&[a], &[1], ChannelType::Control).is_ok());
        assert!(matches!(
            server.broadcast(&[a, b], &[1], ChannelType::Control),
            Err(TransportError::UnknownConnection(c)) if c == b
        ));
    }
}
