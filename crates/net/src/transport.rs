//! Polling transport abstraction consumed by the session services.
//!
//! Implementations own the actual I/O; sessions only ever poll for events and
//! hand back envelopes, all on the simulation thread.

use crate::channel::ChannelType;
use crate::error::TransportError;
use std::fmt;

/// Transport-assigned handle for one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Connection lifecycle and data events, delivered in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A remote asks to join; `payload` is its handshake.
    ConnectionApprovalRequested {
        /// Connection handle.
        connection: ConnectionId,
        /// Raw handshake bytes.
        payload: Vec<u8>,
    },
    /// The connection is established.
    Connected {
        /// Connection handle.
        connection: ConnectionId,
    },
    /// The connection is gone.
    Disconnected {
        /// Connection handle.
        connection: ConnectionId,
    },
    /// An envelope arrived.
    DataReceived {
        /// Connection handle.
        connection: ConnectionId,
        /// Channel it arrived on.
        channel: ChannelType,
        /// Envelope bytes.
        payload: Vec<u8>,
    },
}

/// Non-blocking transport endpoint.
pub trait Transport {
    /// Next queued event, if any.
    fn poll_event(&mut self) -> Option<TransportEvent>;

    /// Send one envelope to one connection.
    fn send(
        &mut self,
        connection: ConnectionId,
        bytes: &[u8],
        channel: ChannelType,
    ) -> Result<(), TransportError>;

    /// Send one envelope to several connections.
    fn broadcast(
        &mut self,
        connections: &[ConnectionId],
        bytes: &[u8],
        channel: ChannelType,
    ) -> Result<(), TransportError> {
        for &connection in connections {
            self.send(connection, bytes, channel)?;
        }
        Ok(())
    }

    /// Close a connection. Unknown handles are ignored.
    fn disconnect(&mut self, connection: ConnectionId);
}

/// Server-side transport that lets the session approve or deny joins.
pub trait ServerTransport: Transport {
    /// Answer a pending approval request.
    fn respond_to_approval(&mut self, connection: ConnectionId, approved: bool);
}
