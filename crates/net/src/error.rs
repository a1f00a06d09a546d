//! Error types for the networking layer.

use crate::transport::ConnectionId;
use crate::wire::WireError;
use skylark_core::PeerId;
use thiserror::Error;

/// Failure reported by a transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection handle is unknown or already closed.
    #[error("unknown or closed connection {0}")]
    UnknownConnection(ConnectionId),

    /// The transport itself has shut down.
    #[error("transport is closed")]
    Closed,
}

/// Errors surfaced by sessions and the outbox.
///
/// Every variant describes a caller bug or a local failure; misbehaving peers
/// are handled by logging and dropping at the session boundary instead.
#[derive(Debug, Error)]
pub enum NetError {
    /// A message was addressed to a peer with no live connection.
    #[error("peer {0} has no live connection")]
    NoConnection(PeerId),

    /// A message type was sent or handled without being registered at startup.
    #[error("message kind `{0}` was never registered")]
    UnregisteredKind(&'static str),

    /// The client session has no server connection.
    #[error("client session is not connected")]
    NotConnected,

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Payload encoding failure.
    #[error(transparent)]
    Wire(#[from] WireError),
}
