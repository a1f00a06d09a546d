#![warn(missing_docs)]
//! Networking layer shared by the client and server: typed message registry,
//! dispatch, transports, sessions and entity replication.

mod channel;
mod client_session;
mod codec;
mod config;
mod dispatcher;
mod entity_replication;
mod error;
mod loopback;
mod observer;
mod outbox;
mod peer;
pub mod protocol;
mod quic;
mod registry;
mod server_session;
mod transport;
mod wire;

pub use channel::ChannelType;
pub use client_session::{ClientHooks, ClientSession};
pub use codec::{
    compute_schema_hash, encode_envelope, kind_id, split_envelope, Envelope, MessageId,
    ENVELOPE_HEADER_LEN,
};
pub use config::{ReplicationConfig, SessionConfig};
pub use dispatcher::{DispatchOutcome, Dispatcher, MessageContext};
pub use entity_replication::{
    interpolation_factor, Authority, EntityMoved, EntityObservers, GameEntity, ReplicationEngine,
    Snapshot,
};
pub use error::{NetError, TransportError};
pub use loopback::{LoopbackClientTransport, LoopbackNetwork, LoopbackServerTransport};
pub use observer::{ObserverId, ObserverList};
pub use outbox::{Outbox, Recipients};
pub use peer::{Peer, PeerRoster, PeerState};
pub use quic::{QuicClientTransport, QuicServerTransport, MAX_FRAME_LEN};
pub use registry::{KindHasher, MessageRegistry, NetMessage};
pub use server_session::{DenyReason, ServerHooks, ServerSession};
pub use transport::{ConnectionId, ServerTransport, Transport, TransportEvent};
pub use wire::{WireError, WireReader, WireWriter};
