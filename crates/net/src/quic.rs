//! QUIC transport using quinn for reliable, encrypted connections.
//!
//! Connection tasks run on the tokio runtime and talk to the simulation thread
//! through unbounded `mpsc` channels: events are pushed by reader tasks and
//! drained by [`Transport::poll_event`], sends are queued as commands.
//!
//! Reliable channels share one long-lived unidirectional stream per direction,
//! framed as `[u32 len][channel u8][envelope]`. Unreliable channels use QUIC
//! datagrams prefixed with the channel byte; a payload too large for one
//! datagram goes out on the stream instead. The first frame a client writes is
//! its handshake.

use crate::channel::ChannelType;
use crate::error::TransportError;
use crate::transport::{ConnectionId, ServerTransport, Transport, TransportEvent};
use anyhow::{Context, Result};
use quinn::{ClientConfig, Endpoint, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

const ALPN: &[u8] = b"skylark";

/// Largest reliable frame accepted from a remote.
pub const MAX_FRAME_LEN: usize = 1 << 20;

enum Command {
    Send { channel: ChannelType, bytes: Vec<u8> },
    Close,
}

type EventTx = mpsc::UnboundedSender<TransportEvent>;
type CommandTx = mpsc::UnboundedSender<Command>;

fn frame(channel: ChannelType, bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + bytes.len());
    out.extend_from_slice(&((bytes.len() + 1) as u32).to_le_bytes());
    out.push(channel as u8);
    out.extend_from_slice(bytes);
    out
}

/// Whether an envelope of `len` bytes plus its channel tag fits in one
/// datagram. `max` is `None` when the peer does not accept datagrams.
fn fits_datagram(len: usize, max: Option<usize>) -> bool {
    max.is_some_and(|max| len + 1 <= max)
}

async fn read_frame(stream: &mut quinn::RecvStream) -> Option<Vec<u8>> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await.ok()?;
    let len = u32::from_le_bytes(len) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        warn!(len, "rejecting oversized or empty frame");
        return None;
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.ok()?;
    Some(buf)
}

/// Read reliable frames and datagrams from `connection` until it closes,
/// turning each into a `DataReceived` event.
async fn pump_inbound(
    id: ConnectionId,
    connection: quinn::Connection,
    mut stream: quinn::RecvStream,
    events: EventTx,
) {
    let datagrams = {
        let connection = connection.clone();
        let events = events.clone();
        tokio::spawn(async move {
            while let Ok(datagram) = connection.read_datagram().await {
                let Some((&tag, payload)) = datagram.split_first() else {
                    continue;
                };
                let Ok(channel) = ChannelType::try_from(tag) else {
                    warn!(connection = %id, tag, "dropping datagram with unknown channel");
                    continue;
                };
                let _ = events.send(TransportEvent::DataReceived {
                    connection: id,
                    channel,
                    payload: payload.to_vec(),
                });
            }
        })
    };

    while let Some(frame) = read_frame(&mut stream).await {
        let Ok(channel) = ChannelType::try_from(frame[0]) else {
            warn!(connection = %id, tag = frame[0], "dropping frame with unknown channel");
            continue;
        };
        let _ = events.send(TransportEvent::DataReceived {
            connection: id,
            channel,
            payload: frame[1..].to_vec(),
        });
    }

    datagrams.abort();
    let _ = events.send(TransportEvent::Disconnected { connection: id });
}

/// Apply queued commands to `connection` until closed.
async fn pump_outbound(
    id: ConnectionId,
    connection: quinn::Connection,
    mut stream: quinn::SendStream,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Send { channel, bytes } => {
                if channel.is_unreliable()
                    && fits_datagram(bytes.len(), connection.max_datagram_size())
                {
                    let mut datagram = Vec::with_capacity(bytes.len() + 1);
                    datagram.push(channel as u8);
                    datagram.extend_from_slice(&bytes);
                    match connection.send_datagram(datagram.into()) {
                        Ok(()) => continue,
                        Err(quinn::SendDatagramError::TooLarge) => {}
                        Err(e) => {
                            debug!(connection = %id, error = %e, "datagram dropped");
                            continue;
                        }
                    }
                }
                if channel.is_unreliable() {
                    trace!(
                        connection = %id,
                        len = bytes.len(),
                        "oversized datagram sent on stream"
                    );
                }
                if let Err(e) = stream.write_all(&frame(channel, &bytes)).await {
                    debug!(connection = %id, error = %e, "reliable write failed");
                    break;
                }
            }
            Command::Close => break,
        }
    }
    let _ = stream.finish();
    connection.close(0u32.into(), b"closed");
}

struct ServerLink {
    commands: CommandTx,
    approval: Option<oneshot::Sender<bool>>,
}

/// Server half of the QUIC transport.
pub struct QuicServerTransport {
    local_addr: SocketAddr,
    endpoint: Endpoint,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    links: mpsc::UnboundedReceiver<(ConnectionId, ServerLink)>,
    known: HashMap<ConnectionId, ServerLink>,
}

impl QuicServerTransport {
    /// Bind a server endpoint and start accepting connections.
    ///
    /// Must be called inside a tokio runtime. Uses self-signed TLS certificates
    /// for development.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let endpoint = server_endpoint(addr)?;
        let local_addr = endpoint.local_addr()?;
        info!(%local_addr, "QUIC server listening");

        let (event_tx, events) = mpsc::unbounded_channel();
        let (link_tx, links) = mpsc::unbounded_channel();
        tokio::spawn(accept_loop(endpoint.clone(), event_tx, link_tx));

        Ok(Self {
            local_addr,
            endpoint,
            events,
            links,
            known: HashMap::new(),
        })
    }

    /// Address the endpoint is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn absorb_links(&mut self) {
        while let Ok((id, link)) = self.links.try_recv() {
            self.known.insert(id, link);
        }
    }
}

impl Drop for QuicServerTransport {
    fn drop(&mut self) {
        self.endpoint.close(0u32.into(), b"server shutting down");
    }
}

async fn accept_loop(
    endpoint: Endpoint,
    events: EventTx,
    links: mpsc::UnboundedSender<(ConnectionId, ServerLink)>,
) {
    let mut next_id = 1;
    while let Some(incoming) = endpoint.accept().await {
        let id = ConnectionId(next_id);
        next_id += 1;
        let events = events.clone();
        let links = links.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(id, incoming, events, links).await {
                debug!(connection = %id, error = %e, "connection ended during setup");
            }
        });
    }
}

async fn serve_connection(
    id: ConnectionId,
    incoming: quinn::Incoming,
    events: EventTx,
    links: mpsc::UnboundedSender<(ConnectionId, ServerLink)>,
) -> Result<()> {
    let connection = incoming.await.context("handshake failed")?;
    debug!(connection = %id, remote = %connection.remote_address(), "QUIC connection accepted");

    let mut inbound = connection.accept_uni().await.context("no inbound stream")?;
    let handshake = read_frame(&mut inbound)
        .await
        .context("missing handshake frame")?;

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (approval_tx, approval_rx) = oneshot::channel();
    links
        .send((
            id,
            ServerLink {
                commands: command_tx,
                approval: Some(approval_tx),
            },
        ))
        .ok()
        .context("transport dropped")?;
    events
        .send(TransportEvent::ConnectionApprovalRequested {
            connection: id,
            // Skip the channel byte.
            payload: handshake[1..].to_vec(),
        })
        .ok()
        .context("transport dropped")?;

    if !approval_rx.await.unwrap_or(false) {
        connection.close(1u32.into(), b"denied");
        return Ok(());
    }

    let mut outbound = connection.open_uni().await.context("open outbound stream")?;
    // An empty control frame tells the client it was approved.
    outbound
        .write_all(&frame(ChannelType::Control, &[]))
        .await
        .context("send approval")?;
    let _ = events.send(TransportEvent::Connected { connection: id });
    tokio::spawn(pump_outbound(id, connection.clone(), outbound, command_rx));
    pump_inbound(id, connection, inbound, events).await;
    Ok(())
}

impl Transport for QuicServerTransport {
    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.absorb_links();
        let event = self.events.try_recv().ok()?;
        if let TransportEvent::Disconnected { connection } = &event {
            self.known.remove(connection);
        }
        Some(event)
    }

    fn send(
        &mut self,
        connection: ConnectionId,
        bytes: &[u8],
        channel: ChannelType,
    ) -> Result<(), TransportError> {
        let link = self
            .known
            .get(&connection)
            .ok_or(TransportError::UnknownConnection(connection))?;
        link.commands
            .send(Command::Send {
                channel,
                bytes: bytes.to_vec(),
            })
            .map_err(|_| TransportError::UnknownConnection(connection))
    }

    fn disconnect(&mut self, connection: ConnectionId) {
        self.absorb_links();
        if let Some(mut link) = self.known.remove(&connection) {
            if let Some(approval) = link.approval.take() {
                let _ = approval.send(false);
            }
            let _ = link.commands.send(Command::Close);
        }
    }
}

impl ServerTransport for QuicServerTransport {
    fn respond_to_approval(&mut self, connection: ConnectionId, approved: bool) {
        self.absorb_links();
        let Some(link) = self.known.get_mut(&connection) else {
            return;
        };
        if let Some(approval) = link.approval.take() {
            let _ = approval.send(approved);
        }
        if !approved {
            self.known.remove(&connection);
        }
    }
}

/// Client half of the QUIC transport; one connection to one server.
pub struct QuicClientTransport {
    connection: ConnectionId,
    commands: CommandTx,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    endpoint: Endpoint,
}

impl QuicClientTransport {
    /// Connect to `server_addr` and send `handshake` as the first frame.
    ///
    /// Resolves once the QUIC handshake completes; approval arrives later as a
    /// `Connected` or `Disconnected` event.
    pub async fn connect(server_addr: SocketAddr, handshake: &[u8]) -> Result<Self> {
        let endpoint = client_endpoint()?;
        info!(%server_addr, "connecting to server");
        let connection = endpoint
            .connect(server_addr, "localhost")
            .context("Failed to initiate connection")?
            .await
            .context("Failed to establish connection")?;

        let mut outbound = connection.open_uni().await.context("open outbound stream")?;
        outbound
            .write_all(&frame(ChannelType::Control, handshake))
            .await
            .context("send handshake")?;

        let id = ConnectionId(0);
        let (event_tx, events) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();

        {
            let connection = connection.clone();
            tokio::spawn(async move {
                let mut inbound = match connection.accept_uni().await {
                    Ok(inbound) => inbound,
                    Err(e) => {
                        debug!(error = %e, "server closed before approval");
                        let _ = event_tx.send(TransportEvent::Disconnected { connection: id });
                        return;
                    }
                };
                if read_frame(&mut inbound).await.is_none() {
                    let _ = event_tx.send(TransportEvent::Disconnected { connection: id });
                    return;
                }
                let _ = event_tx.send(TransportEvent::Connected { connection: id });
                pump_inbound(id, connection, inbound, event_tx).await;
            });
        }
        tokio::spawn(pump_outbound(id, connection, outbound, command_rx));

        Ok(Self {
            connection: id,
            commands,
            events,
            endpoint,
        })
    }

    /// Handle of the server connection.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }
}

impl Drop for QuicClientTransport {
    fn drop(&mut self) {
        self.endpoint.close(0u32.into(), b"client shutting down");
    }
}

impl Transport for QuicClientTransport {
    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events.try_recv().ok()
    }

    fn send(
        &mut self,
        connection: ConnectionId,
        bytes: &[u8],
        channel: ChannelType,
    ) -> Result<(), TransportError> {
        if connection != self.connection {
            return Err(TransportError::UnknownConnection(connection));
        }
        self.commands
            .send(Command::Send {
                channel,
                bytes: bytes.to_vec(),
            })
            .map_err(|_| TransportError::Closed)
    }

    fn disconnect(&mut self, connection: ConnectionId) {
        if connection == self.connection {
            let _ = self.commands.send(Command::Close);
        }
    }
}

fn transport_config() -> Result<quinn::TransportConfig> {
    let mut transport_config = quinn::TransportConfig::default();
    transport_config.keep_alive_interval(Some(Duration::from_secs(5)));
    transport_config.max_idle_timeout(Some(Duration::from_secs(30).try_into()?));
    Ok(transport_config)
}

fn server_endpoint(addr: SocketAddr) -> Result<Endpoint> {
    // Install default crypto provider if not already installed
    let _ = rustls::crypto::ring::default_provider().install_default();

    let (cert, key) = generate_self_signed_cert()?;
    let mut server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .context("Failed to build rustls ServerConfig")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("Failed to create QuicServerConfig")?,
    ));
    server_config.transport_config(Arc::new(transport_config()?));

    Endpoint::server(server_config, addr).context("Failed to bind server endpoint")
}

fn client_endpoint() -> Result<Endpoint> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    // Development only: the server presents a self-signed certificate.
    let mut client_crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("Failed to create QuicClientConfig")?,
    ));
    client_config.transport_config(Arc::new(transport_config()?));

    let mut endpoint = Endpoint::client("0.0.0.0:0".parse()?)?;
    endpoint.set_default_client_config(client_config);
    debug!(local = %endpoint.local_addr()?, "client endpoint created");
    Ok(endpoint)
}

/// Generate a self-signed certificate for development use.
fn generate_self_signed_cert() -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .context("Failed to generate certificate")?;
    let key = PrivateKeyDer::Pkcs8(cert.key_pair.serialize_der().into());
    Ok((CertificateDer::from(cert.cert), key))
}

/// Certificate verifier that accepts all certificates (development only).
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
