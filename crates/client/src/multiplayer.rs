//! Multiplayer client with buffered interpolation of remote entities.

use anyhow::{Context, Result};
use skylark_core::{ChunkPos, EntityId, PeerId, SimTime, Vec2};
use skylark_net::protocol::{
    protocol_registry, BlockEdit, ChunkData, ChunkSubscribe, ChunkUnsubscribe, DespawnEntity,
    MoveBatch, SpawnEntity, Welcome,
};
use skylark_net::{
    Authority, ClientHooks, ClientSession, EntityObservers, LoopbackNetwork, MessageContext,
    MessageRegistry, NetError, Peer, QuicClientTransport, ReplicationConfig, ReplicationEngine,
    Transport,
};
use skylark_world::{Chunk, ChunkLayers, Layer, LocalPos, TileId};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Client-side mirror of the server state.
pub struct ClientWorld {
    identity: PeerId,
    replication: ReplicationEngine,
    // `None` until the first snapshot for a requested chunk arrives.
    chunks: BTreeMap<ChunkPos, Option<Chunk>>,
    player_entity: Option<EntityId>,
}

impl ClientWorld {
    fn new(identity: PeerId, config: ReplicationConfig) -> Self {
        Self {
            identity,
            replication: ReplicationEngine::new(Authority::Client(identity), config),
            chunks: BTreeMap::new(),
            player_entity: None,
        }
    }

    /// Mirrored entity table.
    pub fn replication(&self) -> &ReplicationEngine {
        &self.replication
    }

    /// Cached chunk at `position`, once its snapshot has arrived.
    pub fn chunk(&self, position: ChunkPos) -> Option<&Chunk> {
        self.chunks.get(&position).and_then(Option::as_ref)
    }

    /// Number of chunks with a cached snapshot.
    pub fn cached_chunks(&self) -> usize {
        self.chunks.values().filter(|c| c.is_some()).count()
    }

    /// Entity the server spawned for this client.
    pub fn player_entity(&self) -> Option<EntityId> {
        self.player_entity
    }

    fn handle_welcome(&mut self, welcome: &Welcome) {
        if welcome.peer_id != self.identity {
            warn!(
                identity = %self.identity,
                announced = %welcome.peer_id,
                "welcome addressed to another peer; ignoring"
            );
            return;
        }
        info!(entity = welcome.player_entity, "received player entity");
        self.player_entity = Some(welcome.player_entity);
    }

    fn handle_chunk(&mut self, data: &ChunkData) {
        let Some(slot) = self.chunks.get_mut(&data.position) else {
            debug!(chunk = %data.position, "dropping snapshot for unrequested chunk");
            return;
        };
        let layers = ChunkLayers {
            ground: data.ground,
            object: data.object,
            biome: data.biome,
            heat: data.heat,
            moisture: data.moisture,
        };
        *slot = Some(Chunk::from_layers(data.position, layers));
    }
}

impl ClientHooks for ClientWorld {
    fn on_connected(&mut self, server: &Peer, _now: SimTime) {
        debug!(server = %server.id, "session established");
    }

    fn on_disconnected(&mut self, _server: &Peer, _now: SimTime) {
        let ids: Vec<EntityId> = self.replication.entities().map(|e| e.id).collect();
        for id in ids {
            self.replication.apply_despawn(id);
        }
        self.chunks.clear();
        self.player_entity = None;
    }
}

/// Multiplayer client with networking and interpolation.
pub struct MultiplayerClient {
    session: ClientSession<ClientWorld>,
    world: ClientWorld,
    clock: SimTime,
    tick: u64,
}

impl MultiplayerClient {
    /// Encoded handshake this client presents when connecting.
    pub fn handshake_bytes(
        registry: &MessageRegistry,
        identity: PeerId,
        display_name: &str,
    ) -> Result<Vec<u8>> {
        ClientSession::<ClientWorld>::handshake(registry, identity, display_name)
            .encode()
            .context("Failed to encode handshake")
    }

    /// Connect over an in-process loopback network.
    pub fn loopback(
        network: &LoopbackNetwork,
        identity: PeerId,
        display_name: &str,
        config: ReplicationConfig,
    ) -> Result<Self> {
        let registry = Arc::new(protocol_registry());
        let handshake = Self::handshake_bytes(&registry, identity, display_name)?;
        let transport = network.connect(handshake);
        let connection = transport.connection();
        Self::from_transport(
            registry,
            Box::new(transport),
            connection,
            identity,
            display_name,
            config,
        )
    }

    /// Connect to a QUIC server. Approval is reported by a later `update`.
    pub async fn connect(
        server_addr: SocketAddr,
        identity: PeerId,
        display_name: &str,
        config: ReplicationConfig,
    ) -> Result<Self> {
        let registry = Arc::new(protocol_registry());
        let handshake = Self::handshake_bytes(&registry, identity, display_name)?;
        let transport = QuicClientTransport::connect(server_addr, &handshake)
            .await
            .context("Failed to connect to server")?;
        let connection = transport.connection();
        info!("Connected to server at {}", server_addr);
        Self::from_transport(
            registry,
            Box::new(transport),
            connection,
            identity,
            display_name,
            config,
        )
    }

    fn from_transport(
        registry: Arc<MessageRegistry>,
        transport: Box<dyn Transport>,
        connection: skylark_net::ConnectionId,
        identity: PeerId,
        display_name: &str,
        config: ReplicationConfig,
    ) -> Result<Self> {
        let mut session =
            ClientSession::new(registry, transport, connection, identity, display_name);
        register_handlers(&mut session).context("Failed to register client handlers")?;
        Ok(Self {
            session,
            world: ClientWorld::new(identity, config),
            clock: SimTime::ZERO,
            tick: 0,
        })
    }

    /// Run one frame: drain the network, interpolate, send local moves.
    #[instrument(skip(self), fields(tick = self.tick, identity = %self.session.identity()))]
    pub fn update(&mut self, dt: Duration) -> Result<()> {
        self.clock = self.clock.advance(dt);
        let now = self.clock;

        self.session.poll(&mut self.world, now);
        if let Some(batch) = self.world.replication.tick(now) {
            if self.session.is_connected() {
                self.session
                    .send(&batch)
                    .context("Failed to queue player moves")?;
            }
        }
        if self.session.is_connected() {
            self.session.flush().context("Failed to flush outbox")?;
        }
        self.tick += 1;
        Ok(())
    }

    /// Ask the server to stream `position`.
    pub fn request_chunk(&mut self, position: ChunkPos) -> Result<()> {
        self.session.send(&ChunkSubscribe { position })?;
        self.world.chunks.entry(position).or_insert(None);
        Ok(())
    }

    /// Stop observing `position` and drop its cached snapshot.
    pub fn release_chunk(&mut self, position: ChunkPos) -> Result<()> {
        self.world.chunks.remove(&position);
        self.session.send(&ChunkUnsubscribe { position })?;
        Ok(())
    }

    /// Request a tile change in an observed chunk.
    pub fn edit_block(
        &mut self,
        chunk: ChunkPos,
        local: LocalPos,
        layer: Layer,
        value: TileId,
    ) -> Result<()> {
        local.index()?;
        self.session.send(&BlockEdit {
            chunk,
            x: local.x,
            y: local.y,
            layer: layer as u8,
            value,
        })?;
        Ok(())
    }

    /// Move the local player. Returns false until the server has assigned one.
    pub fn move_player(&mut self, position: Vec2) -> bool {
        match self.world.player_entity {
            Some(id) => self.world.replication.move_entity(id, position),
            None => false,
        }
    }

    /// Spawn/despawn/move callbacks for the presentation layer.
    pub fn observers_mut(&mut self) -> &mut EntityObservers {
        self.world.replication.observers_mut()
    }

    /// Mirrored state.
    pub fn world(&self) -> &ClientWorld {
        &self.world
    }

    /// Local identity.
    pub fn identity(&self) -> PeerId {
        self.session.identity()
    }

    /// Whether the server accepted the connection and it is still open.
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Local clock.
    pub fn clock(&self) -> SimTime {
        self.clock
    }

    /// Close the connection.
    pub fn disconnect(&mut self) {
        self.session.disconnect();
    }
}

fn register_handlers(session: &mut ClientSession<ClientWorld>) -> Result<(), NetError> {
    let dispatcher = session.dispatcher_mut();
    dispatcher.register_handler::<Welcome, _>(|world: &mut ClientWorld, m, _| {
        world.handle_welcome(m)
    })?;
    dispatcher.register_handler::<SpawnEntity, _>(|world: &mut ClientWorld, m, cx| {
        world.replication.apply_spawn(m, cx.received_at)
    })?;
    dispatcher.register_handler::<DespawnEntity, _>(|world: &mut ClientWorld, m, _| {
        world.replication.apply_despawn(m.entity_id);
    })?;
    dispatcher.register_handler::<MoveBatch, _>(
        |world: &mut ClientWorld, m, cx: &mut MessageContext<'_>| {
            world
                .replication
                .apply_move_batch(m, cx.received_at, cx.sender.id);
        },
    )?;
    dispatcher.register_handler::<ChunkData, _>(|world: &mut ClientWorld, m, _| {
        world.handle_chunk(m)
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use skylark_server::{MultiplayerServer, ServerSettings};
    use std::cell::RefCell;
    use std::rc::Rc;

    const FRAME: Duration = Duration::from_millis(10);

    fn step(server: &mut MultiplayerServer, clients: &mut [&mut MultiplayerClient]) {
        server.update(FRAME).unwrap();
        for client in clients.iter_mut() {
            client.update(FRAME).unwrap();
        }
    }

    fn setup() -> (LoopbackNetwork, MultiplayerServer, MultiplayerClient) {
        let network = LoopbackNetwork::new();
        let server = MultiplayerServer::loopback(&network, ServerSettings::default()).unwrap();
        let client =
            MultiplayerClient::loopback(&network, PeerId(1), "alice", ReplicationConfig::default())
                .unwrap();
        (network, server, client)
    }

    #[test]
    fn test_client_learns_player_entity() {
        let (_network, mut server, mut client) = setup();
        assert!(!client.move_player(Vec2::ONE));

        step(&mut server, &mut [&mut client]);

        assert!(client.is_connected());
        let player = client.world().player_entity().unwrap();
        assert_eq!(client.world().replication().get(player).unwrap().owner, PeerId(1));
        assert!(client.move_player(Vec2::new(3.0, 0.0)));
    }

    #[test]
    fn test_chunk_cache_follows_subscription() {
        let (_network, mut server, mut client) = setup();
        step(&mut server, &mut [&mut client]);

        let pos = ChunkPos::new(2, 3);
        client.request_chunk(pos).unwrap();
        client.update(FRAME).unwrap();
        step(&mut server, &mut [&mut client]);

        let cached = client.world().chunk(pos).unwrap();
        assert_eq!(cached.position(), pos);
        assert_eq!(
            cached.layers(),
            server.world().chunks().chunk(pos).unwrap().layers()
        );

        client.release_chunk(pos).unwrap();
        assert!(client.world().chunk(pos).is_none());
        client.update(FRAME).unwrap();
        step(&mut server, &mut [&mut client]);
        assert!(!server.world().chunks().is_loaded(pos));
    }

    #[test]
    fn test_player_moves_reach_the_server() {
        let (_network, mut server, mut client) = setup();
        step(&mut server, &mut [&mut client]);
        let player = client.world().player_entity().unwrap();

        // Remote entities need two snapshots before they interpolate.
        client.move_player(Vec2::new(2.0, 0.0));
        for _ in 0..10 {
            step(&mut server, &mut [&mut client]);
        }
        client.move_player(Vec2::new(4.0, 1.0));
        for _ in 0..30 {
            step(&mut server, &mut [&mut client]);
        }

        let mirrored = server.world().replication().get(player).unwrap();
        assert_eq!(mirrored.position, Vec2::new(4.0, 1.0));
    }

    #[test]
    fn test_observers_see_spawns_and_disconnect_clears_mirror() {
        let (network, mut server, mut client) = setup();
        let spawned = Rc::new(RefCell::new(Vec::new()));
        let sink = spawned.clone();
        client
            .observers_mut()
            .spawned
            .subscribe(move |e| sink.borrow_mut().push(e.id));

        step(&mut server, &mut [&mut client]);
        let mob = server.spawn_mob(3, 10, Vec2::new(1.0, 1.0)).unwrap();
        step(&mut server, &mut [&mut client]);
        assert_eq!(spawned.borrow().len(), 2);
        assert!(client.world().replication().get(mob).is_some());

        let conn = server.roster().get(PeerId(1)).unwrap().connection.unwrap();
        network.sever(conn);
        step(&mut server, &mut [&mut client]);
        assert!(!client.is_connected());
        assert!(client.world().replication().is_empty());
        assert!(client.world().player_entity().is_none());
    }
}
