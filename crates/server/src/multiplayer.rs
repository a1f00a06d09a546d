//! Multiplayer server with network replication.

use crate::chunk_interest::ChunkInterestService;
use crate::settings::ServerSettings;
use anyhow::{Context, Result};
use skylark_core::{ChunkPos, EntityId, PeerId, SimTime, Vec2};
use skylark_net::protocol::{
    protocol_registry, BlockEdit, ChunkSubscribe, ChunkUnsubscribe, EntityKind, MoveBatch, Welcome,
};
use skylark_net::{
    Authority, LoopbackNetwork, MessageContext, NetError, Outbox, Peer, PeerRoster,
    QuicServerTransport, ReplicationEngine, ServerHooks, ServerSession, ServerTransport,
};
use skylark_world::{ChunkGenerator, Layer, LocalPos, TerrainGenerator, TileId};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Authoritative state the session hands to message handlers.
pub struct ServerWorld {
    replication: ReplicationEngine,
    chunks: ChunkInterestService,
    spawn_point: Vec2,
    fault: Option<anyhow::Error>,
}

impl ServerWorld {
    fn new(settings: &ServerSettings, generator: Box<dyn ChunkGenerator>) -> Self {
        Self {
            replication: ReplicationEngine::new(Authority::Server, settings.replication.clone()),
            chunks: ChunkInterestService::new(generator),
            spawn_point: Vec2::ZERO,
            fault: None,
        }
    }

    /// Entity table.
    pub fn replication(&self) -> &ReplicationEngine {
        &self.replication
    }

    /// Chunk table.
    pub fn chunks(&self) -> &ChunkInterestService {
        &self.chunks
    }

    // Handlers cannot return errors; the first local fault is surfaced by the
    // next `update`.
    fn record<E: Into<anyhow::Error>>(&mut self, result: Result<(), E>) {
        if let Err(e) = result {
            self.fault.get_or_insert(e.into());
        }
    }

    fn handle_move_batch(&mut self, batch: &MoveBatch, cx: &mut MessageContext<'_>) {
        let sender = cx.sender.id;
        let accepted = self
            .replication
            .apply_move_batch(batch, cx.received_at, sender);
        if accepted.is_empty() {
            return;
        }
        let relayed = cx.outbox.broadcast_except(sender, &accepted);
        self.record(relayed);
    }

    fn handle_block_edit(&mut self, edit: &BlockEdit, cx: &mut MessageContext<'_>) {
        let peer = cx.sender.id;
        if !self.chunks.is_observing(peer, edit.chunk) {
            warn!(%peer, chunk = %edit.chunk, "dropping block edit for unobserved chunk");
            return;
        }
        let layer = match Layer::try_from(edit.layer) {
            Ok(layer) => layer,
            Err(e) => {
                warn!(%peer, error = %e, "dropping block edit");
                return;
            }
        };
        let local = LocalPos::new(edit.x, edit.y);
        if let Err(e) = local.index() {
            warn!(%peer, error = %e, "dropping block edit");
            return;
        }
        let applied = self
            .chunks
            .set_block(edit.chunk, local, layer, edit.value)
            .map(|_| ());
        self.record(applied);
    }
}

impl ServerHooks for ServerWorld {
    fn on_peer_connected(
        &mut self,
        peer: &Peer,
        outbox: &mut Outbox,
        now: SimTime,
    ) -> Result<(), NetError> {
        self.replication.seed_peer(peer.id, outbox)?;
        let kind = EntityKind::Player {
            name: peer.name.clone(),
        };
        let player_entity = self
            .replication
            .spawn(peer.id, kind, self.spawn_point, now, outbox)?;
        outbox.send(
            peer.id,
            &Welcome {
                peer_id: peer.id,
                player_entity,
            },
        )?;
        info!(peer = %peer.id, entity = player_entity, "player joined");
        Ok(())
    }

    fn on_peer_disconnected(
        &mut self,
        peer: &Peer,
        outbox: &mut Outbox,
        _now: SimTime,
    ) -> Result<(), NetError> {
        let removed = self.replication.despawn_owned_by(peer.id, outbox)?;
        self.chunks.remove_observer(peer.id);
        info!(peer = %peer.id, despawned = removed.len(), "player left");
        Ok(())
    }
}

/// Multiplayer server with networking.
pub struct MultiplayerServer {
    session: ServerSession<ServerWorld>,
    world: ServerWorld,
    clock: SimTime,
    tick: u64,
    local_addr: Option<SocketAddr>,
}

impl MultiplayerServer {
    /// Create a server over any transport, generating terrain from the
    /// configured seed.
    pub fn new(transport: Box<dyn ServerTransport>, settings: ServerSettings) -> Result<Self> {
        let generator = Box::new(TerrainGenerator::new(settings.world_seed));
        Self::with_generator(transport, settings, generator)
    }

    /// Create a server with a custom chunk generator.
    pub fn with_generator(
        transport: Box<dyn ServerTransport>,
        settings: ServerSettings,
        generator: Box<dyn ChunkGenerator>,
    ) -> Result<Self> {
        let registry = Arc::new(protocol_registry());
        let mut session = ServerSession::new(registry, transport, settings.session.clone());
        register_handlers(&mut session).context("Failed to register server handlers")?;

        info!(
            world_seed = settings.world_seed,
            max_peers = settings.session.max_peers,
            "Multiplayer server created"
        );
        Ok(Self {
            session,
            world: ServerWorld::new(&settings, generator),
            clock: SimTime::ZERO,
            tick: 0,
            local_addr: None,
        })
    }

    /// Create a server on an in-process loopback network.
    pub fn loopback(network: &LoopbackNetwork, settings: ServerSettings) -> Result<Self> {
        Self::new(Box::new(network.server_transport()), settings)
    }

    /// Create a QUIC server bound to `addr`. Must be called inside a tokio runtime.
    pub fn bind(addr: SocketAddr, settings: ServerSettings) -> Result<Self> {
        let transport = QuicServerTransport::bind(addr).context("Failed to bind server endpoint")?;
        let local_addr = transport.local_addr();
        info!("Multiplayer server bound to {}", local_addr);

        let mut server = Self::new(Box::new(transport), settings)?;
        server.local_addr = Some(local_addr);
        Ok(server)
    }

    /// Run one tick: drain the network, advance replication and chunk
    /// streaming, then flush everything queued.
    #[instrument(skip(self), fields(tick = self.tick, peers = self.session.roster().len()))]
    pub fn update(&mut self, dt: Duration) -> Result<()> {
        self.clock = self.clock.advance(dt);
        let now = self.clock;

        let events = self
            .session
            .poll(&mut self.world, now)
            .context("Failed to process transport events")?;
        if let Some(fault) = self.world.fault.take() {
            return Err(fault.context("Message handler failed"));
        }

        let outbox = self.session.outbox_mut();
        if let Some(batch) = self.world.replication.tick(now) {
            outbox
                .broadcast(&batch)
                .context("Failed to queue entity moves")?;
        }
        self.world
            .chunks
            .tick(outbox)
            .context("Failed to stream chunks")?;

        let sent = self.session.flush().context("Failed to flush outbox")?;
        debug!(events, sent, "server tick complete");
        self.tick += 1;
        Ok(())
    }

    /// Spawn a world-owned mob and announce it.
    pub fn spawn_mob(&mut self, species: u16, health: u16, position: Vec2) -> Result<EntityId> {
        let kind = EntityKind::Mob { species, health };
        let id = self
            .world
            .replication
            .spawn(PeerId::WORLD, kind, position, self.clock, self.session.outbox_mut())?;
        Ok(id)
    }

    /// Despawn an entity. Unknown ids are ignored.
    pub fn despawn(&mut self, id: EntityId) -> Result<bool> {
        let removed = self
            .world
            .replication
            .despawn(id, self.session.outbox_mut())?;
        Ok(removed.is_some())
    }

    /// Move a world-owned entity; it is broadcast on the next send window.
    pub fn move_entity(&mut self, id: EntityId, position: Vec2) -> bool {
        self.world.replication.move_entity(id, position)
    }

    /// Edit a loaded chunk. Returns false when the chunk is not loaded.
    pub fn set_block(
        &mut self,
        chunk: ChunkPos,
        local: LocalPos,
        layer: Layer,
        value: TileId,
    ) -> Result<bool> {
        let applied = self.world.chunks.set_block(chunk, local, layer, value)?;
        Ok(applied)
    }

    /// Disconnect a peer.
    pub fn kick(&mut self, peer: PeerId) -> Result<()> {
        self.session.kick(peer)?;
        Ok(())
    }

    /// Host state.
    pub fn world(&self) -> &ServerWorld {
        &self.world
    }

    /// Connected peers.
    pub fn roster(&self) -> &PeerRoster {
        self.session.roster()
    }

    /// Number of connected peers.
    pub fn client_count(&self) -> usize {
        self.session.roster().len()
    }

    /// Simulation clock.
    pub fn clock(&self) -> SimTime {
        self.clock
    }

    /// Ticks run so far.
    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    /// Bound address for QUIC servers.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

fn register_handlers(session: &mut ServerSession<ServerWorld>) -> Result<(), NetError> {
    let dispatcher = session.dispatcher_mut();
    dispatcher.register_handler::<MoveBatch, _>(|world: &mut ServerWorld, batch, cx| {
        world.handle_move_batch(batch, cx)
    })?;
    dispatcher.register_handler::<ChunkSubscribe, _>(|world: &mut ServerWorld, m, cx| {
        let subscribed = world.chunks.subscribe(cx.sender.id, m.position, cx.outbox);
        world.record(subscribed);
    })?;
    dispatcher.register_handler::<ChunkUnsubscribe, _>(|world: &mut ServerWorld, m, cx| {
        world.chunks.unsubscribe(cx.sender.id, m.position)
    })?;
    dispatcher.register_handler::<BlockEdit, _>(|world: &mut ServerWorld, edit, cx| {
        world.handle_block_edit(edit, cx)
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use skylark_net::protocol::{ChunkData, DespawnEntity, EntityMove, SpawnEntity};
    use skylark_net::{ClientHooks, ClientSession, LoopbackClientTransport};
    use skylark_world::FlatGenerator;

    const TICK: Duration = Duration::from_millis(10);

    #[derive(Default)]
    struct Inbox {
        welcome: Option<Welcome>,
        spawns: Vec<SpawnEntity>,
        despawns: Vec<EntityId>,
        batches: Vec<MoveBatch>,
        chunks: Vec<ChunkData>,
    }

    impl ClientHooks for Inbox {}

    fn client(network: &LoopbackNetwork, id: u64) -> ClientSession<Inbox> {
        let registry = Arc::new(protocol_registry());
        let handshake = ClientSession::<Inbox>::handshake(&registry, PeerId(id), "tester")
            .encode()
            .unwrap();
        let transport: LoopbackClientTransport = network.connect(handshake);
        let connection = transport.connection();
        let mut session =
            ClientSession::new(registry, Box::new(transport), connection, PeerId(id), "tester");
        let d = session.dispatcher_mut();
        d.register_handler::<Welcome, _>(|s: &mut Inbox, m, _| s.welcome = Some(m.clone()))
            .unwrap();
        d.register_handler::<SpawnEntity, _>(|s: &mut Inbox, m, _| s.spawns.push(m.clone()))
            .unwrap();
        d.register_handler::<DespawnEntity, _>(|s: &mut Inbox, m, _| s.despawns.push(m.entity_id))
            .unwrap();
        d.register_handler::<MoveBatch, _>(|s: &mut Inbox, m, _| s.batches.push(m.clone()))
            .unwrap();
        d.register_handler::<ChunkData, _>(|s: &mut Inbox, m, _| s.chunks.push(m.clone()))
            .unwrap();
        session
    }

    fn server(network: &LoopbackNetwork) -> MultiplayerServer {
        MultiplayerServer::with_generator(
            Box::new(network.server_transport()),
            ServerSettings::default(),
            Box::new(FlatGenerator::default()),
        )
        .unwrap()
    }

    fn pump(
        server: &mut MultiplayerServer,
        clients: &mut [(&mut ClientSession<Inbox>, &mut Inbox)],
    ) {
        server.update(TICK).unwrap();
        for (session, inbox) in clients.iter_mut() {
            session.poll(inbox, server.clock());
            session.flush().unwrap();
        }
    }

    #[test]
    fn test_join_sends_welcome_and_player_spawn() {
        let network = LoopbackNetwork::new();
        let mut server = server(&network);
        let mut alice = client(&network, 1);
        let mut inbox = Inbox::default();

        pump(&mut server, &mut [(&mut alice, &mut inbox)]);

        let welcome = inbox.welcome.clone().unwrap();
        assert_eq!(welcome.peer_id, PeerId(1));
        assert_eq!(inbox.spawns.len(), 1);
        assert_eq!(inbox.spawns[0].entity_id, welcome.player_entity);
        assert_eq!(inbox.spawns[0].owner, PeerId(1));
        assert_eq!(server.client_count(), 1);
    }

    #[test]
    fn test_newcomer_is_seeded_and_leaver_is_despawned() {
        let network = LoopbackNetwork::new();
        let mut server = server(&network);
        let mut alice = client(&network, 1);
        let mut a_inbox = Inbox::default();
        pump(&mut server, &mut [(&mut alice, &mut a_inbox)]);
        let alice_entity = a_inbox.welcome.clone().unwrap().player_entity;

        let mut bob = client(&network, 2);
        let mut b_inbox = Inbox::default();
        pump(&mut server, &mut [(&mut alice, &mut a_inbox), (&mut bob, &mut b_inbox)]);

        // Bob sees Alice's player plus his own; Alice sees Bob arrive.
        assert_eq!(b_inbox.spawns.len(), 2);
        assert_eq!(a_inbox.spawns.len(), 2);

        alice.disconnect();
        pump(&mut server, &mut [(&mut bob, &mut b_inbox)]);
        assert_eq!(b_inbox.despawns, vec![alice_entity]);
        assert!(server.world().replication().get(alice_entity).is_none());
    }

    #[test]
    fn test_foreign_moves_are_not_relayed() {
        let network = LoopbackNetwork::new();
        let mut server = server(&network);
        let mut alice = client(&network, 1);
        let mut bob = client(&network, 2);
        let (mut a_inbox, mut b_inbox) = (Inbox::default(), Inbox::default());
        pump(&mut server, &mut [(&mut alice, &mut a_inbox), (&mut bob, &mut b_inbox)]);
        let bob_entity = b_inbox.welcome.clone().unwrap().player_entity;

        alice
            .send(&MoveBatch {
                moves: vec![EntityMove {
                    entity_id: bob_entity,
                    position: Vec2::new(9.0, 9.0),
                }],
            })
            .unwrap();
        alice.flush().unwrap();
        pump(&mut server, &mut [(&mut alice, &mut a_inbox), (&mut bob, &mut b_inbox)]);

        assert!(b_inbox.batches.is_empty());
    }

    #[test]
    fn test_block_edit_requires_observation() {
        let network = LoopbackNetwork::new();
        let mut server = server(&network);
        let mut alice = client(&network, 1);
        let mut inbox = Inbox::default();
        pump(&mut server, &mut [(&mut alice, &mut inbox)]);

        let chunk = ChunkPos::new(0, 0);
        let edit = BlockEdit {
            chunk,
            x: 1,
            y: 2,
            layer: Layer::Object as u8,
            value: 5,
        };
        alice.send(&edit).unwrap();
        alice.flush().unwrap();
        pump(&mut server, &mut [(&mut alice, &mut inbox)]);
        assert!(inbox.chunks.is_empty());
        assert!(!server.world().chunks().is_loaded(chunk));

        alice.send(&ChunkSubscribe { position: chunk }).unwrap();
        alice.flush().unwrap();
        pump(&mut server, &mut [(&mut alice, &mut inbox)]);
        assert_eq!(inbox.chunks.len(), 1);

        alice.send(&edit).unwrap();
        alice.send(&BlockEdit { x: 40, ..edit }).unwrap();
        alice.flush().unwrap();
        pump(&mut server, &mut [(&mut alice, &mut inbox)]);

        assert_eq!(inbox.chunks.len(), 2);
        assert_eq!(inbox.chunks[1].object[2 * 16 + 1], 5);
    }
}
