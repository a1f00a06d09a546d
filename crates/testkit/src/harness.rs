//! In-process server + clients driven in lockstep over the loopback transport.

use anyhow::{Context, Result};
use skylark_core::PeerId;
use skylark_client::MultiplayerClient;
use skylark_net::{LoopbackNetwork, ReplicationConfig};
use skylark_server::{MultiplayerServer, ServerSettings};
use skylark_world::ChunkGenerator;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

/// Default frame length for harness steps.
pub const DEFAULT_FRAME: Duration = Duration::from_millis(10);

/// One server and any number of clients on a shared loopback network.
pub struct LoopbackHarness {
    /// The shared in-memory network.
    pub network: LoopbackNetwork,
    /// Authoritative host.
    pub server: MultiplayerServer,
    /// Joined clients, in join order.
    pub clients: Vec<MultiplayerClient>,
    /// Time each step advances every participant.
    pub frame: Duration,
    replication: ReplicationConfig,
}

impl LoopbackHarness {
    /// Server generating terrain from `settings.world_seed`.
    pub fn new(settings: ServerSettings) -> Result<Self> {
        let network = LoopbackNetwork::new();
        let replication = settings.replication.clone();
        let server = MultiplayerServer::loopback(&network, settings)?;
        Ok(Self::assemble(network, server, replication))
    }

    /// Server with a custom chunk generator.
    pub fn with_generator(
        settings: ServerSettings,
        generator: Box<dyn ChunkGenerator>,
    ) -> Result<Self> {
        let network = LoopbackNetwork::new();
        let replication = settings.replication.clone();
        let server = MultiplayerServer::with_generator(
            Box::new(network.server_transport()),
            settings,
            generator,
        )?;
        Ok(Self::assemble(network, server, replication))
    }

    fn assemble(
        network: LoopbackNetwork,
        server: MultiplayerServer,
        replication: ReplicationConfig,
    ) -> Self {
        Self {
            network,
            server,
            clients: Vec::new(),
            frame: DEFAULT_FRAME,
            replication,
        }
    }

    /// Start connecting a client. Returns its index; it is connected after the
    /// next [`step`](Self::step).
    pub fn join(&mut self, id: u64, name: &str) -> Result<usize> {
        let client =
            MultiplayerClient::loopback(&self.network, PeerId(id), name, self.replication.clone())
                .with_context(|| format!("Failed to create client {id}"))?;
        self.clients.push(client);
        Ok(self.clients.len() - 1)
    }

    /// Client by join index.
    pub fn client(&self, index: usize) -> &MultiplayerClient {
        &self.clients[index]
    }

    /// Mutable client by join index.
    pub fn client_mut(&mut self, index: usize) -> &mut MultiplayerClient {
        &mut self.clients[index]
    }

    /// Update the server, then every client, by one frame.
    pub fn step(&mut self) -> Result<()> {
        self.server.update(self.frame).context("server update")?;
        for client in &mut self.clients {
            client.update(self.frame).context("client update")?;
        }
        Ok(())
    }

    /// Run `frames` steps.
    pub fn run(&mut self, frames: usize) -> Result<()> {
        for _ in 0..frames {
            self.step()?;
        }
        Ok(())
    }
}

/// Shared list an observer callback can append to.
#[derive(Debug)]
pub struct Recorder<T> {
    items: Rc<RefCell<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self {
            items: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl<T: Clone + 'static> Recorder<T> {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Callback that records `map(event)` for every event it sees.
    pub fn sink<E: 'static>(&self, map: impl Fn(&E) -> T + 'static) -> impl FnMut(&E) + 'static {
        let items = self.items.clone();
        move |event: &E| items.borrow_mut().push(map(event))
    }

    /// Snapshot of everything recorded.
    pub fn items(&self) -> Vec<T> {
        self.items.borrow().clone()
    }

    /// Number of recorded values.
    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }
}
