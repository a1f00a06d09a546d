//! Entity replication: throttled position broadcast for entities this process
//! drives, buffered interpolation for everything else.
//!
//! Uses BTreeMap for deterministic iteration order, so two engines fed the same
//! inputs emit identical batches and positions.

use crate::config::ReplicationConfig;
use crate::error::NetError;
use crate::observer::ObserverList;
use crate::outbox::Outbox;
use crate::protocol::{DespawnEntity, EntityKind, EntityMove, MoveBatch, SpawnEntity};
use skylark_core::{EntityId, PeerId, SimTime, Vec2};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace, warn};

/// Which identity this engine acts as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    /// The authoritative server; drives world-owned entities.
    Server,
    /// A client; drives only entities owned by this peer.
    Client(PeerId),
}

impl Authority {
    /// Identity entities must carry to be driven locally.
    pub fn local_id(self) -> PeerId {
        match self {
            Authority::Server => PeerId::WORLD,
            Authority::Client(id) => id,
        }
    }

    /// Whether an entity owned by `owner` is driven by this process.
    ///
    /// A client never drives world-owned entities, even though their owner id
    /// is the server's.
    pub fn drives(self, owner: PeerId) -> bool {
        owner == self.local_id()
    }
}

/// A timestamped position sample for a remotely driven entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    /// Sampled position.
    pub position: Vec2,
    /// Local receipt time.
    pub timestamp: SimTime,
}

/// A replicated entity.
#[derive(Debug, Clone, PartialEq)]
pub struct GameEntity {
    /// Unique id.
    pub id: EntityId,
    /// Owning peer (`PeerId::WORLD` for world-owned).
    pub owner: PeerId,
    /// Kind-specific data.
    pub kind: EntityKind,
    /// Current (rendered) position.
    pub position: Vec2,
    /// Last position broadcast, or last position received.
    pub last_sent_position: Vec2,
    /// Time of the last broadcast.
    pub last_update_time: SimTime,
    /// Received snapshots, oldest first, timestamps non-decreasing.
    pub queued_movements: VecDeque<Snapshot>,
}

impl GameEntity {
    /// A freshly spawned entity at rest.
    pub fn new(
        id: EntityId,
        owner: PeerId,
        kind: EntityKind,
        position: Vec2,
        now: SimTime,
    ) -> Self {
        Self {
            id,
            owner,
            kind,
            position,
            last_sent_position: position,
            last_update_time: now,
            queued_movements: VecDeque::new(),
        }
    }

    /// Spawn message describing this entity.
    pub fn spawn_message(&self) -> SpawnEntity {
        SpawnEntity {
            entity_id: self.id,
            owner: self.owner,
            kind: self.kind.clone(),
            position: self.position,
        }
    }
}

/// Emitted when an entity's position changes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityMoved {
    /// Entity id.
    pub entity_id: EntityId,
    /// New position.
    pub position: Vec2,
}

/// Host-facing notification slots.
#[derive(Default)]
pub struct EntityObservers {
    /// Fired after an entity is added.
    pub spawned: ObserverList<GameEntity>,
    /// Fired after an entity is removed.
    pub despawned: ObserverList<GameEntity>,
    /// Fired after an entity's position changes.
    pub moved: ObserverList<EntityMoved>,
}

/// Interpolation factor for `render_time` between two snapshot times.
///
/// Clamped to `[0, 1]`; a zero or negative span yields 1.
pub fn interpolation_factor(t0: SimTime, t1: SimTime, render_time: SimTime) -> f64 {
    let span = t1.since(t0);
    if span <= 0.0 {
        return 1.0;
    }
    (render_time.since(t0) / span).clamp(0.0, 1.0)
}

/// Advance `entity.position` along its snapshot queue. Returns true if the
/// position changed.
fn interpolate_queue(entity: &mut GameEntity, render_time: SimTime) -> bool {
    let queue = &mut entity.queued_movements;
    if queue.len() < 2 {
        return false;
    }
    while queue.len() > 2 && render_time > queue[1].timestamp {
        queue.pop_front();
    }

    let (from, to) = (queue[0], queue[1]);
    let factor = interpolation_factor(from.timestamp, to.timestamp, render_time);
    let position = from.position.lerp(to.position, factor as f32);
    if position == entity.position {
        return false;
    }
    entity.position = position;
    true
}

/// Owns every replicated entity for one process.
pub struct ReplicationEngine {
    authority: Authority,
    config: ReplicationConfig,
    entities: BTreeMap<EntityId, GameEntity>,
    next_entity_id: EntityId,
    observers: EntityObservers,
}

impl ReplicationEngine {
    /// Create an empty engine.
    pub fn new(authority: Authority, config: ReplicationConfig) -> Self {
        Self {
            authority,
            config,
            entities: BTreeMap::new(),
            next_entity_id: 1,
            observers: EntityObservers::default(),
        }
    }

    /// Identity this engine acts as.
    pub fn authority(&self) -> Authority {
        self.authority
    }

    /// Timing configuration.
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Notification slots.
    pub fn observers_mut(&mut self) -> &mut EntityObservers {
        &mut self.observers
    }

    /// Look up an entity.
    pub fn get(&self, id: EntityId) -> Option<&GameEntity> {
        self.entities.get(&id)
    }

    /// Entities in id order.
    pub fn entities(&self) -> impl Iterator<Item = &GameEntity> {
        self.entities.values()
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether there are no entities.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    fn insert(&mut self, entity: GameEntity) {
        self.next_entity_id = self.next_entity_id.max(entity.id.saturating_add(1));
        self.observers.spawned.notify(&entity);
        self.entities.insert(entity.id, entity);
    }

    /// Create an entity and announce it to every peer.
    pub fn spawn(
        &mut self,
        owner: PeerId,
        kind: EntityKind,
        position: Vec2,
        now: SimTime,
        outbox: &mut Outbox,
    ) -> Result<EntityId, NetError> {
        let id = self.next_entity_id;
        let entity = GameEntity::new(id, owner, kind, position, now);
        outbox.broadcast(&entity.spawn_message())?;
        debug!(entity = id, %owner, "spawned entity");
        self.insert(entity);
        Ok(id)
    }

    /// Apply a spawn received from the server. A known id is replaced.
    pub fn apply_spawn(&mut self, spawn: &SpawnEntity, now: SimTime) {
        trace!(entity = spawn.entity_id, owner = %spawn.owner, "spawn received");
        self.insert(GameEntity::new(
            spawn.entity_id,
            spawn.owner,
            spawn.kind.clone(),
            spawn.position,
            now,
        ));
    }

    /// Send one spawn per existing entity to `peer`.
    pub fn seed_peer(&self, peer: PeerId, outbox: &mut Outbox) -> Result<(), NetError> {
        for entity in self.entities.values() {
            outbox.send(peer, &entity.spawn_message())?;
        }
        debug!(%peer, entities = self.entities.len(), "seeded peer");
        Ok(())
    }

    /// Remove an entity and announce it. Unknown ids are ignored.
    pub fn despawn(
        &mut self,
        id: EntityId,
        outbox: &mut Outbox,
    ) -> Result<Option<GameEntity>, NetError> {
        if !self.entities.contains_key(&id) {
            return Ok(None);
        }
        outbox.broadcast(&DespawnEntity { entity_id: id })?;
        debug!(entity = id, "despawned entity");
        Ok(self.apply_despawn(id))
    }

    /// Remove an entity locally. Unknown ids are ignored.
    pub fn apply_despawn(&mut self, id: EntityId) -> Option<GameEntity> {
        let entity = self.entities.remove(&id)?;
        self.observers.despawned.notify(&entity);
        Some(entity)
    }

    /// Despawn every entity owned by `owner`.
    pub fn despawn_owned_by(
        &mut self,
        owner: PeerId,
        outbox: &mut Outbox,
    ) -> Result<Vec<EntityId>, NetError> {
        let owned: Vec<EntityId> = self
            .entities
            .values()
            .filter(|e| e.owner == owner)
            .map(|e| e.id)
            .collect();
        for &id in &owned {
            self.despawn(id, outbox)?;
        }
        Ok(owned)
    }

    /// Set the position of an entity this process drives. Returns false for
    /// unknown or remotely driven entities.
    pub fn move_entity(&mut self, id: EntityId, position: Vec2) -> bool {
        let authority = self.authority;
        let Some(entity) = self.entities.get_mut(&id) else {
            return false;
        };
        if !authority.drives(entity.owner) {
            debug!(entity = id, "ignoring local move of remotely driven entity");
            return false;
        }
        if entity.position != position {
            entity.position = position;
            self.observers.moved.notify(&EntityMoved {
                entity_id: id,
                position,
            });
        }
        true
    }

    /// Run one replication step.
    ///
    /// Returns the batch of driven entities due for broadcast, if any. Remote
    /// entities advance along their snapshot queues as a side effect.
    pub fn tick(&mut self, now: SimTime) -> Option<MoveBatch> {
        let render_time = now.offset(-self.config.render_delay_ms);
        let mut batch = MoveBatch::default();
        let mut moved = Vec::new();

        for entity in self.entities.values_mut() {
            if entity.position == entity.last_sent_position {
                continue;
            }
            if self.authority.drives(entity.owner) {
                if now.since(entity.last_update_time) >= self.config.min_send_interval_ms {
                    batch.moves.push(EntityMove {
                        entity_id: entity.id,
                        position: entity.position,
                    });
                    entity.last_sent_position = entity.position;
                    entity.last_update_time = now;
                }
            } else if interpolate_queue(entity, render_time) {
                moved.push(EntityMoved {
                    entity_id: entity.id,
                    position: entity.position,
                });
            }
        }

        for event in &moved {
            self.observers.moved.notify(event);
        }

        if batch.is_empty() {
            None
        } else {
            trace!(moves = batch.moves.len(), "move batch ready");
            Some(batch)
        }
    }

    /// Queue received positions as snapshots.
    ///
    /// Returns the accepted subset. The server only accepts moves for entities
    /// owned by `sender`; a client skips moves for entities it drives.
    pub fn apply_move_batch(
        &mut self,
        batch: &MoveBatch,
        now: SimTime,
        sender: PeerId,
    ) -> MoveBatch {
        let max_queued = self.config.max_queued_snapshots.max(2);
        let mut accepted = MoveBatch::default();

        for m in &batch.moves {
            if !m.position.is_finite() {
                warn!(
                    peer = %sender,
                    entity = m.entity_id,
                    "dropping move with non-finite position"
                );
                continue;
            }
            let Some(entity) = self.entities.get_mut(&m.entity_id) else {
                continue;
            };
            match self.authority {
                Authority::Server if entity.owner != sender => {
                    warn!(
                        peer = %sender,
                        entity = m.entity_id,
                        owner = %entity.owner,
                        "dropping move for entity not owned by sender"
                    );
                    continue;
                }
                Authority::Client(_) if self.authority.drives(entity.owner) => continue,
                _ => {}
            }

            let timestamp = entity
                .queued_movements
                .back()
                .map_or(now, |last| {
                    if last.timestamp > now {
                        last.timestamp
                    } else {
                        now
                    }
                });
            if entity.queued_movements.len() >= max_queued {
                entity.queued_movements.pop_front();
            }
            entity.queued_movements.push_back(Snapshot {
                position: m.position,
                timestamp,
            });
            entity.last_sent_position = m.position;
            accepted.moves.push(*m);
        }
        accepted
    }
}
