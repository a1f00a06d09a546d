//! Chunk interest and streaming over the loopback transport.

use skylark_core::ChunkPos;
use skylark_server::ServerSettings;
use skylark_testkit::LoopbackHarness;
use skylark_world::{ChunkGenerator, Layer, LocalPos, TerrainGenerator};

fn settings(seed: u64) -> ServerSettings {
    ServerSettings {
        world_seed: seed,
        ..Default::default()
    }
}

#[test]
fn subscribed_chunk_streams_and_is_evicted_after_disconnect() {
    let mut harness = LoopbackHarness::new(settings(7)).unwrap();
    let c = harness.join(1, "alice").unwrap();
    harness.step().unwrap();

    let pos = ChunkPos::new(2, 3);
    harness.client_mut(c).request_chunk(pos).unwrap();
    harness.run(2).unwrap();

    let expected = TerrainGenerator::new(7).generate_chunk_at(pos);
    let cached = harness.client(c).world().chunk(pos).unwrap();
    assert_eq!(cached.position(), pos);
    assert_eq!(cached.layers(), expected.layers());
    assert!(harness.server.world().chunks().is_loaded(pos));

    harness.client_mut(c).disconnect();
    harness.step().unwrap();
    assert!(!harness.server.world().chunks().is_loaded(pos));
    assert_eq!(harness.server.world().chunks().loaded_count(), 0);
}

#[test]
fn edits_reach_every_observer() {
    let mut harness = LoopbackHarness::new(settings(3)).unwrap();
    let a = harness.join(1, "alice").unwrap();
    let b = harness.join(2, "bob").unwrap();
    let outsider = harness.join(3, "carol").unwrap();
    harness.step().unwrap();

    let pos = ChunkPos::new(0, -1);
    harness.client_mut(a).request_chunk(pos).unwrap();
    harness.client_mut(b).request_chunk(pos).unwrap();
    harness.run(2).unwrap();

    let local = LocalPos::new(4, 9);
    harness
        .client_mut(a)
        .edit_block(pos, local, Layer::Object, 77)
        .unwrap();
    harness.run(3).unwrap();

    for idx in [a, b] {
        let chunk = harness.client(idx).world().chunk(pos).unwrap();
        assert_eq!(chunk.tile(local, Layer::Object).unwrap(), 77);
    }
    assert!(harness.client(outsider).world().chunk(pos).is_none());
    assert_eq!(harness.client(outsider).world().cached_chunks(), 0);
}

#[test]
fn edits_from_non_observers_are_dropped() {
    let mut harness = LoopbackHarness::new(settings(3)).unwrap();
    let a = harness.join(1, "alice").unwrap();
    let b = harness.join(2, "bob").unwrap();
    harness.step().unwrap();

    let pos = ChunkPos::new(1, 1);
    harness.client_mut(a).request_chunk(pos).unwrap();
    harness.run(2).unwrap();
    let before = harness.client(a).world().chunk(pos).unwrap().clone();

    harness
        .client_mut(b)
        .edit_block(pos, LocalPos::new(0, 0), Layer::Ground, 999)
        .unwrap();
    harness.run(3).unwrap();

    assert_eq!(harness.client(a).world().chunk(pos).unwrap(), &before);
    assert_eq!(
        harness
            .server
            .world()
            .chunks()
            .chunk(pos)
            .unwrap()
            .layers(),
        before.layers()
    );
}

#[test]
fn released_chunk_is_evicted_and_regenerated_on_demand() {
    let mut harness = LoopbackHarness::new(settings(11)).unwrap();
    let c = harness.join(1, "alice").unwrap();
    harness.step().unwrap();

    let pos = ChunkPos::new(-4, 2);
    harness.client_mut(c).request_chunk(pos).unwrap();
    harness.run(2).unwrap();
    harness
        .client_mut(c)
        .edit_block(pos, LocalPos::new(1, 1), Layer::Object, 5)
        .unwrap();
    harness.run(2).unwrap();

    harness.client_mut(c).release_chunk(pos).unwrap();
    assert!(harness.client(c).world().chunk(pos).is_none());
    harness.run(2).unwrap();
    assert!(!harness.server.world().chunks().is_loaded(pos));

    // Unobserved edits are not kept; the chunk comes back as generated.
    harness.client_mut(c).request_chunk(pos).unwrap();
    harness.run(2).unwrap();
    let regenerated = harness.client(c).world().chunk(pos).unwrap();
    assert_eq!(
        regenerated.layers(),
        TerrainGenerator::new(11).generate_chunk_at(pos).layers()
    );
}
