//! Full-protocol scenarios: backend and frontends exchanging encoded wire
//! payloads, converging on one timeline.

mod common;

use common::{init_tracing, scripted_cmd, FoldSim};
use lockstep_rollback::wire::codec;
use lockstep_rollback::{
    BackendSyncEngine, BattleRegistry, DownsyncSnapshot, FrontendSyncEngine, IfdId, JoinIndex,
    RdfId, UpsyncSnapshot,
};

const P1: JoinIndex = JoinIndex::new(1);
const P2: JoinIndex = JoinIndex::new(2);

/// Encodes and decodes a payload, standing in for the transport.
fn over_the_wire<T>(value: &T) -> T
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    let bytes = codec::encode(value).expect("encode");
    let (back, consumed) = codec::decode(&bytes).expect("decode");
    assert_eq!(consumed, bytes.len());
    back
}

fn scripted_batch(join_index: JoinIndex, st: i32, ed_inclusive: i32) -> UpsyncSnapshot {
    let cmd_list = (st..=ed_inclusive)
        .map(|id| scripted_cmd(join_index, IfdId::new(id)))
        .collect();
    UpsyncSnapshot::new(join_index, IfdId::new(st), cmd_list)
}

/// One blind client tick: record the scripted local input, advance the timer.
fn play_tick(client: &mut FrontendSyncEngine<u64>, join_index: JoinIndex) {
    let ids = client.rdf_and_ifd_ids();
    client.upsert_self_cmd(scripted_cmd(join_index, ids.to_gen_ifd_id));
    client.step(&mut FoldSim).expect("client step");
}

/// Applies a broadcast, chases back to the live tick, then plays a few more
/// ticks so later frames exist for comparison.
fn absorb_broadcast(
    client: &mut FrontendSyncEngine<u64>,
    join_index: JoinIndex,
    broadcast: &DownsyncSnapshot<u64>,
    extra_ticks: usize,
) {
    client
        .on_downsync_snapshot_received(broadcast)
        .expect("downsync");
    while client.rdf_and_ifd_ids().chaser_rdf_id < client.rdf_and_ifd_ids().timer_rdf_id {
        client.chase_rolled_back_rdfs(&mut FoldSim).expect("chase");
    }
    for _ in 0..extra_ticks {
        play_tick(client, join_index);
    }
}

#[test]
fn clients_and_server_converge_after_broadcast() {
    init_tracing();
    let mut server = BackendSyncEngine::new(2, 0u64);
    let mut client1 = FrontendSyncEngine::new(2, P1, 0u64);
    let mut client2 = FrontendSyncEngine::new(2, P2, 0u64);

    // Both clients play 40 ticks blind, predicting each other as silent.
    for _ in 0..40 {
        play_tick(&mut client1, P1);
        play_tick(&mut client2, P2);
    }
    assert_eq!(client1.rdf_and_ifd_ids().timer_rdf_id, RdfId::new(40));

    // 40 ticks generated input frames 0..=9; both upsync to the server.
    let batch1: UpsyncSnapshot = over_the_wire(&scripted_batch(P1, 0, 9));
    let outcome1 = server
        .on_upsync_snapshot_received(&mut FoldSim, &batch1, true, false)
        .expect("p1 upsync");
    assert!(outcome1.accepted);
    assert!(outcome1.snapshot.is_none());

    let batch2: UpsyncSnapshot = over_the_wire(&scripted_batch(P2, 0, 9));
    let outcome2 = server
        .on_upsync_snapshot_received(&mut FoldSim, &batch2, false, true)
        .expect("p2 upsync");
    assert_eq!(outcome2.new_lcac_ifd_id, IfdId::new(9));
    assert_eq!(outcome2.min_input_front_id, IfdId::new(9));
    let broadcast = outcome2.snapshot.expect("confirmation snapshot");
    assert_eq!(broadcast.st_ifd_id, IfdId::new(0));
    assert_eq!(broadcast.ifd_batch.len(), 10);

    // The server advances its own dynamics over the confirmed span.
    let step_outcome = server
        .move_forward_lcac_and_step(&mut FoldSim, false)
        .expect("server step");
    assert_eq!(step_outcome.new_dynamics_rdf_id, RdfId::new(42));

    // Both clients apply the broadcast, rewind over mispredicted peer input,
    // chase back to their live tick, then play a few more ticks so that
    // frame 42 exists client-side too.
    let broadcast: DownsyncSnapshot<u64> = over_the_wire(&broadcast);
    absorb_broadcast(&mut client1, P1, &broadcast, 3);
    absorb_broadcast(&mut client2, P2, &broadcast, 3);
    assert_eq!(client1.rdf_and_ifd_ids().lcac_ifd_id, IfdId::new(9));

    // Frame 42 is the last frame derived purely from confirmed inputs; every
    // participant must agree on it exactly.
    let reference = server.rdf(RdfId::new(42)).copied().expect("server rdf 42");
    assert_eq!(client1.rdf(RdfId::new(42)), Some(&reference));
    assert_eq!(client2.rdf(RdfId::new(42)), Some(&reference));
}

#[test]
fn forced_confirmation_snapshot_bootstraps_a_lagging_client() {
    init_tracing();
    let mut server = BackendSyncEngine::new(2, 0u64);

    // Player 1 runs far ahead while player 2 never reports.
    let outcome = server
        .on_upsync_snapshot_received(&mut FoldSim, &scripted_batch(P1, 0, 120), true, false)
        .expect("warmup");
    assert_eq!(outcome.forced_confirmation_cnt, 0);
    let outcome = server
        .on_upsync_snapshot_received(&mut FoldSim, &scripted_batch(P1, 459, 600), true, false)
        .expect("runahead");
    assert_eq!(outcome.forced_confirmation_cnt, 150);
    assert_eq!(outcome.new_lcac_ifd_id, IfdId::new(149));
    let forced = outcome.snapshot.expect("forced snapshot");
    assert_eq!(forced.st_ifd_id, IfdId::new(0));
    assert_eq!(forced.ifd_batch.len(), 150);

    // Player 2 joins fresh: the forced history plus a reference frame is all
    // it takes to enter the battle at the live frontier.
    let mut late_client = FrontendSyncEngine::new(2, P2, 0u64);
    let forced: DownsyncSnapshot<u64> = over_the_wire(&forced);
    late_client
        .on_downsync_snapshot_received(&forced)
        .expect("forced downsync");
    assert_eq!(late_client.rdf_and_ifd_ids().lcac_ifd_id, IfdId::new(149));
    let sample = late_client
        .input_store()
        .get(IfdId::new(130))
        .expect("finalized frame");
    assert_eq!(
        sample.input_list.as_slice(),
        forced.ifd_batch[130].input_list.as_slice()
    );

    let reseed = server
        .move_forward_lcac_and_step(&mut FoldSim, true)
        .expect("reseed snapshot");
    let reseed_snapshot: DownsyncSnapshot<u64> =
        over_the_wire(&reseed.snapshot.expect("ref snapshot"));
    assert_eq!(reseed_snapshot.ref_rdf_id, Some(RdfId::new(602)));
    late_client
        .on_downsync_snapshot_received(&reseed_snapshot)
        .expect("reseed downsync");
    let ids = late_client.rdf_and_ifd_ids();
    assert_eq!(ids.timer_rdf_id, RdfId::new(602));
    assert_eq!(ids.chaser_rdf_id_lower_bound, RdfId::new(602));
    assert_eq!(
        late_client.rdf(RdfId::new(602)),
        server.latest_rdf().copied().as_ref()
    );

    // And it can tick forward immediately.
    let timer = late_client.step(&mut FoldSim).expect("post-reseed step");
    assert_eq!(timer, RdfId::new(603));
}

#[test]
fn registry_reuses_battle_instances() {
    let registry: BattleRegistry<BackendSyncEngine<u64>> = BattleRegistry::new();
    let handle = registry
        .create(42, BackendSyncEngine::new(2, 0u64))
        .expect("create");

    {
        let mut server = handle.lock();
        server
            .on_upsync_snapshot_received(&mut FoldSim, &scripted_batch(P1, 0, 5), true, false)
            .expect("upsync");
        server
            .on_upsync_snapshot_received(&mut FoldSim, &scripted_batch(P2, 0, 5), false, true)
            .expect("upsync");
        assert_eq!(server.lcac_ifd_id(), IfdId::new(5));

        // Same instance, next match: everything restarts from frame 0.
        server.reset_start_rdf(0u64);
        assert_eq!(server.lcac_ifd_id(), IfdId::NULL);
        assert_eq!(server.cur_dynamics_rdf_id(), RdfId::new(0));
        assert_eq!(server.input_store().count(), 0);
    }

    assert!(registry.destroy(42).is_some());
    assert!(registry.get(42).is_none());
}
