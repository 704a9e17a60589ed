//! The client-side synchronization engine.
//!
//! A [`FrontendSyncEngine`] renders ahead of certainty: the live timer frame
//! advances every tick using whatever inputs are known, predicting the rest
//! from each player's input front. When a true input arrives (from a peer
//! over the fast channel, or from the server in a downsync snapshot) and
//! disagrees with what was predicted, the engine rewinds its *chaser*, the
//! frontier up to which rendered frames are known consistent, and
//! re-simulates forward in bounded increments, so one bad prediction costs a
//! few catch-up ticks instead of a frame-rate spike.
//!
//! Three render-frame cursors, always `lower_bound <= chaser <= timer`:
//!
//! - `timer_rdf_id`: the live tick; never rewound.
//! - `chaser_rdf_id`: everything before it is consistent with all inputs
//!   known so far; rewound on misprediction, advanced by chasing.
//! - `chaser_rdf_id_lower_bound`: rewinding below this is impossible (the
//!   history was evicted or replaced by an authoritative reseed).

use tracing::{debug, trace, warn};

use crate::confirmation::ConfirmationTracker;
use crate::error::SyncError;
use crate::input_store::InputFrameStore;
use crate::ring_buffer::FrameRingBuffer;
use crate::wire::messages::{DownsyncSnapshot, UpsyncSnapshot};
use crate::{
    FrameWindow, IfdId, JoinIndex, RdfId, TickSimulator, DEFAULT_MAX_CHASING_RDFS_PER_UPDATE,
};

/// Default render-frame history capacity for a client: enough to rewind over
/// several seconds of mispredicted frames.
pub const DEFAULT_FRONTEND_RDF_BUFFER_SIZE: usize = 512;

/// Default input-frame ring capacity for a client.
pub const DEFAULT_FRONTEND_INPUT_BUFFER_SIZE: usize = 256;

/// A read-only snapshot of every cursor the driving loop cares about.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SyncIds {
    /// The live tick id.
    pub timer_rdf_id: RdfId,
    /// The consistency frontier.
    pub chaser_rdf_id: RdfId,
    /// The floor below which rewinding is impossible.
    pub chaser_rdf_id_lower_bound: RdfId,
    /// The last consecutively all-confirmed input-frame id.
    pub lcac_ifd_id: IfdId,
    /// The input-frame id local input generated this tick belongs to.
    pub to_gen_ifd_id: IfdId,
    /// The input-frame id consumed when simulating the live tick.
    pub local_required_ifd_id: IfdId,
}

/// The client engine for one battle.
#[derive(Debug)]
pub struct FrontendSyncEngine<S> {
    window: FrameWindow,
    players_cnt: usize,
    self_join_index: JoinIndex,
    inactive_join_mask: u64,
    store: InputFrameStore,
    tracker: ConfirmationTracker,
    rdf_buffer: FrameRingBuffer<RdfId, S>,
    timer_rdf_id: RdfId,
    chaser_rdf_id: RdfId,
    chaser_rdf_id_lower_bound: RdfId,
    max_chasing_rdfs_per_update: i32,
}

impl<S: Clone> FrontendSyncEngine<S> {
    /// Creates a client engine with default capacities, seeded with the
    /// render state of frame 0.
    #[must_use]
    pub fn new(players_cnt: usize, self_join_index: JoinIndex, start_state: S) -> Self {
        Self::with_capacities(
            players_cnt,
            self_join_index,
            FrameWindow::default(),
            DEFAULT_FRONTEND_INPUT_BUFFER_SIZE,
            DEFAULT_FRONTEND_RDF_BUFFER_SIZE,
            start_state,
        )
    }

    /// Creates a client engine with explicit ring capacities.
    ///
    /// # Panics
    ///
    /// Panics if either capacity is zero, `players_cnt` is not in
    /// `1..=`[`MAX_PLAYERS`](crate::MAX_PLAYERS), or `self_join_index` is out
    /// of range.
    #[must_use]
    pub fn with_capacities(
        players_cnt: usize,
        self_join_index: JoinIndex,
        window: FrameWindow,
        ifd_buffer_capacity: usize,
        rdf_buffer_capacity: usize,
        start_state: S,
    ) -> Self {
        assert!(
            self_join_index.is_within(players_cnt),
            "self join index out of range"
        );
        let mut rdf_buffer = FrameRingBuffer::new(rdf_buffer_capacity);
        rdf_buffer.put(start_state);
        Self {
            window,
            players_cnt,
            self_join_index,
            inactive_join_mask: 0,
            store: InputFrameStore::new(ifd_buffer_capacity, players_cnt),
            tracker: ConfirmationTracker::new(),
            rdf_buffer,
            timer_rdf_id: RdfId::new(0),
            chaser_rdf_id: RdfId::new(0),
            chaser_rdf_id_lower_bound: RdfId::new(0),
            max_chasing_rdfs_per_update: DEFAULT_MAX_CHASING_RDFS_PER_UPDATE,
        }
    }

    /// Caps how many render frames one [`chase_rolled_back_rdfs`] call may
    /// re-simulate.
    ///
    /// [`chase_rolled_back_rdfs`]: Self::chase_rolled_back_rdfs
    pub fn set_max_chasing_rdfs_per_update(&mut self, max: i32) {
        self.max_chasing_rdfs_per_update = max.max(1);
    }

    /// The frame-window configuration in effect.
    #[inline]
    #[must_use]
    pub const fn window(&self) -> FrameWindow {
        self.window
    }

    /// Read access to the input history.
    #[inline]
    #[must_use]
    pub const fn input_store(&self) -> &InputFrameStore {
        &self.store
    }

    /// The render state at `rdf_id`, if still resident.
    #[must_use]
    pub fn rdf(&self, rdf_id: RdfId) -> Option<&S> {
        self.rdf_buffer.get(rdf_id)
    }

    /// All cursor positions in one read.
    #[must_use]
    pub fn rdf_and_ifd_ids(&self) -> SyncIds {
        SyncIds {
            timer_rdf_id: self.timer_rdf_id,
            chaser_rdf_id: self.chaser_rdf_id,
            chaser_rdf_id_lower_bound: self.chaser_rdf_id_lower_bound,
            lcac_ifd_id: self.tracker.lcac_ifd_id(),
            to_gen_ifd_id: self.window.generating_ifd_id(self.timer_rdf_id, 0),
            local_required_ifd_id: self.window.delayed_ifd_id(self.timer_rdf_id),
        }
    }

    /// Marks a player as inactive: its missing inputs are predicted as 0.
    pub fn set_player_inactive(&mut self, join_index: JoinIndex) -> Result<(), SyncError> {
        self.validate_join_index(join_index)?;
        self.inactive_join_mask |= join_index.mask();
        Ok(())
    }

    /// Marks a player as active again.
    pub fn set_player_active(&mut self, join_index: JoinIndex) -> Result<(), SyncError> {
        self.validate_join_index(join_index)?;
        self.inactive_join_mask &= !join_index.mask();
        Ok(())
    }

    fn validate_join_index(&self, join_index: JoinIndex) -> Result<(), SyncError> {
        if join_index.is_within(self.players_cnt) {
            Ok(())
        } else {
            Err(SyncError::InvalidJoinIndex {
                join_index,
                players_cnt: self.players_cnt,
            })
        }
    }

    /// Records this tick's local input at the input-frame id currently being
    /// generated, reliable-confirmed for self. Returns that id so the caller
    /// can build an upsync batch around it.
    ///
    /// If the recorded value differs from what was already stored (and
    /// possibly consumed by prediction), the rewind path is taken.
    pub fn upsert_self_cmd(&mut self, cmd: u64) -> IfdId {
        let ifd_id = self.window.generating_ifd_id(self.timer_rdf_id, 0);
        let outcome = self.store.upsert(
            ifd_id,
            self.self_join_index,
            cmd,
            true,
            false,
            self.inactive_join_mask,
        );
        if outcome.mutated_existing() {
            self.handle_incorrectly_rendered_prediction(ifd_id);
        }
        ifd_id
    }

    /// Merges a peer's upsync batch relayed over the fast channel.
    ///
    /// Merging stops early rather than evict input frames the live window
    /// still needs (ids at or below the timer's delayed input frame). Any
    /// merged value that contradicts a prediction rewinds the chaser. Returns
    /// how many commands were merged.
    pub fn on_upsync_snapshot_received(
        &mut self,
        batch: &UpsyncSnapshot,
    ) -> Result<usize, SyncError> {
        self.validate_join_index(batch.join_index)?;
        let n = self.store.capacity() as i32;
        let required_ifd_id = self.window.delayed_ifd_id(self.timer_rdf_id);
        let mut merged = 0;
        let mut first_mutated_ifd_id = IfdId::NULL;
        for (i, &cmd) in batch.cmd_list.iter().enumerate() {
            let ifd_id = batch.st_ifd_id + i as i32;
            if ifd_id <= self.tracker.lcac_ifd_id() {
                continue;
            }
            let post_st = ifd_id.as_i32() - n + 1;
            if post_st > required_ifd_id.as_i32() {
                trace!(
                    ifd_id = ifd_id.as_i32(),
                    required = required_ifd_id.as_i32(),
                    "peer batch runs ahead of live window, deferring the rest"
                );
                break;
            }
            let outcome = self.store.upsert(
                ifd_id,
                batch.join_index,
                cmd,
                false,
                true,
                self.inactive_join_mask,
            );
            if outcome.was_written() {
                merged += 1;
            }
            if outcome.mutated_existing() && first_mutated_ifd_id.is_null() {
                first_mutated_ifd_id = ifd_id;
            }
        }
        if !first_mutated_ifd_id.is_null() {
            self.handle_incorrectly_rendered_prediction(first_mutated_ifd_id);
        }
        Ok(merged)
    }

    /// Applies an authoritative downsync snapshot from the server.
    ///
    /// Batch frames at or below the watermark, or whose whole render span
    /// lies below the rewind floor, are skipped; the rest overwrite local
    /// history, advance the watermark, and rewind the chaser on mismatch.
    /// Without a usable reference render frame, the batch is dropped from the
    /// first frame whose eviction pressure would pass the live tick's delayed
    /// input frame. An embedded reference render frame then reseeds render
    /// history, which is how a client joins mid-battle or recovers from an
    /// irrecoverable prediction span.
    pub fn on_downsync_snapshot_received(
        &mut self,
        snapshot: &DownsyncSnapshot<S>,
    ) -> Result<(), SyncError> {
        let old_lower_bound = self.chaser_rdf_id_lower_bound;
        let n = self.store.capacity() as i32;
        let required_ifd_id = self.window.delayed_ifd_id(self.timer_rdf_id);
        // A reference frame below the rewind floor is a stale duplicate and
        // will be ignored, so it cannot excuse evicting live input frames.
        let ref_applicable = snapshot.ref_rdf.is_some()
            && snapshot
                .ref_rdf_id
                .is_some_and(|ref_rdf_id| ref_rdf_id >= old_lower_bound);
        let mut first_mutated_ifd_id = IfdId::NULL;
        for frame in &snapshot.ifd_batch {
            if frame.id <= self.tracker.lcac_ifd_id() {
                continue;
            }
            if self.window.last_used_rdf_id(frame.id) <= old_lower_bound {
                continue;
            }
            let post_st = frame.id.as_i32() - n + 1;
            if post_st > required_ifd_id.as_i32() && !ref_applicable {
                warn!(
                    ifd_id = frame.id.as_i32(),
                    required = required_ifd_id.as_i32(),
                    "downsync batch runs ahead of live window without a reseed, dropping the rest"
                );
                break;
            }
            let Some(mutated) = self
                .store
                .apply_authoritative(frame, self.inactive_join_mask)
            else {
                continue;
            };
            self.tracker.force_to(frame.id);
            if mutated && first_mutated_ifd_id.is_null() {
                first_mutated_ifd_id = frame.id;
            }
        }
        if !first_mutated_ifd_id.is_null() {
            debug!(
                ifd_id = first_mutated_ifd_id.as_i32(),
                "authoritative input contradicted prediction"
            );
            self.handle_incorrectly_rendered_prediction(first_mutated_ifd_id);
        }
        if let (Some(ref_rdf_id), Some(ref_rdf)) = (snapshot.ref_rdf_id, &snapshot.ref_rdf) {
            self.reseed_from_ref_rdf(ref_rdf_id, ref_rdf);
        }
        Ok(())
    }

    fn reseed_from_ref_rdf(&mut self, ref_rdf_id: RdfId, ref_rdf: &S) {
        if ref_rdf_id < self.chaser_rdf_id_lower_bound {
            // A duplicated or reordered snapshot; cursors never move backward.
            warn!(
                ref_rdf_id = ref_rdf_id.as_i32(),
                lower_bound = self.chaser_rdf_id_lower_bound.as_i32(),
                "stale reference render frame ignored"
            );
            return;
        }
        if let Some(slot) = self.rdf_buffer.get_mut(ref_rdf_id) {
            // Still resident: replace the prediction with the authoritative
            // state and re-simulate from it. Everything before it is now
            // server truth, so the rewind floor rises to match.
            *slot = ref_rdf.clone();
            self.chaser_rdf_id = ref_rdf_id;
            self.chaser_rdf_id_lower_bound = ref_rdf_id;
            debug!(
                ref_rdf_id = ref_rdf_id.as_i32(),
                "resident render frame replaced by authoritative state"
            );
            return;
        }
        // Out of window (joining, or hopelessly behind/ahead): restart render
        // history from the reference frame.
        self.rdf_buffer.reset_to(ref_rdf_id);
        self.rdf_buffer.put(ref_rdf.clone());
        self.timer_rdf_id = ref_rdf_id;
        self.chaser_rdf_id = ref_rdf_id;
        self.chaser_rdf_id_lower_bound = ref_rdf_id;
        debug!(
            ref_rdf_id = ref_rdf_id.as_i32(),
            "render history reseeded from reference frame"
        );
    }

    /// Rewinds the chaser so the render span of `mismatch_ifd_id` gets
    /// re-simulated.
    ///
    /// No-ops when the span is already ahead of the chaser, entirely in the
    /// future of the live tick, or wholly below the rewind floor (in that
    /// last, irrecoverable case only a reference-frame reseed can help).
    pub fn handle_incorrectly_rendered_prediction(&mut self, mismatch_ifd_id: IfdId) {
        let mut rdf1 = self.window.first_used_rdf_id(mismatch_ifd_id);
        if rdf1 > self.timer_rdf_id {
            return;
        }
        if self.window.last_used_rdf_id(mismatch_ifd_id) <= self.chaser_rdf_id_lower_bound {
            warn!(
                ifd_id = mismatch_ifd_id.as_i32(),
                lower_bound = self.chaser_rdf_id_lower_bound.as_i32(),
                "misprediction below the rewind floor, waiting for a reseed"
            );
            return;
        }
        rdf1 = rdf1
            .max(self.rdf_buffer.st_frame_id())
            .max(self.chaser_rdf_id_lower_bound);
        if rdf1 >= self.chaser_rdf_id {
            return;
        }
        trace!(
            ifd_id = mismatch_ifd_id.as_i32(),
            chaser = self.chaser_rdf_id.as_i32(),
            rewound_to = rdf1.as_i32(),
            "chaser rewound"
        );
        self.chaser_rdf_id = rdf1;
    }

    /// Advances the live tick by one, predicting any missing inputs, and
    /// returns the new timer id.
    pub fn step<T>(&mut self, sim: &mut T) -> Result<RdfId, SyncError>
    where
        T: TickSimulator<State = S>,
    {
        let from_rdf_id = self.timer_rdf_id;
        let ifd_id = self.window.delayed_ifd_id(from_rdf_id);
        let next = {
            let input = self
                .store
                .get_or_prefab(ifd_id, self.inactive_join_mask)
                .ok_or_else(|| SyncError::InvalidRequest {
                    info: format!("input frame {ifd_id} already evicted at the live tick"),
                })?;
            let state = self
                .rdf_buffer
                .get(from_rdf_id)
                .ok_or(SyncError::MissingRenderFrame {
                    rdf_id: from_rdf_id,
                })?;
            sim.step_one_tick(from_rdf_id, state, input)
        };
        self.rdf_buffer.put(next);
        self.timer_rdf_id += 1;
        if self.chaser_rdf_id == from_rdf_id {
            // Nothing pending to chase; the frontier moves with the timer.
            self.chaser_rdf_id = self.timer_rdf_id;
        }
        // Eviction at the far end raises the rewind floor.
        let st = self.rdf_buffer.st_frame_id();
        if st > self.chaser_rdf_id_lower_bound {
            self.chaser_rdf_id_lower_bound = st;
        }
        if st > self.chaser_rdf_id {
            self.chaser_rdf_id = st;
        }
        Ok(self.timer_rdf_id)
    }

    /// Re-simulates rolled-back frames toward the live tick, at most the
    /// configured maximum per call, and returns the new chaser id.
    pub fn chase_rolled_back_rdfs<T>(&mut self, sim: &mut T) -> Result<RdfId, SyncError>
    where
        T: TickSimulator<State = S>,
    {
        let chase_end = (self.chaser_rdf_id + self.max_chasing_rdfs_per_update)
            .min(self.timer_rdf_id);
        while self.chaser_rdf_id < chase_end {
            let from_rdf_id = self.chaser_rdf_id;
            let ifd_id = self.window.delayed_ifd_id(from_rdf_id);
            let next = {
                let input = self
                    .store
                    .get(ifd_id)
                    .ok_or_else(|| SyncError::InvalidRequest {
                        info: format!("input frame {ifd_id} already evicted while chasing"),
                    })?;
                let state =
                    self.rdf_buffer
                        .get(from_rdf_id)
                        .ok_or(SyncError::MissingRenderFrame {
                            rdf_id: from_rdf_id,
                        })?;
                sim.step_one_tick(from_rdf_id, state, input)
            };
            let slot =
                self.rdf_buffer
                    .get_mut(from_rdf_id + 1)
                    .ok_or(SyncError::MissingRenderFrame {
                        rdf_id: from_rdf_id + 1,
                    })?;
            *slot = next;
            self.chaser_rdf_id += 1;
        }
        Ok(self.chaser_rdf_id)
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::frame_info::InputFrame;

    // Order-sensitive accumulator: replaying different inputs, or the same
    // inputs in a different order, yields a different state.
    struct HashSim;

    impl TickSimulator for HashSim {
        type State = u64;

        fn step_one_tick(&mut self, from_rdf_id: RdfId, state: &u64, input: &InputFrame) -> u64 {
            let mut acc = state
                .wrapping_mul(31)
                .wrapping_add(from_rdf_id.as_i32() as u64);
            for &value in &input.input_list {
                acc = acc.wrapping_mul(31).wrapping_add(value);
            }
            acc
        }
    }

    const SELF: JoinIndex = JoinIndex::new(1);
    const PEER: JoinIndex = JoinIndex::new(2);

    fn engine() -> FrontendSyncEngine<u64> {
        FrontendSyncEngine::new(2, SELF, 0)
    }

    fn peer_batch(st: i32, values: Vec<u64>) -> UpsyncSnapshot {
        UpsyncSnapshot::new(PEER, IfdId::new(st), values)
    }

    #[test]
    fn stepping_advances_timer_and_chaser_together() {
        let mut engine = engine();
        for expected in 1..=10 {
            let timer = engine.step(&mut HashSim).unwrap();
            assert_eq!(timer, RdfId::new(expected));
        }
        let ids = engine.rdf_and_ifd_ids();
        assert_eq!(ids.timer_rdf_id, RdfId::new(10));
        assert_eq!(ids.chaser_rdf_id, RdfId::new(10));
        assert_eq!(ids.chaser_rdf_id_lower_bound, RdfId::new(0));
        assert_eq!(ids.local_required_ifd_id, IfdId::new(2));
        assert_eq!(ids.to_gen_ifd_id, IfdId::new(2));
    }

    #[test]
    fn self_cmd_lands_at_generating_ifd_id() {
        let mut engine = engine();
        let ifd_id = engine.upsert_self_cmd(7);
        assert_eq!(ifd_id, IfdId::new(0));
        let frame = engine.input_store().get(ifd_id).unwrap();
        assert_eq!(frame.input_for(SELF), 7);
        assert!(frame.is_confirmed(SELF));
    }

    #[test]
    fn peer_reveal_matching_prediction_keeps_chaser() {
        let mut engine = engine();
        for _ in 0..12 {
            engine.step(&mut HashSim).unwrap();
        }
        // Prefabbed peer inputs predicted 0; the peer confirms exactly that.
        engine
            .on_upsync_snapshot_received(&peer_batch(0, vec![0, 0]))
            .unwrap();
        assert_eq!(engine.rdf_and_ifd_ids().chaser_rdf_id, RdfId::new(12));
    }

    #[test]
    fn peer_reveal_contradicting_prediction_rewinds_chaser() {
        let mut engine = engine();
        for _ in 0..12 {
            engine.step(&mut HashSim).unwrap();
        }
        engine
            .on_upsync_snapshot_received(&peer_batch(1, vec![9]))
            .unwrap();
        // first_used_rdf_id(1) == 6 with the default window.
        assert_eq!(engine.rdf_and_ifd_ids().chaser_rdf_id, RdfId::new(6));
        assert_eq!(engine.rdf_and_ifd_ids().timer_rdf_id, RdfId::new(12));
    }

    #[test]
    fn mismatch_in_the_future_is_not_a_rewind() {
        let mut engine = engine();
        for _ in 0..4 {
            engine.step(&mut HashSim).unwrap();
        }
        // Input frame 5 is first used at rdf 22, far past timer 4.
        engine
            .on_upsync_snapshot_received(&peer_batch(5, vec![9]))
            .unwrap();
        assert_eq!(engine.rdf_and_ifd_ids().chaser_rdf_id, RdfId::new(4));
    }

    #[test]
    fn chasing_is_bounded_and_never_passes_timer() {
        let mut engine = engine();
        engine.set_max_chasing_rdfs_per_update(4);
        for _ in 0..30 {
            engine.step(&mut HashSim).unwrap();
        }
        engine
            .on_upsync_snapshot_received(&peer_batch(0, vec![5]))
            .unwrap();
        assert_eq!(engine.rdf_and_ifd_ids().chaser_rdf_id, RdfId::new(2));
        let mut previous = RdfId::new(2);
        loop {
            let chaser = engine.chase_rolled_back_rdfs(&mut HashSim).unwrap();
            assert!(chaser - previous <= 4);
            assert!(chaser <= engine.rdf_and_ifd_ids().timer_rdf_id);
            if chaser == previous {
                break;
            }
            previous = chaser;
        }
        assert_eq!(previous, RdfId::new(30));
    }

    #[test]
    fn chased_history_converges_with_early_knowledge() {
        // Engine A predicts, learns the truth late, and chases; engine B knew
        // the peer inputs before stepping. They must agree at the live tick.
        // The batch starts at input frame 1: frames inside the initial input
        // delay all consume frame 0, which no rewind can reach.
        let peer_values = vec![3, 1, 4, 1, 5];

        let mut a = engine();
        for _ in 0..20 {
            a.step(&mut HashSim).unwrap();
        }
        a.on_upsync_snapshot_received(&peer_batch(1, peer_values.clone()))
            .unwrap();
        while a.rdf_and_ifd_ids().chaser_rdf_id < a.rdf_and_ifd_ids().timer_rdf_id {
            a.chase_rolled_back_rdfs(&mut HashSim).unwrap();
        }

        let mut b = engine();
        b.on_upsync_snapshot_received(&peer_batch(1, peer_values)).unwrap();
        for _ in 0..20 {
            b.step(&mut HashSim).unwrap();
        }

        let timer = a.rdf_and_ifd_ids().timer_rdf_id;
        assert_eq!(timer, b.rdf_and_ifd_ids().timer_rdf_id);
        assert_eq!(a.rdf(timer), b.rdf(timer));
    }

    #[test]
    fn changed_self_cmd_rewinds_too() {
        let mut engine = engine();
        engine.upsert_self_cmd(1);
        for _ in 0..10 {
            engine.step(&mut HashSim).unwrap();
        }
        // Early frames consumed input frame 0 with self == 1; a late change
        // invalidates them. (The generating id at timer 10 has moved on to 2,
        // so write frame 0 through the store directly.)
        let outcome = engine.store.upsert(IfdId::new(0), SELF, 2, true, false, 0);
        assert!(outcome.mutated_existing());
        engine.handle_incorrectly_rendered_prediction(IfdId::new(0));
        assert_eq!(engine.rdf_and_ifd_ids().chaser_rdf_id, RdfId::new(2));
    }

    #[test]
    fn downsync_batch_advances_watermark_and_rewinds_on_mismatch() {
        let mut engine = engine();
        for _ in 0..12 {
            engine.step(&mut HashSim).unwrap();
        }
        let mut snapshot: DownsyncSnapshot<u64> = DownsyncSnapshot::new(0, IfdId::new(0));
        for id in 0..2 {
            let mut frame = InputFrame::blank(IfdId::new(id), 2);
            frame.input_list[0] = 0;
            frame.input_list[1] = if id == 1 { 8 } else { 0 };
            frame.confirmed_list = 0b11;
            snapshot.ifd_batch.push(frame);
        }
        engine.on_downsync_snapshot_received(&snapshot).unwrap();
        let ids = engine.rdf_and_ifd_ids();
        assert_eq!(ids.lcac_ifd_id, IfdId::new(1));
        // Mismatch at input frame 1 spans rdfs 6..=9.
        assert_eq!(ids.chaser_rdf_id, RdfId::new(6));
        // Authoritative frames are fully confirmed locally and final.
        let frame = engine.input_store().get(IfdId::new(1)).unwrap();
        assert_eq!(frame.confirmed_list, 0b11);
        assert_eq!(frame.input_for(PEER), 8);
    }

    #[test]
    fn downsync_frames_at_or_below_watermark_are_skipped() {
        let mut engine = engine();
        for _ in 0..12 {
            engine.step(&mut HashSim).unwrap();
        }
        let mut snapshot: DownsyncSnapshot<u64> = DownsyncSnapshot::new(0, IfdId::new(0));
        let mut frame = InputFrame::blank(IfdId::new(0), 2);
        frame.input_list[1] = 5;
        frame.confirmed_list = 0b11;
        snapshot.ifd_batch.push(frame);
        engine.on_downsync_snapshot_received(&snapshot).unwrap();
        assert_eq!(engine.rdf_and_ifd_ids().lcac_ifd_id, IfdId::new(0));

        // The same frame again, with a different value: ignored outright.
        let mut replay: DownsyncSnapshot<u64> = DownsyncSnapshot::new(0, IfdId::new(0));
        let mut frame = InputFrame::blank(IfdId::new(0), 2);
        frame.input_list[1] = 9;
        frame.confirmed_list = 0b11;
        replay.ifd_batch.push(frame);
        engine.on_downsync_snapshot_received(&replay).unwrap();
        assert_eq!(
            engine.input_store().get(IfdId::new(0)).unwrap().input_for(PEER),
            5
        );
    }

    #[test]
    fn ref_rdf_reseeds_a_joining_client() {
        let mut engine = engine();
        let mut snapshot: DownsyncSnapshot<u64> = DownsyncSnapshot::new(0, IfdId::new(100));
        for id in 100..110 {
            let mut frame = InputFrame::blank(IfdId::new(id), 2);
            frame.confirmed_list = 0b11;
            snapshot.ifd_batch.push(frame);
        }
        snapshot.ref_rdf_id = Some(RdfId::new(402));
        snapshot.ref_rdf = Some(987);
        engine.on_downsync_snapshot_received(&snapshot).unwrap();
        let ids = engine.rdf_and_ifd_ids();
        assert_eq!(ids.timer_rdf_id, RdfId::new(402));
        assert_eq!(ids.chaser_rdf_id, RdfId::new(402));
        assert_eq!(ids.chaser_rdf_id_lower_bound, RdfId::new(402));
        assert_eq!(engine.rdf(RdfId::new(402)), Some(&987));
        assert_eq!(ids.lcac_ifd_id, IfdId::new(109));
        // The client can step straight from the reseeded frame.
        let timer = engine.step(&mut HashSim).unwrap();
        assert_eq!(timer, RdfId::new(403));
    }

    #[test]
    fn resident_ref_rdf_rewinds_chaser_for_resimulation() {
        let mut engine = engine();
        for _ in 0..10 {
            engine.step(&mut HashSim).unwrap();
        }
        let mut snapshot: DownsyncSnapshot<u64> = DownsyncSnapshot::new(0, IfdId::new(0));
        snapshot.ref_rdf_id = Some(RdfId::new(4));
        snapshot.ref_rdf = Some(555);
        engine.on_downsync_snapshot_received(&snapshot).unwrap();
        assert_eq!(engine.rdf(RdfId::new(4)), Some(&555));
        assert_eq!(engine.rdf_and_ifd_ids().chaser_rdf_id, RdfId::new(4));
        assert_eq!(engine.rdf_and_ifd_ids().timer_rdf_id, RdfId::new(10));
    }

    #[test]
    fn resident_ref_rdf_raises_the_rewind_floor() {
        let mut engine = engine();
        for _ in 0..10 {
            engine.step(&mut HashSim).unwrap();
        }
        let mut snapshot: DownsyncSnapshot<u64> = DownsyncSnapshot::new(0, IfdId::new(0));
        snapshot.ref_rdf_id = Some(RdfId::new(4));
        snapshot.ref_rdf = Some(555);
        engine.on_downsync_snapshot_received(&snapshot).unwrap();
        assert_eq!(engine.rdf_and_ifd_ids().chaser_rdf_id_lower_bound, RdfId::new(4));
        // Input frame 0 spans rdfs 2..=5; its mismatch may not drag the
        // chaser below the authoritative seed at 4.
        engine.handle_incorrectly_rendered_prediction(IfdId::new(0));
        assert_eq!(engine.rdf_and_ifd_ids().chaser_rdf_id, RdfId::new(4));
        assert_eq!(engine.rdf_and_ifd_ids().chaser_rdf_id_lower_bound, RdfId::new(4));
    }

    #[test]
    fn stale_ref_rdf_never_rewinds_the_timer() {
        let mut engine = engine();
        let mut seed: DownsyncSnapshot<u64> = DownsyncSnapshot::new(0, IfdId::new(0));
        seed.ref_rdf_id = Some(RdfId::new(402));
        seed.ref_rdf = Some(987);
        engine.on_downsync_snapshot_received(&seed).unwrap();
        for _ in 0..8 {
            engine.step(&mut HashSim).unwrap();
        }
        assert_eq!(engine.rdf_and_ifd_ids().timer_rdf_id, RdfId::new(410));

        // A duplicated or reordered broadcast carrying an old reference frame
        // must leave every cursor where it was.
        let mut stale: DownsyncSnapshot<u64> = DownsyncSnapshot::new(0, IfdId::new(0));
        stale.ref_rdf_id = Some(RdfId::new(100));
        stale.ref_rdf = Some(1);
        engine.on_downsync_snapshot_received(&stale).unwrap();
        let ids = engine.rdf_and_ifd_ids();
        assert_eq!(ids.timer_rdf_id, RdfId::new(410));
        assert_eq!(ids.chaser_rdf_id_lower_bound, RdfId::new(402));
        // And the client keeps ticking.
        engine.step(&mut HashSim).unwrap();
    }

    #[test]
    fn downsync_batch_far_ahead_without_ref_is_truncated() {
        let mut engine = engine();
        for _ in 0..12 {
            engine.step(&mut HashSim).unwrap();
        }
        // Input capacity is 256; the live tick at timer 12 still consumes
        // input frame 2, so frames past id 257 must not be applied.
        let mut snapshot: DownsyncSnapshot<u64> = DownsyncSnapshot::new(0, IfdId::new(0));
        for id in 0..300 {
            let mut frame = InputFrame::blank(IfdId::new(id), 2);
            frame.confirmed_list = 0b11;
            snapshot.ifd_batch.push(frame);
        }
        engine.on_downsync_snapshot_received(&snapshot).unwrap();
        assert!(engine.input_store().st_ifd_id() <= IfdId::new(2));
        engine.step(&mut HashSim).unwrap();
    }

    #[test]
    fn peer_batch_far_ahead_is_deferred_not_evicting() {
        let mut engine = engine();
        for _ in 0..4 {
            engine.step(&mut HashSim).unwrap();
        }
        // Input capacity is 256; a batch reaching id 600 would evict the
        // frames still feeding the live tick, so merging stops early.
        let merged = engine
            .on_upsync_snapshot_received(&peer_batch(0, vec![1; 601]))
            .unwrap();
        assert!(merged < 601);
        assert!(engine.input_store().st_ifd_id() <= IfdId::new(0));
        // The live tick can still step.
        engine.step(&mut HashSim).unwrap();
    }

    #[test]
    fn irrecoverable_mismatch_below_floor_is_ignored() {
        let mut engine = engine();
        let mut snapshot: DownsyncSnapshot<u64> = DownsyncSnapshot::new(0, IfdId::new(0));
        snapshot.ref_rdf_id = Some(RdfId::new(400));
        snapshot.ref_rdf = Some(1);
        engine.on_downsync_snapshot_received(&snapshot).unwrap();
        // Input frame 2 spans rdfs 10..=13, entirely below the floor at 400.
        engine.handle_incorrectly_rendered_prediction(IfdId::new(2));
        assert_eq!(engine.rdf_and_ifd_ids().chaser_rdf_id, RdfId::new(400));
    }
}
