//! The authoritative synchronization engine.
//!
//! A [`BackendSyncEngine`] sits server-side: it ingests per-player
//! [`UpsyncSnapshot`] batches from whichever channel delivered them, merges
//! them into the input history, tracks the all-confirmed watermark, and
//! produces canonical [`DownsyncSnapshot`]s for broadcast.
//!
//! The defining behavior is *force-confirmation under eviction pressure*: the
//! input ring is fixed-capacity, so a batch far enough ahead of the watermark
//! would evict frames that never became all-confirmed. Rather than stalling
//! the battle on its slowest player, the backend finalizes those frames as
//! they stand (predicted values for silent players), drags the watermark past
//! them, advances its own dynamics over the finalized span, and ships the
//! finalized frames in the outbound snapshot so every client converges on the
//! same timeline.

use tracing::{debug, trace, warn};

use crate::confirmation::ConfirmationTracker;
use crate::error::SyncError;
use crate::frame_info::InputFrame;
use crate::input_store::InputFrameStore;
use crate::ring_buffer::FrameRingBuffer;
use crate::wire::messages::{DownsyncSnapshot, UpsyncSnapshot};
use crate::{
    all_confirmed_mask, FrameWindow, IfdId, JoinIndex, RdfId, TickSimulator,
    DEFAULT_BACKEND_INPUT_BUFFER_SIZE, UPSYNC_ST_IFD_ID_TOLERANCE,
};

/// Default render-frame history capacity for the backend. The backend only
/// ever consumes the newest state, so this is sized for diagnostics headroom,
/// not gameplay.
pub const DEFAULT_BACKEND_RDF_BUFFER_SIZE: usize = 256;

/// Everything a transport/session layer needs to know after feeding one
/// upsync batch to the backend.
#[derive(Debug)]
pub struct UpsyncOutcome<S> {
    /// `false` if the batch was rejected wholesale (started too far beyond
    /// the input window); nothing was mutated in that case.
    pub accepted: bool,
    /// Newly finalized input frames to broadcast, if any were produced.
    pub snapshot: Option<DownsyncSnapshot<S>>,
    /// How many input-frame ids were finalized without full confirmation.
    pub forced_confirmation_cnt: i32,
    /// The all-confirmed watermark before the call.
    pub old_lcac_ifd_id: IfdId,
    /// The all-confirmed watermark after the call.
    pub new_lcac_ifd_id: IfdId,
    /// The latest computed render-frame id before the call.
    pub old_dynamics_rdf_id: RdfId,
    /// The latest computed render-frame id after the call.
    pub new_dynamics_rdf_id: RdfId,
    /// The smallest per-player input-front id, for flow-control telemetry.
    pub min_input_front_id: IfdId,
    /// The largest per-player input-front id.
    pub max_input_front_id: IfdId,
}

/// The result of a timer-driven watermark advancement.
#[derive(Debug)]
pub struct LcacStepOutcome<S> {
    /// Newly finalized input frames (and optionally a reference render frame)
    /// to broadcast.
    pub snapshot: Option<DownsyncSnapshot<S>>,
    /// The all-confirmed watermark before the call.
    pub old_lcac_ifd_id: IfdId,
    /// The all-confirmed watermark after the call.
    pub new_lcac_ifd_id: IfdId,
    /// The latest computed render-frame id before the call.
    pub old_dynamics_rdf_id: RdfId,
    /// The latest computed render-frame id after the call.
    pub new_dynamics_rdf_id: RdfId,
}

/// The authoritative engine for one battle.
///
/// Single-threaded by contract: concurrent inbound messages for the same
/// battle must be serialized by the caller (see
/// [`BattleRegistry`](crate::BattleRegistry)).
#[derive(Debug)]
pub struct BackendSyncEngine<S> {
    window: FrameWindow,
    players_cnt: usize,
    all_confirmed_mask: u64,
    inactive_join_mask: u64,
    store: InputFrameStore,
    tracker: ConfirmationTracker,
    rdf_buffer: FrameRingBuffer<RdfId, S>,
}

impl<S: Clone> BackendSyncEngine<S> {
    /// Creates an engine with default capacities and frame-window config,
    /// seeded with the render state of frame 0.
    #[must_use]
    pub fn new(players_cnt: usize, start_state: S) -> Self {
        Self::with_capacities(
            players_cnt,
            FrameWindow::default(),
            DEFAULT_BACKEND_INPUT_BUFFER_SIZE,
            DEFAULT_BACKEND_RDF_BUFFER_SIZE,
            start_state,
        )
    }

    /// Creates an engine with explicit ring capacities.
    ///
    /// # Panics
    ///
    /// Panics if either capacity is zero or `players_cnt` is not in
    /// `1..=`[`MAX_PLAYERS`](crate::MAX_PLAYERS).
    #[must_use]
    pub fn with_capacities(
        players_cnt: usize,
        window: FrameWindow,
        ifd_buffer_capacity: usize,
        rdf_buffer_capacity: usize,
        start_state: S,
    ) -> Self {
        let mut rdf_buffer = FrameRingBuffer::new(rdf_buffer_capacity);
        rdf_buffer.put(start_state);
        Self {
            window,
            players_cnt,
            all_confirmed_mask: all_confirmed_mask(players_cnt),
            inactive_join_mask: 0,
            store: InputFrameStore::new(ifd_buffer_capacity, players_cnt),
            tracker: ConfirmationTracker::new(),
            rdf_buffer,
        }
    }

    /// The frame-window configuration in effect.
    #[inline]
    #[must_use]
    pub const fn window(&self) -> FrameWindow {
        self.window
    }

    /// The all-confirmed watermark.
    #[inline]
    #[must_use]
    pub const fn lcac_ifd_id(&self) -> IfdId {
        self.tracker.lcac_ifd_id()
    }

    /// The latest render-frame id the backend dynamics have computed.
    #[inline]
    #[must_use]
    pub fn cur_dynamics_rdf_id(&self) -> RdfId {
        self.rdf_buffer.ed_frame_id() - 1
    }

    /// The latest computed render state.
    #[must_use]
    pub fn latest_rdf(&self) -> Option<&S> {
        self.rdf_buffer.last()
    }

    /// The computed render state at `rdf_id`, if still resident.
    #[must_use]
    pub fn rdf(&self, rdf_id: RdfId) -> Option<&S> {
        self.rdf_buffer.get(rdf_id)
    }

    /// Read access to the input history.
    #[inline]
    #[must_use]
    pub const fn input_store(&self) -> &InputFrameStore {
        &self.store
    }

    /// Marks a player as inactive: its inputs are predicted as 0 and its
    /// confirmation bit stops blocking watermark advancement.
    pub fn set_player_inactive(&mut self, join_index: JoinIndex) -> Result<(), SyncError> {
        self.validate_join_index(join_index)?;
        self.inactive_join_mask |= join_index.mask();
        debug!(%join_index, "player marked inactive");
        Ok(())
    }

    /// Marks a player as active again.
    pub fn set_player_active(&mut self, join_index: JoinIndex) -> Result<(), SyncError> {
        self.validate_join_index(join_index)?;
        self.inactive_join_mask &= !join_index.mask();
        debug!(%join_index, "player marked active");
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

    /// Ingests one player's upsync batch.
    ///
    /// `via_reliable`/`via_fast` describe which channel delivered the batch;
    /// either one is authoritative to the server, so a merged command confirms
    /// the sender on both masks. Obsolete and already-confirmed commands
    /// inside the batch are skipped silently; a batch starting more than
    /// [`UPSYNC_ST_IFD_ID_TOLERANCE`] ids beyond the input window is rejected
    /// wholesale with `accepted == false` and no mutation.
    pub fn on_upsync_snapshot_received<T>(
        &mut self,
        sim: &mut T,
        batch: &UpsyncSnapshot,
        via_reliable: bool,
        via_fast: bool,
    ) -> Result<UpsyncOutcome<S>, SyncError>
    where
        T: TickSimulator<State = S>,
    {
        self.validate_join_index(batch.join_index)?;
        let old_lcac_ifd_id = self.tracker.lcac_ifd_id();
        let old_dynamics_rdf_id = self.cur_dynamics_rdf_id();
        let n = self.store.capacity() as i32;

        if self.store.st_ifd_id().as_i32() + n + UPSYNC_ST_IFD_ID_TOLERANCE
            < batch.st_ifd_id.as_i32()
        {
            warn!(
                join_index = %batch.join_index,
                st_ifd_id = batch.st_ifd_id.as_i32(),
                window_st = self.store.st_ifd_id().as_i32(),
                via_reliable,
                via_fast,
                "upsync batch too far ahead of input window, rejected"
            );
            return Ok(UpsyncOutcome {
                accepted: false,
                snapshot: None,
                forced_confirmation_cnt: 0,
                old_lcac_ifd_id,
                new_lcac_ifd_id: old_lcac_ifd_id,
                old_dynamics_rdf_id,
                new_dynamics_rdf_id: old_dynamics_rdf_id,
                min_input_front_id: self.store.min_front_id(),
                max_input_front_id: self.store.max_front_id(),
            });
        }

        let mut snapshot: Option<DownsyncSnapshot<S>> = None;
        let mut forced_confirmation_cnt = 0;
        // While the batch fills consecutively from the watermark and every
        // merged frame comes out fully confirmed, watermark advancement is
        // deferred to a single scan at the end (or at the first break).
        let mut trend = batch.st_ifd_id <= self.tracker.lcac_ifd_id() + 1;

        for (i, &cmd) in batch.cmd_list.iter().enumerate() {
            let ifd_id = batch.st_ifd_id + i as i32;
            if ifd_id <= self.tracker.lcac_ifd_id() {
                continue;
            }
            let st = self.store.st_ifd_id();
            if ifd_id.as_i32() >= st.as_i32() + n {
                // This command will push the input window forward.
                let to_evict = ifd_id.as_i32() - st.as_i32() - n + 1;
                let post_st = st.as_i32() + to_evict;
                let lcac = self.tracker.lcac_ifd_id();
                if lcac.as_i32() + 1 < post_st {
                    // The watermark would fall out of the window: finalize the
                    // gap as it stands and drag the watermark past it.
                    let already_confirmed = lcac.as_i32() + 1 - st.as_i32();
                    forced_confirmation_cnt += to_evict - already_confirmed;
                    self.tracker.force_to(IfdId::new(post_st - 1));
                    debug!(
                        join_index = %batch.join_index,
                        forced = to_evict - already_confirmed,
                        new_lcac = post_st - 1,
                        "eviction pressure forced confirmation"
                    );
                    self.append_forced_slice(&mut snapshot, lcac + 1, IfdId::new(post_st));
                }
                // Advance dynamics over everything finalized before the
                // frames feeding it can be evicted.
                let target = self.window.last_used_rdf_id(self.tracker.lcac_ifd_id()) + 1;
                self.step_dynamics(sim, target, snapshot.as_ref())?;
            }
            let outcome = self.store.upsert(
                ifd_id,
                batch.join_index,
                cmd,
                // Any direct report from the player is authoritative here.
                via_reliable || via_fast,
                via_reliable || via_fast,
                self.inactive_join_mask,
            );
            trace!(ifd_id = ifd_id.as_i32(), join_index = %batch.join_index, ?outcome, "upsync merge");
            if trend {
                let fully_confirmed = self.store.get(ifd_id).is_some_and(|frame| {
                    (frame.confirmed_list | self.inactive_join_mask) & self.all_confirmed_mask
                        == self.all_confirmed_mask
                });
                if !fully_confirmed {
                    trend = false;
                    self.advance_watermark_into_snapshot(&mut snapshot);
                }
            }
        }
        if trend {
            self.advance_watermark_into_snapshot(&mut snapshot);
        }

        Ok(UpsyncOutcome {
            accepted: true,
            snapshot,
            forced_confirmation_cnt,
            old_lcac_ifd_id,
            new_lcac_ifd_id: self.tracker.lcac_ifd_id(),
            old_dynamics_rdf_id,
            new_dynamics_rdf_id: self.cur_dynamics_rdf_id(),
            min_input_front_id: self.store.min_front_id(),
            max_input_front_id: self.store.max_front_id(),
        })
    }

    /// Timer-driven variant of watermark advancement: scan for newly
    /// all-confirmed frames, advance dynamics over them, and produce the
    /// matching broadcast snapshot. With `with_ref_rdf` the snapshot also
    /// embeds the latest computed render frame, which a joining or badly
    /// lagged client uses to reseed its history.
    pub fn move_forward_lcac_and_step<T>(
        &mut self,
        sim: &mut T,
        with_ref_rdf: bool,
    ) -> Result<LcacStepOutcome<S>, SyncError>
    where
        T: TickSimulator<State = S>,
    {
        let old_dynamics_rdf_id = self.cur_dynamics_rdf_id();
        let mut snapshot: Option<DownsyncSnapshot<S>> = None;
        let old_lcac_ifd_id = self.tracker.lcac_ifd_id();
        self.advance_watermark_into_snapshot(&mut snapshot);
        let new_lcac_ifd_id = self.tracker.lcac_ifd_id();
        if new_lcac_ifd_id.is_valid() {
            let target = self.window.last_used_rdf_id(new_lcac_ifd_id) + 1;
            self.step_dynamics(sim, target, snapshot.as_ref())?;
        }
        if with_ref_rdf {
            let snap = snapshot.get_or_insert_with(|| {
                DownsyncSnapshot::new(0, new_lcac_ifd_id + 1)
            });
            snap.ref_rdf_id = Some(self.cur_dynamics_rdf_id());
            snap.ref_rdf = self.rdf_buffer.last().cloned();
        }
        Ok(LcacStepOutcome {
            snapshot,
            old_lcac_ifd_id,
            new_lcac_ifd_id,
            old_dynamics_rdf_id,
            new_dynamics_rdf_id: self.cur_dynamics_rdf_id(),
        })
    }

    /// Slices buffered input frames `[st_ifd_id, ed_ifd_id)` (clamped to the
    /// live window) into a broadcast snapshot, optionally embedding the latest
    /// computed render frame.
    pub fn produce_downsync_snapshot(
        &self,
        unconfirmed_mask: u64,
        st_ifd_id: IfdId,
        ed_ifd_id: IfdId,
        with_ref_rdf: bool,
    ) -> Result<DownsyncSnapshot<S>, SyncError> {
        let st = st_ifd_id.max(self.store.st_ifd_id());
        let ed = ed_ifd_id.min(self.store.ed_ifd_id());
        if st > ed {
            return Err(SyncError::InvalidRequest {
                info: format!(
                    "downsync slice [{st_ifd_id}, {ed_ifd_id}) does not intersect the input window"
                ),
            });
        }
        let mut snapshot = DownsyncSnapshot::new(unconfirmed_mask, st);
        let mut id = st;
        while id < ed {
            if let Some(frame) = self.store.get(id) {
                snapshot.ifd_batch.push(frame.clone());
            }
            id += 1;
        }
        if with_ref_rdf {
            snapshot.ref_rdf_id = Some(self.cur_dynamics_rdf_id());
            snapshot.ref_rdf = self.rdf_buffer.last().cloned();
        }
        Ok(snapshot)
    }

    /// Resets the engine for battle reuse: input history, watermark and
    /// dynamics all restart from frame 0 with `start_state`. Player
    /// active/inactive flags persist.
    pub fn reset_start_rdf(&mut self, start_state: S) {
        self.store.clear();
        self.tracker.clear();
        self.rdf_buffer.clear();
        self.rdf_buffer.put(start_state);
    }

    /// Scans the watermark toward the buffered end; if it advanced, appends
    /// the newly confirmed frames to the outbound snapshot.
    fn advance_watermark_into_snapshot(&mut self, snapshot: &mut Option<DownsyncSnapshot<S>>) {
        let proposed_end = self.store.ed_ifd_id();
        let old =
            self.tracker
                .move_forward(&mut self.store, proposed_end, self.inactive_join_mask);
        let new = self.tracker.lcac_ifd_id();
        if new > old {
            self.append_confirmed_slice(snapshot, old + 1, new + 1, self.inactive_join_mask);
        }
    }

    /// Appends buffered frames `[st, ed)` to the snapshot as-is (they are
    /// fully confirmed already).
    fn append_confirmed_slice(
        &self,
        snapshot: &mut Option<DownsyncSnapshot<S>>,
        st: IfdId,
        ed: IfdId,
        unconfirmed_mask: u64,
    ) {
        let snap = snapshot.get_or_insert_with(|| DownsyncSnapshot::new(0, st));
        snap.unconfirmed_mask |= unconfirmed_mask;
        let mut id = st;
        while id < ed {
            if let Some(frame) = self.store.get(id) {
                snap.ifd_batch.push(frame.clone());
            }
            id += 1;
        }
    }

    /// Appends force-finalized frames `[st, ed)` to the snapshot: buffered
    /// frames as they stand, then "virtual" frames past the buffered end
    /// predicted from the input fronts. All carry a full confirmation mask so
    /// clients treat them as final.
    fn append_forced_slice(
        &mut self,
        snapshot: &mut Option<DownsyncSnapshot<S>>,
        st: IfdId,
        ed: IfdId,
    ) {
        let mask = self.all_confirmed_mask;
        let snap = snapshot.get_or_insert_with(|| DownsyncSnapshot::new(0, st));
        snap.unconfirmed_mask |= mask;
        let buffered_end = ed.min(self.store.ed_ifd_id());
        let mut id = st;
        while id < buffered_end {
            if let Some(frame) = self.store.get(id) {
                let mut finalized = frame.clone();
                finalized.confirmed_list = mask;
                snap.ifd_batch.push(finalized);
            }
            id += 1;
        }
        while id < ed {
            let mut virtual_frame = InputFrame::blank(id, self.players_cnt);
            let predicted = self.store.predicted_input_list(self.inactive_join_mask);
            virtual_frame.input_list.copy_from_slice(&predicted);
            virtual_frame.confirmed_list = mask;
            virtual_frame.udp_confirmed_list = mask;
            snap.ifd_batch.push(virtual_frame);
            id += 1;
        }
    }

    /// Advances dynamics until the latest computed render frame reaches
    /// `target_rdf_id`. Inputs come from the store, falling back to the
    /// in-flight snapshot for finalized ids not (or no longer) buffered.
    fn step_dynamics<T>(
        &mut self,
        sim: &mut T,
        target_rdf_id: RdfId,
        fallback: Option<&DownsyncSnapshot<S>>,
    ) -> Result<(), SyncError>
    where
        T: TickSimulator<State = S>,
    {
        while self.cur_dynamics_rdf_id() < target_rdf_id {
            let from_rdf_id = self.cur_dynamics_rdf_id();
            let ifd_id = self.window.delayed_ifd_id(from_rdf_id);
            let next = {
                let state =
                    self.rdf_buffer
                        .get(from_rdf_id)
                        .ok_or(SyncError::MissingRenderFrame {
                            rdf_id: from_rdf_id,
                        })?;
                let input = self
                    .store
                    .get(ifd_id)
                    .or_else(|| {
                        fallback.and_then(|snap| {
                            let offset = ifd_id - snap.st_ifd_id;
                            usize::try_from(offset)
                                .ok()
                                .and_then(|offset| snap.ifd_batch.get(offset))
                        })
                    })
                    .ok_or_else(|| SyncError::InvalidRequest {
                        info: format!("input frame {ifd_id} unavailable for dynamics step"),
                    })?;
                sim.step_one_tick(from_rdf_id, state, input)
            };
            self.rdf_buffer.put(next);
        }
        Ok(())
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

    // Sums consumed inputs so divergent replays are detectable.
    struct SumSim;

    impl TickSimulator for SumSim {
        type State = u64;

        fn step_one_tick(&mut self, _from_rdf_id: RdfId, state: &u64, input: &InputFrame) -> u64 {
            state.wrapping_add(input.input_list.iter().sum::<u64>()).wrapping_add(1)
        }
    }

    fn engine() -> BackendSyncEngine<u64> {
        BackendSyncEngine::new(2, 0)
    }

    fn upsync(
        engine: &mut BackendSyncEngine<u64>,
        join: u32,
        st: i32,
        ed_inclusive: i32,
        via_reliable: bool,
    ) -> UpsyncOutcome<u64> {
        let cmds = (st..=ed_inclusive).map(|id| id as u64).collect();
        let batch = UpsyncSnapshot::new(JoinIndex::new(join), IfdId::new(st), cmds);
        engine
            .on_upsync_snapshot_received(&mut SumSim, &batch, via_reliable, !via_reliable)
            .unwrap()
    }

    #[test]
    fn single_player_report_does_not_confirm() {
        let mut engine = engine();
        let outcome = upsync(&mut engine, 1, 0, 30, true);
        assert!(outcome.accepted);
        assert!(outcome.snapshot.is_none());
        assert_eq!(outcome.new_lcac_ifd_id, IfdId::NULL);
        assert_eq!(engine.input_store().st_ifd_id(), IfdId::new(0));
        assert_eq!(engine.input_store().count(), 31);
    }

    #[test]
    fn second_player_completes_confirmation_prefix() {
        let mut engine = engine();
        upsync(&mut engine, 1, 0, 30, true);
        // Fast channel confirms just as well on the backend.
        let outcome = upsync(&mut engine, 2, 0, 100, false);
        assert_eq!(outcome.new_lcac_ifd_id, IfdId::new(30));
        assert_eq!(outcome.forced_confirmation_cnt, 0);
        let snapshot = outcome.snapshot.unwrap();
        assert_eq!(snapshot.st_ifd_id, IfdId::new(0));
        assert_eq!(snapshot.ifd_batch.len(), 31);

        let outcome = upsync(&mut engine, 1, 31, 70, true);
        assert_eq!(outcome.new_lcac_ifd_id, IfdId::new(70));
        let snapshot = outcome.snapshot.unwrap();
        assert_eq!(snapshot.st_ifd_id, IfdId::new(31));
        assert_eq!(snapshot.ifd_batch.len(), 40);

        // A batch not adjoining the watermark defers confirmation entirely.
        let outcome = upsync(&mut engine, 2, 101, 200, false);
        assert_eq!(outcome.new_lcac_ifd_id, IfdId::new(70));
        assert!(outcome.snapshot.is_none());
        assert_eq!(engine.input_store().count(), 201);
    }

    #[test]
    fn long_run_eviction_without_forcing() {
        let mut engine = engine();
        upsync(&mut engine, 1, 0, 300, true);
        upsync(&mut engine, 1, 400, 400, true);
        let outcome = upsync(&mut engine, 2, 0, 512, false);
        assert_eq!(outcome.new_lcac_ifd_id, IfdId::new(300));
        assert_eq!(outcome.forced_confirmation_cnt, 0);
        let snapshot = outcome.snapshot.unwrap();
        assert_eq!(snapshot.st_ifd_id, IfdId::new(0));
        assert_eq!(snapshot.ifd_batch.len(), 301);
        assert_eq!(engine.input_store().st_ifd_id(), IfdId::new(62));
        assert_eq!(engine.input_store().ed_ifd_id(), IfdId::new(513));
        assert_eq!(engine.input_store().count(), 451);

        let outcome = upsync(&mut engine, 1, 401, 700, true);
        assert_eq!(outcome.new_lcac_ifd_id, IfdId::new(300));
        assert!(outcome.snapshot.is_none());
        assert_eq!(engine.input_store().st_ifd_id(), IfdId::new(250));

        // Too far beyond even the post-eviction window: rejected wholesale.
        let batch = UpsyncSnapshot::new(JoinIndex::new(2), IfdId::new(800), vec![0; 4]);
        let outcome = engine
            .on_upsync_snapshot_received(&mut SumSim, &batch, false, true)
            .unwrap();
        assert!(!outcome.accepted);
        assert_eq!(engine.input_store().st_ifd_id(), IfdId::new(250));

        // Back-filling from below the watermark releases the whole run that
        // the other player had already covered.
        let outcome = upsync(&mut engine, 1, 298, 420, true);
        assert_eq!(outcome.new_lcac_ifd_id, IfdId::new(512));
        let snapshot = outcome.snapshot.unwrap();
        assert_eq!(snapshot.st_ifd_id, IfdId::new(301));
        assert_eq!(snapshot.ifd_batch.len(), 212);
    }

    #[test]
    fn eviction_pressure_forces_partial_history() {
        let mut engine = engine();
        upsync(&mut engine, 1, 0, 120, true);
        let outcome = upsync(&mut engine, 2, 0, 120, false);
        assert_eq!(outcome.new_lcac_ifd_id, IfdId::new(120));

        let outcome = upsync(&mut engine, 1, 459, 600, true);
        assert_eq!(outcome.forced_confirmation_cnt, 29);
        assert_eq!(outcome.new_lcac_ifd_id, IfdId::new(149));
        assert_eq!(engine.input_store().st_ifd_id(), IfdId::new(150));
        let snapshot = outcome.snapshot.unwrap();
        assert_eq!(snapshot.st_ifd_id, IfdId::new(121));
        assert_eq!(snapshot.ifd_batch.len(), 29);
        assert_eq!(snapshot.unconfirmed_mask, 0b11);
        // Dynamics covered everything finalized.
        assert_eq!(
            outcome.new_dynamics_rdf_id,
            engine.window().last_used_rdf_id(IfdId::new(149)) + 1
        );
    }

    #[test]
    fn eviction_pressure_on_fresh_instance_emits_virtual_frames() {
        let mut engine = engine();
        let outcome = upsync(&mut engine, 1, 459, 600, true);
        assert_eq!(outcome.forced_confirmation_cnt, 150);
        assert_eq!(outcome.new_lcac_ifd_id, IfdId::new(149));
        assert_eq!(engine.input_store().st_ifd_id(), IfdId::new(150));
        assert_eq!(engine.input_store().ed_ifd_id(), IfdId::new(601));
        assert_eq!(engine.input_store().count(), 451);
        let snapshot = outcome.snapshot.unwrap();
        assert_eq!(snapshot.st_ifd_id, IfdId::new(0));
        assert_eq!(snapshot.ifd_batch.len(), 150);
        // The first 9 ids were never buffered at all, so the snapshot carries
        // fully confirmed frames made from the (empty) input fronts.
        for frame in &snapshot.ifd_batch[..9] {
            assert_eq!(frame.input_list.as_slice(), &[0, 0]);
            assert_eq!(frame.confirmed_list, 0b11);
            assert_eq!(frame.udp_confirmed_list, 0b11);
        }
    }

    #[test]
    fn eviction_pressure_with_tiny_history() {
        let mut engine = engine();
        upsync(&mut engine, 1, 0, 2, true);
        upsync(&mut engine, 2, 0, 2, false);
        assert_eq!(engine.lcac_ifd_id(), IfdId::new(2));
        let outcome = upsync(&mut engine, 1, 459, 600, true);
        assert_eq!(outcome.forced_confirmation_cnt, 147);
        assert_eq!(outcome.new_lcac_ifd_id, IfdId::new(149));
        let snapshot = outcome.snapshot.unwrap();
        assert_eq!(snapshot.st_ifd_id, IfdId::new(3));
        assert_eq!(snapshot.ifd_batch.len(), 147);
    }

    #[test]
    fn timer_driven_advance_embeds_ref_rdf() {
        let mut engine = engine();
        upsync(&mut engine, 1, 0, 2, true);
        upsync(&mut engine, 2, 0, 2, false);
        let outcome = engine.move_forward_lcac_and_step(&mut SumSim, true).unwrap();
        assert!(outcome.new_dynamics_rdf_id > RdfId::new(0));
        let snapshot = outcome.snapshot.unwrap();
        assert_eq!(snapshot.ref_rdf_id, Some(outcome.new_dynamics_rdf_id));
        assert!(snapshot.ref_rdf.is_some());
    }

    #[test]
    fn dynamics_replay_is_deterministic() {
        // Two engines fed the same confirmations through different batch
        // shapes end with identical dynamics state.
        let mut a = engine();
        upsync(&mut a, 1, 0, 50, true);
        upsync(&mut a, 2, 0, 50, false);
        a.move_forward_lcac_and_step(&mut SumSim, false).unwrap();

        let mut b = engine();
        for st in (0..=50).step_by(10) {
            upsync(&mut b, 2, st, (st + 9).min(50), false);
        }
        upsync(&mut b, 1, 0, 50, true);
        b.move_forward_lcac_and_step(&mut SumSim, false).unwrap();

        assert_eq!(a.lcac_ifd_id(), b.lcac_ifd_id());
        assert_eq!(a.cur_dynamics_rdf_id(), b.cur_dynamics_rdf_id());
        assert_eq!(a.latest_rdf(), b.latest_rdf());
    }

    #[test]
    fn inactive_player_does_not_block_confirmation() {
        let mut engine = engine();
        engine.set_player_inactive(JoinIndex::new(2)).unwrap();
        let outcome = upsync(&mut engine, 1, 0, 10, true);
        assert_eq!(outcome.new_lcac_ifd_id, IfdId::new(10));
        let snapshot = outcome.snapshot.unwrap();
        assert_eq!(snapshot.ifd_batch.len(), 11);
        assert_eq!(snapshot.unconfirmed_mask, JoinIndex::new(2).mask());
    }

    #[test]
    fn invalid_join_index_is_rejected() {
        let mut engine = engine();
        let batch = UpsyncSnapshot::new(JoinIndex::new(3), IfdId::new(0), vec![1]);
        let err = engine
            .on_upsync_snapshot_received(&mut SumSim, &batch, true, false)
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidJoinIndex { .. }));
    }

    #[test]
    fn produce_downsync_snapshot_slices_window() {
        let mut engine = engine();
        upsync(&mut engine, 1, 0, 20, true);
        upsync(&mut engine, 2, 0, 20, false);
        let snapshot = engine
            .produce_downsync_snapshot(0, IfdId::new(5), IfdId::new(10), false)
            .unwrap();
        assert_eq!(snapshot.st_ifd_id, IfdId::new(5));
        assert_eq!(snapshot.ifd_batch.len(), 5);
        assert!(snapshot.ref_rdf.is_none());
    }

    #[test]
    fn reset_start_rdf_restarts_from_zero() {
        let mut engine = engine();
        upsync(&mut engine, 1, 0, 30, true);
        upsync(&mut engine, 2, 0, 30, false);
        engine.reset_start_rdf(7);
        assert_eq!(engine.lcac_ifd_id(), IfdId::NULL);
        assert_eq!(engine.cur_dynamics_rdf_id(), RdfId::new(0));
        assert_eq!(engine.latest_rdf(), Some(&7));
        assert_eq!(engine.input_store().count(), 0);
    }
}
