//! Input-frame ownership: confirmation-bit merging, prediction, and
//! prefabrication.
//!
//! The [`InputFrameStore`] owns the input-frame ring buffer and is the only
//! code that mutates [`InputFrame`]s. Everything the two sync engines do with
//! inputs goes through three operations:
//!
//! - [`upsert`](InputFrameStore::upsert): merge one `(id, join index, value)`
//!   report from some channel, honoring the confirmation precedence rules.
//! - [`get_or_prefab`](InputFrameStore::get_or_prefab): make an id resident,
//!   predicting ("prefabbing") any gap frames from each player's *input
//!   front*, the most recent input actually known for that player.
//! - [`apply_authoritative`](InputFrameStore::apply_authoritative): overwrite
//!   a frame wholesale from a downsync batch, stamping it fully confirmed.

use std::collections::BTreeMap;

use smallvec::SmallVec;
use tracing::trace;

use crate::frame_info::{InputFrame, INLINE_PLAYERS};
use crate::ring_buffer::FrameRingBuffer;
use crate::{all_confirmed_mask, IfdId, JoinIndex, NULL_FRAME};

/// The result of merging one input report into the store.
///
/// None of these are errors; obsolete and already-confirmed inputs are normal
/// outcomes of an unreliable, reordering network.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The target id is older than the buffer window (already evicted); the
    /// data is obsolete and was ignored.
    Obsolete,
    /// The sender's slot at this id is already confirmed at equal-or-higher
    /// precedence; the report was ignored.
    AlreadyConfirmed,
    /// The value was written and the sender's confirmation bits were set.
    Written {
        /// `true` if the stored value at this id changed; this is the signal
        /// a frontend uses to detect a misprediction and trigger rollback.
        existing_input_mutated: bool,
    },
}

impl UpsertOutcome {
    /// Returns `true` if the report was actually written.
    #[inline]
    #[must_use]
    pub const fn was_written(self) -> bool {
        matches!(self, UpsertOutcome::Written { .. })
    }

    /// Returns `true` if the written value differed from what was stored.
    #[inline]
    #[must_use]
    pub const fn mutated_existing(self) -> bool {
        matches!(
            self,
            UpsertOutcome::Written {
                existing_input_mutated: true
            }
        )
    }
}

/// Owns one ring buffer of input frames plus the per-player input fronts.
#[derive(Debug)]
pub struct InputFrameStore {
    buffer: FrameRingBuffer<IfdId, InputFrame>,
    players_cnt: usize,
    all_confirmed_mask: u64,
    // Latest input actually reported per join index, and at which id.
    fronts: Vec<u64>,
    front_ids: Vec<IfdId>,
    // Multiset of front ids, for O(log n) min/max queries.
    front_id_counts: BTreeMap<i32, usize>,
}

impl InputFrameStore {
    /// Creates a store with `capacity` input-frame slots for `players_cnt`
    /// players.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or `players_cnt` is not in
    /// `1..=`[`MAX_PLAYERS`](crate::MAX_PLAYERS).
    #[must_use]
    pub fn new(capacity: usize, players_cnt: usize) -> Self {
        assert!(
            (1..=crate::MAX_PLAYERS).contains(&players_cnt),
            "players_cnt out of range"
        );
        let mut front_id_counts = BTreeMap::new();
        front_id_counts.insert(NULL_FRAME, players_cnt);
        Self {
            buffer: FrameRingBuffer::new(capacity),
            players_cnt,
            all_confirmed_mask: all_confirmed_mask(players_cnt),
            fronts: vec![0; players_cnt],
            front_ids: vec![IfdId::NULL; players_cnt],
            front_id_counts,
        }
    }

    /// The number of players this store was sized for.
    #[inline]
    #[must_use]
    pub fn players_cnt(&self) -> usize {
        self.players_cnt
    }

    /// The mask with every player's confirmation bit set.
    #[inline]
    #[must_use]
    pub fn all_confirmed_mask(&self) -> u64 {
        self.all_confirmed_mask
    }

    /// The oldest buffered input-frame id.
    #[inline]
    #[must_use]
    pub fn st_ifd_id(&self) -> IfdId {
        self.buffer.st_frame_id()
    }

    /// One past the newest buffered input-frame id.
    #[inline]
    #[must_use]
    pub fn ed_ifd_id(&self) -> IfdId {
        self.buffer.ed_frame_id()
    }

    /// The number of buffered input frames.
    #[inline]
    #[must_use]
    pub fn count(&self) -> usize {
        self.buffer.count()
    }

    /// The slot capacity.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Returns the buffered frame at `id`, if still in the window.
    #[must_use]
    pub fn get(&self, id: IfdId) -> Option<&InputFrame> {
        self.buffer.get(id)
    }

    /// Mutable variant of [`get`](Self::get), for the confirmation tracker's
    /// stamping pass.
    pub fn get_mut(&mut self, id: IfdId) -> Option<&mut InputFrame> {
        self.buffer.get_mut(id)
    }

    /// The latest `(id, value)` input front for `join_index`.
    #[must_use]
    pub fn front(&self, join_index: JoinIndex) -> (IfdId, u64) {
        let slot = join_index.slot();
        (self.front_ids[slot], self.fronts[slot])
    }

    /// The smallest input-front id across all players. Players that have
    /// never reported sit at [`IfdId::NULL`].
    #[must_use]
    pub fn min_front_id(&self) -> IfdId {
        self.front_id_counts
            .keys()
            .next()
            .map_or(IfdId::NULL, |&raw| IfdId::new(raw))
    }

    /// The largest input-front id across all players.
    #[must_use]
    pub fn max_front_id(&self) -> IfdId {
        self.front_id_counts
            .keys()
            .next_back()
            .map_or(IfdId::NULL, |&raw| IfdId::new(raw))
    }

    /// Resets the store to its freshly constructed state without deallocating
    /// ring storage.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.fronts.iter_mut().for_each(|front| *front = 0);
        self.front_ids.iter_mut().for_each(|id| *id = IfdId::NULL);
        self.front_id_counts.clear();
        self.front_id_counts.insert(NULL_FRAME, self.players_cnt);
    }

    fn update_front(&mut self, join_index: JoinIndex, id: IfdId, value: u64) {
        let slot = join_index.slot();
        let old_id = self.front_ids[slot];
        if id <= old_id {
            return;
        }
        if let Some(count) = self.front_id_counts.get_mut(&old_id.as_i32()) {
            *count -= 1;
            if *count == 0 {
                self.front_id_counts.remove(&old_id.as_i32());
            }
        }
        *self.front_id_counts.entry(id.as_i32()).or_insert(0) += 1;
        self.front_ids[slot] = id;
        self.fronts[slot] = value;
    }

    /// The predicted input list for a not-yet-reported id: an inactive join
    /// index gets 0, an active one is carried forward from its input front.
    #[must_use]
    pub fn predicted_input_list(
        &self,
        inactive_join_mask: u64,
    ) -> SmallVec<[u64; INLINE_PLAYERS]> {
        (0..self.players_cnt)
            .map(|slot| {
                if inactive_join_mask & (1u64 << slot) != 0 {
                    0
                } else {
                    self.fronts[slot]
                }
            })
            .collect()
    }

    /// Makes `id` resident, prefabbing every id between the current end and
    /// `id` with predicted inputs (no confirmation bits). Prefabbing past a
    /// full buffer evicts from the head. Returns `None` if `id` is older than
    /// the buffer window.
    pub fn get_or_prefab(
        &mut self,
        id: IfdId,
        inactive_join_mask: u64,
    ) -> Option<&mut InputFrame> {
        if id < self.buffer.st_frame_id() {
            return None;
        }
        while self.buffer.ed_frame_id() <= id {
            let predicted = self.predicted_input_list(inactive_join_mask);
            let players_cnt = self.players_cnt;
            let (new_id, slot) = self.buffer.dry_put();
            let frame = slot.get_or_insert_with(|| InputFrame::blank(new_id, players_cnt));
            frame.reset(new_id, players_cnt);
            frame.input_list.copy_from_slice(&predicted);
        }
        self.buffer.get_mut(id)
    }

    /// Merges one input report per the confirmation precedence contract:
    ///
    /// - obsolete id → no-op;
    /// - sender already reliably confirmed → no-op (reliable is final);
    /// - sender fast-confirmed and this report is fast-only → no-op (fast
    ///   does not override fast; reliable may overwrite);
    /// - otherwise write the value, set the sender's bit on each channel that
    ///   carried this report, advance the sender's input front, and report
    ///   whether the stored value changed.
    pub fn upsert(
        &mut self,
        id: IfdId,
        join_index: JoinIndex,
        cmd: u64,
        via_reliable: bool,
        via_fast: bool,
        inactive_join_mask: u64,
    ) -> UpsertOutcome {
        let bit = join_index.mask();
        let existing_input_mutated;
        {
            let Some(frame) = self.get_or_prefab(id, inactive_join_mask) else {
                trace!(ifd_id = id.as_i32(), %join_index, "obsolete input, skipped");
                return UpsertOutcome::Obsolete;
            };
            if frame.confirmed_list & bit != 0 {
                return UpsertOutcome::AlreadyConfirmed;
            }
            if !via_reliable && frame.udp_confirmed_list & bit != 0 {
                return UpsertOutcome::AlreadyConfirmed;
            }
            let slot = join_index.slot();
            existing_input_mutated = frame.input_list[slot] != cmd;
            frame.input_list[slot] = cmd;
            if via_reliable {
                frame.confirmed_list |= bit;
            }
            if via_fast {
                frame.udp_confirmed_list |= bit;
            }
        }
        self.update_front(join_index, id, cmd);
        UpsertOutcome::Written {
            existing_input_mutated,
        }
    }

    /// Overwrites the frame at `src.id` with an authoritative downsync frame,
    /// stamping it fully confirmed and advancing every player's input front.
    ///
    /// Returns `Some(mutated)` with whether any stored input value changed, or
    /// `None` if the id is older than the buffer window.
    pub fn apply_authoritative(
        &mut self,
        src: &InputFrame,
        inactive_join_mask: u64,
    ) -> Option<bool> {
        let all_confirmed = self.all_confirmed_mask;
        let mutated;
        {
            let frame = self.get_or_prefab(src.id, inactive_join_mask)?;
            mutated = frame.input_list.as_slice() != src.input_list.as_slice();
            frame.input_list.clear();
            frame
                .input_list
                .extend_from_slice(src.input_list.as_slice());
            frame.confirmed_list = all_confirmed;
            frame.udp_confirmed_list |= src.udp_confirmed_list;
        }
        for slot in 0..self.players_cnt.min(src.input_list.len()) {
            self.update_front(JoinIndex::new(slot as u32 + 1), src.id, src.input_list[slot]);
        }
        Some(mutated)
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

    const P1: JoinIndex = JoinIndex::new(1);
    const P2: JoinIndex = JoinIndex::new(2);

    fn store() -> InputFrameStore {
        InputFrameStore::new(8, 2)
    }

    #[test]
    fn upsert_creates_and_confirms() {
        let mut store = store();
        let outcome = store.upsert(IfdId::new(0), P1, 7, true, false, 0);
        assert_eq!(
            outcome,
            UpsertOutcome::Written {
                existing_input_mutated: true
            }
        );
        let frame = store.get(IfdId::new(0)).unwrap();
        assert_eq!(frame.input_list.as_slice(), &[7, 0]);
        assert_eq!(frame.confirmed_list, 0b01);
        assert_eq!(frame.udp_confirmed_list, 0);
    }

    #[test]
    fn zero_value_still_counts_as_unchanged() {
        let mut store = store();
        // Prefab starts at 0, so writing 0 mutates nothing.
        let outcome = store.upsert(IfdId::new(0), P1, 0, true, false, 0);
        assert_eq!(
            outcome,
            UpsertOutcome::Written {
                existing_input_mutated: false
            }
        );
    }

    #[test]
    fn gap_prefab_predicts_from_fronts() {
        let mut store = store();
        store.upsert(IfdId::new(0), P1, 5, true, false, 0);
        store.upsert(IfdId::new(0), P2, 9, true, false, 0);
        // Jump to id 3: ids 1 and 2 get prefabbed from the fronts.
        store.upsert(IfdId::new(3), P1, 6, true, false, 0);
        let gap = store.get(IfdId::new(1)).unwrap();
        assert_eq!(gap.input_list.as_slice(), &[5, 9]);
        assert_eq!(gap.confirmed_list, 0);
        assert_eq!(gap.udp_confirmed_list, 0);
        let target = store.get(IfdId::new(3)).unwrap();
        assert_eq!(target.input_list.as_slice(), &[6, 9]);
    }

    #[test]
    fn gap_prefab_zeroes_inactive_players() {
        let mut store = store();
        store.upsert(IfdId::new(0), P1, 5, true, false, 0);
        store.upsert(IfdId::new(0), P2, 9, true, false, 0);
        // Player 2 went inactive before the gap was prefabbed.
        store.upsert(IfdId::new(2), P1, 5, true, false, P2.mask());
        assert_eq!(store.get(IfdId::new(1)).unwrap().input_list.as_slice(), &[5, 0]);
    }

    #[test]
    fn obsolete_id_is_ignored() {
        let mut store = InputFrameStore::new(2, 2);
        for id in 0..4 {
            store.upsert(IfdId::new(id), P1, id as u64, true, false, 0);
        }
        assert_eq!(store.st_ifd_id(), IfdId::new(2));
        let outcome = store.upsert(IfdId::new(0), P2, 1, true, false, 0);
        assert_eq!(outcome, UpsertOutcome::Obsolete);
    }

    #[test]
    fn reliable_confirmation_is_final() {
        let mut store = store();
        store.upsert(IfdId::new(0), P1, 5, true, false, 0);
        // Neither a reliable nor a fast retransmit may change it.
        assert_eq!(
            store.upsert(IfdId::new(0), P1, 6, true, false, 0),
            UpsertOutcome::AlreadyConfirmed
        );
        assert_eq!(
            store.upsert(IfdId::new(0), P1, 6, false, true, 0),
            UpsertOutcome::AlreadyConfirmed
        );
        assert_eq!(store.get(IfdId::new(0)).unwrap().input_list[0], 5);
    }

    #[test]
    fn fast_does_not_override_fast_but_reliable_does() {
        let mut store = store();
        store.upsert(IfdId::new(0), P1, 5, false, true, 0);
        assert_eq!(
            store.upsert(IfdId::new(0), P1, 6, false, true, 0),
            UpsertOutcome::AlreadyConfirmed
        );
        assert_eq!(store.get(IfdId::new(0)).unwrap().input_list[0], 5);
        // A reliable report may overwrite a fast-only slot.
        let outcome = store.upsert(IfdId::new(0), P1, 6, true, false, 0);
        assert_eq!(
            outcome,
            UpsertOutcome::Written {
                existing_input_mutated: true
            }
        );
        let frame = store.get(IfdId::new(0)).unwrap();
        assert_eq!(frame.input_list[0], 6);
        assert_eq!(frame.confirmed_list, 0b01);
        assert_eq!(frame.udp_confirmed_list, 0b01);
    }

    #[test]
    fn mutation_of_predicted_value_is_reported() {
        let mut store = store();
        store.upsert(IfdId::new(0), P1, 5, true, false, 0);
        store.upsert(IfdId::new(3), P1, 5, true, false, 0);
        // Id 1 was predicted as 5 for p1; the true value differs.
        let outcome = store.upsert(IfdId::new(1), P1, 8, false, true, 0);
        assert!(outcome.mutated_existing());
        // Id 2 was also predicted as 5; the true value agrees.
        let outcome = store.upsert(IfdId::new(2), P1, 5, false, true, 0);
        assert_eq!(
            outcome,
            UpsertOutcome::Written {
                existing_input_mutated: false
            }
        );
    }

    #[test]
    fn fronts_track_latest_known_input() {
        let mut store = store();
        assert_eq!(store.min_front_id(), IfdId::NULL);
        assert_eq!(store.max_front_id(), IfdId::NULL);
        store.upsert(IfdId::new(4), P1, 5, true, false, 0);
        assert_eq!(store.front(P1), (IfdId::new(4), 5));
        assert_eq!(store.min_front_id(), IfdId::NULL); // p2 never reported
        assert_eq!(store.max_front_id(), IfdId::new(4));
        store.upsert(IfdId::new(6), P2, 9, false, true, 0);
        assert_eq!(store.min_front_id(), IfdId::new(4));
        assert_eq!(store.max_front_id(), IfdId::new(6));
        // An older report does not move the front backward.
        store.upsert(IfdId::new(5), P2, 3, true, false, 0);
        assert_eq!(store.front(P2), (IfdId::new(6), 9));
    }

    #[test]
    fn apply_authoritative_overwrites_and_stamps() {
        let mut store = store();
        store.upsert(IfdId::new(0), P1, 5, false, true, 0);
        let mut src = InputFrame::blank(IfdId::new(0), 2);
        src.input_list[0] = 7;
        src.input_list[1] = 2;
        let mutated = store.apply_authoritative(&src, 0).unwrap();
        assert!(mutated);
        let frame = store.get(IfdId::new(0)).unwrap();
        assert_eq!(frame.input_list.as_slice(), &[7, 2]);
        assert_eq!(frame.confirmed_list, 0b11);
        assert_eq!(store.front(P1), (IfdId::new(0), 7));
        assert_eq!(store.front(P2), (IfdId::new(0), 2));
    }

    #[test]
    fn clear_resets_fronts_and_window() {
        let mut store = store();
        store.upsert(IfdId::new(5), P1, 5, true, false, 0);
        store.clear();
        assert_eq!(store.count(), 0);
        assert_eq!(store.st_ifd_id(), IfdId::new(0));
        assert_eq!(store.front(P1), (IfdId::NULL, 0));
        assert_eq!(store.min_front_id(), IfdId::NULL);
        assert_eq!(store.max_front_id(), IfdId::NULL);
    }
}
