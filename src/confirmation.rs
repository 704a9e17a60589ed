//! Tracking of the last consecutively all-confirmed input frame ("lcac").
//!
//! The lcac id is the authority's watermark: every input frame up to and
//! including it carries a full reliable confirmation mask, so every render
//! frame derived from those inputs is final and safe to broadcast, persist, or
//! evict. The watermark only moves forward, either by scanning freshly
//! confirmed frames ([`move_forward`](ConfirmationTracker::move_forward)) or
//! by force-confirmation under eviction pressure
//! ([`force_to`](ConfirmationTracker::force_to)).

use tracing::trace;

use crate::input_store::InputFrameStore;
use crate::IfdId;

/// The all-confirmed watermark over an [`InputFrameStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationTracker {
    lcac_ifd_id: IfdId,
}

impl Default for ConfirmationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfirmationTracker {
    /// Creates a tracker with nothing confirmed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lcac_ifd_id: IfdId::NULL,
        }
    }

    /// The last consecutively all-confirmed input-frame id, or [`IfdId::NULL`]
    /// if no input frame is confirmed yet.
    #[inline]
    #[must_use]
    pub const fn lcac_ifd_id(self) -> IfdId {
        self.lcac_ifd_id
    }

    /// Scans forward from the watermark toward `proposed_end_ifd_id`
    /// (exclusive), advancing over every frame whose reliable mask, widened
    /// by `skippable_join_mask` for players known inactive, covers the
    /// store's full mask. Each frame passed over is stamped fully confirmed,
    /// so inactive players' slots read as confirmed from then on.
    ///
    /// Ids that already fell off the head of the store are skipped without
    /// blocking the scan; the first resident-but-unconfirmed (or missing)
    /// frame stops it. Returns the watermark from before the call.
    pub fn move_forward(
        &mut self,
        store: &mut InputFrameStore,
        proposed_end_ifd_id: IfdId,
        skippable_join_mask: u64,
    ) -> IfdId {
        let old_lcac_ifd_id = self.lcac_ifd_id;
        let all_confirmed_mask = store.all_confirmed_mask();
        let mut id = self.lcac_ifd_id + 1;
        while id < proposed_end_ifd_id {
            if id < store.st_ifd_id() {
                // Already evicted; nothing left to confirm here.
                id += 1;
                continue;
            }
            let Some(frame) = store.get_mut(id) else {
                break;
            };
            if (frame.confirmed_list | skippable_join_mask) & all_confirmed_mask
                != all_confirmed_mask
            {
                break;
            }
            frame.confirmed_list = all_confirmed_mask;
            self.lcac_ifd_id = id;
            id += 1;
        }
        if self.lcac_ifd_id != old_lcac_ifd_id {
            trace!(
                old = old_lcac_ifd_id.as_i32(),
                new = self.lcac_ifd_id.as_i32(),
                "all-confirmed watermark advanced"
            );
        }
        old_lcac_ifd_id
    }

    /// Forces the watermark to at least `ifd_id`. Used when eviction pressure
    /// makes frames final regardless of missing confirmations, and by clients
    /// consuming authoritative downsync frames.
    #[inline]
    pub fn force_to(&mut self, ifd_id: IfdId) {
        if ifd_id > self.lcac_ifd_id {
            self.lcac_ifd_id = ifd_id;
        }
    }

    /// Resets the watermark to "nothing confirmed".
    #[inline]
    pub fn clear(&mut self) {
        self.lcac_ifd_id = IfdId::NULL;
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
    use crate::JoinIndex;

    const P1: JoinIndex = JoinIndex::new(1);
    const P2: JoinIndex = JoinIndex::new(2);

    fn confirmed_store(up_to: i32) -> InputFrameStore {
        let mut store = InputFrameStore::new(16, 2);
        for id in 0..=up_to {
            store.upsert(IfdId::new(id), P1, 1, true, false, 0);
            store.upsert(IfdId::new(id), P2, 2, true, false, 0);
        }
        store
    }

    #[test]
    fn starts_at_null() {
        let tracker = ConfirmationTracker::new();
        assert_eq!(tracker.lcac_ifd_id(), IfdId::NULL);
    }

    #[test]
    fn advances_over_fully_confirmed_prefix() {
        let mut store = confirmed_store(4);
        let mut tracker = ConfirmationTracker::new();
        let old = tracker.move_forward(&mut store, IfdId::new(5), 0);
        assert_eq!(old, IfdId::NULL);
        assert_eq!(tracker.lcac_ifd_id(), IfdId::new(4));
    }

    #[test]
    fn proposed_end_is_exclusive() {
        let mut store = confirmed_store(4);
        let mut tracker = ConfirmationTracker::new();
        tracker.move_forward(&mut store, IfdId::new(3), 0);
        assert_eq!(tracker.lcac_ifd_id(), IfdId::new(2));
    }

    #[test]
    fn stops_at_first_incomplete_frame() {
        let mut store = confirmed_store(4);
        // Frame 2 is missing p2's confirmation.
        store.get_mut(IfdId::new(2)).unwrap().confirmed_list = P1.mask();
        let mut tracker = ConfirmationTracker::new();
        tracker.move_forward(&mut store, IfdId::new(5), 0);
        assert_eq!(tracker.lcac_ifd_id(), IfdId::new(1));
        // Frames 3 and 4 stay fully confirmed but unreachable until 2 fills.
        store.get_mut(IfdId::new(2)).unwrap().confirmed_list |= P2.mask();
        tracker.move_forward(&mut store, IfdId::new(5), 0);
        assert_eq!(tracker.lcac_ifd_id(), IfdId::new(4));
    }

    #[test]
    fn skippable_mask_covers_inactive_player() {
        let mut store = confirmed_store(4);
        store.get_mut(IfdId::new(2)).unwrap().confirmed_list = P1.mask();
        let mut tracker = ConfirmationTracker::new();
        tracker.move_forward(&mut store, IfdId::new(5), P2.mask());
        assert_eq!(tracker.lcac_ifd_id(), IfdId::new(4));
        // The skipped frame got stamped fully confirmed.
        assert_eq!(
            store.get(IfdId::new(2)).unwrap().confirmed_list,
            store.all_confirmed_mask()
        );
    }

    #[test]
    fn stops_at_missing_frame() {
        let mut store = confirmed_store(2);
        let mut tracker = ConfirmationTracker::new();
        tracker.move_forward(&mut store, IfdId::new(10), 0);
        assert_eq!(tracker.lcac_ifd_id(), IfdId::new(2));
    }

    #[test]
    fn evicted_ids_are_skipped_not_blocking() {
        let mut store = InputFrameStore::new(4, 2);
        // Fill ids 0..8 so the window slides to [4, 8).
        for id in 0..8 {
            store.upsert(IfdId::new(id), P1, 1, true, false, 0);
            store.upsert(IfdId::new(id), P2, 2, true, false, 0);
        }
        assert_eq!(store.st_ifd_id(), IfdId::new(4));
        let mut tracker = ConfirmationTracker::new();
        tracker.move_forward(&mut store, IfdId::new(8), 0);
        assert_eq!(tracker.lcac_ifd_id(), IfdId::new(7));
    }

    #[test]
    fn force_to_never_moves_backward() {
        let mut tracker = ConfirmationTracker::new();
        tracker.force_to(IfdId::new(10));
        assert_eq!(tracker.lcac_ifd_id(), IfdId::new(10));
        tracker.force_to(IfdId::new(3));
        assert_eq!(tracker.lcac_ifd_id(), IfdId::new(10));
        tracker.clear();
        assert_eq!(tracker.lcac_ifd_id(), IfdId::NULL);
    }
}
