use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{IfdId, JoinIndex};

/// Inline capacity of per-player input lists; battles with at most this many
/// players never heap-allocate per input frame.
pub const INLINE_PLAYERS: usize = 8;

/// One input frame: the inputs of every player for one input-frame id,
/// together with which join indices have confirmed them on which channel.
///
/// Input frames live exclusively inside an
/// [`InputFrameStore`](crate::InputFrameStore) ring buffer and are mutated in
/// place by merge/confirm operations. A frame is never partially valid: a ring
/// slot either holds a live frame with a real id or is a hole that gets
/// prefabbed (predicted) before anything reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFrame {
    /// The input-frame id this data belongs to.
    pub id: IfdId,
    /// One input value per join index; slot `k` belongs to join index `k + 1`.
    pub input_list: SmallVec<[u64; INLINE_PLAYERS]>,
    /// Bitmask over join indices confirmed via the reliable channel. Once set,
    /// a bit is never cleared except by slot reuse after eviction.
    pub confirmed_list: u64,
    /// Bitmask over join indices confirmed via the fast (unreliable) channel.
    pub udp_confirmed_list: u64,
}

impl InputFrame {
    /// Creates a blank frame (all inputs zero, nothing confirmed).
    #[must_use]
    pub fn blank(id: IfdId, players_cnt: usize) -> Self {
        let mut input_list = SmallVec::new();
        input_list.resize(players_cnt, 0);
        Self {
            id,
            input_list,
            confirmed_list: 0,
            udp_confirmed_list: 0,
        }
    }

    /// Re-initializes this frame in place for ring-slot reuse: new id, inputs
    /// zeroed to `players_cnt` slots, confirmations cleared.
    pub fn reset(&mut self, id: IfdId, players_cnt: usize) {
        self.id = id;
        self.input_list.clear();
        self.input_list.resize(players_cnt, 0);
        self.confirmed_list = 0;
        self.udp_confirmed_list = 0;
    }

    /// Returns the input value for `join_index`, or 0 if out of range.
    #[inline]
    #[must_use]
    pub fn input_for(&self, join_index: JoinIndex) -> u64 {
        self.input_list.get(join_index.slot()).copied().unwrap_or(0)
    }

    /// Returns `true` if `join_index` has reliably confirmed this frame.
    #[inline]
    #[must_use]
    pub fn is_confirmed(&self, join_index: JoinIndex) -> bool {
        self.confirmed_list & join_index.mask() != 0
    }

    /// Returns `true` if every bit of `all_confirmed_mask` is set in the
    /// reliable confirmation mask.
    #[inline]
    #[must_use]
    pub fn is_all_confirmed(&self, all_confirmed_mask: u64) -> bool {
        self.confirmed_list & all_confirmed_mask == all_confirmed_mask
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

    #[test]
    fn blank_frame_is_unconfirmed() {
        let frame = InputFrame::blank(IfdId::new(3), 2);
        assert_eq!(frame.id, IfdId::new(3));
        assert_eq!(frame.input_list.len(), 2);
        assert_eq!(frame.confirmed_list, 0);
        assert_eq!(frame.udp_confirmed_list, 0);
        assert!(!frame.is_confirmed(JoinIndex::new(1)));
    }

    #[test]
    fn reset_reclaims_storage_in_place() {
        let mut frame = InputFrame::blank(IfdId::new(0), 4);
        frame.input_list[2] = 77;
        frame.confirmed_list = 0b1111;
        frame.udp_confirmed_list = 0b0101;
        frame.reset(IfdId::new(9), 2);
        assert_eq!(frame.id, IfdId::new(9));
        assert_eq!(frame.input_list.as_slice(), &[0, 0]);
        assert_eq!(frame.confirmed_list, 0);
        assert_eq!(frame.udp_confirmed_list, 0);
    }

    #[test]
    fn confirmation_masks_are_per_join_index() {
        let mut frame = InputFrame::blank(IfdId::new(0), 2);
        frame.confirmed_list |= JoinIndex::new(2).mask();
        assert!(!frame.is_confirmed(JoinIndex::new(1)));
        assert!(frame.is_confirmed(JoinIndex::new(2)));
        assert!(!frame.is_all_confirmed(0b11));
        frame.confirmed_list |= JoinIndex::new(1).mask();
        assert!(frame.is_all_confirmed(0b11));
    }

    #[test]
    fn input_for_out_of_range_is_zero() {
        let frame = InputFrame::blank(IfdId::new(0), 2);
        assert_eq!(frame.input_for(JoinIndex::new(5)), 0);
    }

    #[test]
    fn serde_round_trip() {
        let mut frame = InputFrame::blank(IfdId::new(12), 2);
        frame.input_list[0] = 0xDEAD;
        frame.input_list[1] = 0xBEEF;
        frame.confirmed_list = 0b01;
        let json = serde_json::to_string(&frame).unwrap();
        let back: InputFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }
}
