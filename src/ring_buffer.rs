//! Fixed-capacity circular buffers indexed by monotonic frame ids.
//!
//! [`FrameRingBuffer`] is the storage primitive shared by input history and
//! render-frame history: lookups are by *frame id*, not array offset, and a
//! miss ("not currently buffered") is a normal outcome: the id either has not
//! been produced yet or has already been evicted.
//!
//! The buffer never deallocates backing storage after construction:
//! [`FrameRingBuffer::dry_put`] hands out the next slot for in-place reuse,
//! [`FrameRingBuffer::clear`] and [`FrameRingBuffer::reset_to`] only reset
//! bookkeeping. This keeps per-tick allocation at zero once a battle is warm.

pub mod mpmc;

use std::marker::PhantomData;

use tracing::trace;

/// A frame-id newtype usable as the index space of a [`FrameRingBuffer`].
///
/// Implemented by [`RdfId`](crate::RdfId) and [`IfdId`](crate::IfdId); the
/// trait exists so one buffer implementation serves both id spaces without
/// letting them mix.
pub trait FrameId: Copy + Eq + Ord + std::fmt::Debug {
    /// Constructs the id from its raw `i32` value.
    fn from_raw(raw: i32) -> Self;
    /// Returns the raw `i32` value.
    fn raw(self) -> i32;
}

/// A capacity-`N` circular buffer addressed by monotonically increasing frame
/// ids.
///
/// Holds ids in the live window `[st_frame_id, ed_frame_id)`; putting past a
/// full buffer evicts the oldest id. Slot storage is reused, never
/// reallocated.
///
/// # Invariants
///
/// With `St`/`Ed`/`Cnt` the internal array cursors and `N` the capacity:
/// `0 <= St < N`, `0 <= Ed <= N`, `0 <= Cnt <= N`, and exactly one of
/// `St + Cnt == Ed` or `St + Cnt == Ed + N` holds. These are checked by debug
/// assertions after every mutation.
#[derive(Debug, Clone)]
pub struct FrameRingBuffer<I, T> {
    slots: Vec<Option<T>>,
    n: usize,
    st: usize,
    ed: usize,
    cnt: usize,
    st_frame_id: i32,
    ed_frame_id: i32,
    _id_space: PhantomData<I>,
}

impl<I: FrameId, T> FrameRingBuffer<I, T> {
    /// Creates an empty buffer with `capacity` slots, based at frame id 0.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            n: capacity,
            st: 0,
            ed: 0,
            cnt: 0,
            st_frame_id: 0,
            ed_frame_id: 0,
            _id_space: PhantomData,
        }
    }

    /// Returns the slot capacity.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.n
    }

    /// Returns the number of live frames.
    #[inline]
    #[must_use]
    pub fn count(&self) -> usize {
        self.cnt
    }

    /// Returns `true` if no frames are live.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cnt == 0
    }

    /// Returns `true` if the next put will evict the oldest frame.
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.cnt == self.n
    }

    /// The oldest live frame id (equals the end id when empty).
    #[inline]
    #[must_use]
    pub fn st_frame_id(&self) -> I {
        I::from_raw(self.st_frame_id)
    }

    /// One past the newest live frame id.
    #[inline]
    #[must_use]
    pub fn ed_frame_id(&self) -> I {
        I::from_raw(self.ed_frame_id)
    }

    fn offset_of(&self, id: i32) -> Option<usize> {
        if id < self.st_frame_id || id >= self.ed_frame_id {
            return None;
        }
        let offset = (id - self.st_frame_id) as usize;
        Some((self.st + offset) % self.n)
    }

    /// Returns the live frame at `id`, or `None` if the id is outside the
    /// current window. A miss is a normal outcome, not an error: the id has
    /// either not been created yet or has already been evicted.
    #[must_use]
    pub fn get(&self, id: I) -> Option<&T> {
        let idx = self.offset_of(id.raw())?;
        self.slots[idx].as_ref()
    }

    /// Mutable variant of [`get`](Self::get).
    pub fn get_mut(&mut self, id: I) -> Option<&mut T> {
        let idx = self.offset_of(id.raw())?;
        self.slots[idx].as_mut()
    }

    /// Returns the oldest live frame.
    #[must_use]
    pub fn first(&self) -> Option<&T> {
        if self.cnt == 0 {
            return None;
        }
        self.slots[self.st].as_ref()
    }

    /// Returns the newest live frame.
    #[must_use]
    pub fn last(&self) -> Option<&T> {
        if self.cnt == 0 {
            return None;
        }
        let idx = (self.st + self.cnt - 1) % self.n;
        self.slots[idx].as_ref()
    }

    /// Claims the slot for the next frame id, evicting the oldest frame first
    /// if the buffer is full, and returns the id together with the raw slot.
    ///
    /// This is the sole allocation point of the buffer: the returned slot may
    /// still hold the storage of a previously evicted occupant, which the
    /// caller is expected to reset in place (`get_or_insert_with` + field
    /// reset) rather than replace wholesale. The frame at the returned id is
    /// not observable through [`get`](Self::get) as anything but what the slot
    /// currently holds, so fill it before reading it back.
    pub fn dry_put(&mut self) -> (I, &mut Option<T>) {
        if self.cnt == self.n {
            // Evict the head to make room; storage stays behind for reuse.
            trace!(
                evicted_frame_id = self.st_frame_id,
                "ring buffer full, evicting head"
            );
            self.st = (self.st + 1) % self.n;
            self.st_frame_id += 1;
            self.cnt -= 1;
        }
        let id = self.ed_frame_id;
        let idx = (self.st + self.cnt) % self.n;
        self.ed_frame_id += 1;
        self.cnt += 1;
        self.recompute_ed();
        self.debug_check();
        (I::from_raw(id), &mut self.slots[idx])
    }

    /// Puts `value` at the next frame id, evicting the oldest frame if full,
    /// and returns the id it was assigned.
    pub fn put(&mut self, value: T) -> I {
        let (id, slot) = self.dry_put();
        *slot = Some(value);
        id
    }

    /// Removes the oldest frame, returning a reference to its (still-owned)
    /// storage. The storage is not deallocated; the slot will be reused by a
    /// later put.
    pub fn pop(&mut self) -> Option<&mut T> {
        if self.cnt == 0 {
            return None;
        }
        let idx = self.st;
        self.st = (self.st + 1) % self.n;
        self.st_frame_id += 1;
        self.cnt -= 1;
        self.recompute_ed();
        self.debug_check();
        self.slots[idx].as_mut()
    }

    /// Removes the newest frame, returning a reference to its storage.
    pub fn pop_tail(&mut self) -> Option<&mut T> {
        if self.cnt == 0 {
            return None;
        }
        self.cnt -= 1;
        self.ed_frame_id -= 1;
        self.recompute_ed();
        let idx = (self.st + self.cnt) % self.n;
        self.debug_check();
        self.slots[idx].as_mut()
    }

    /// Resets the buffer to empty at base id 0 without deallocating storage.
    /// Supports battle-instance reuse across matches without allocator churn.
    pub fn clear(&mut self) {
        self.st = 0;
        self.ed = 0;
        self.cnt = 0;
        self.st_frame_id = 0;
        self.ed_frame_id = 0;
        self.debug_check();
    }

    /// Clears the buffer and re-bases both id frontiers at `base`, so the next
    /// put is assigned frame id `base`. Used when seeding history from a
    /// reference frame instead of from the start of a battle.
    pub fn reset_to(&mut self, base: I) {
        self.clear();
        self.st_frame_id = base.raw();
        self.ed_frame_id = base.raw();
    }

    fn recompute_ed(&mut self) {
        let sum = self.st + self.cnt;
        self.ed = if sum > self.n { sum - self.n } else { sum };
    }

    #[inline]
    fn debug_check(&self) {
        debug_assert!(self.st < self.n);
        debug_assert!(self.ed <= self.n);
        debug_assert!(self.cnt <= self.n);
        debug_assert!(
            (self.st + self.cnt == self.ed) != (self.st + self.cnt == self.ed + self.n)
        );
        debug_assert_eq!(
            (self.ed_frame_id - self.st_frame_id) as usize,
            self.cnt
        );
    }

    #[cfg(test)]
    pub(crate) fn cursors(&self) -> (usize, usize, usize) {
        (self.st, self.ed, self.cnt)
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
    use crate::{IfdId, RdfId};

    fn assert_invariants<I: FrameId, T>(buffer: &FrameRingBuffer<I, T>) {
        let (st, ed, cnt) = buffer.cursors();
        let n = buffer.capacity();
        assert!(st < n);
        assert!(ed <= n);
        assert!(cnt <= n);
        assert!((st + cnt == ed) != (st + cnt == ed + n));
    }

    #[test]
    fn starts_empty_at_base_zero() {
        let buffer: FrameRingBuffer<IfdId, u32> = FrameRingBuffer::new(8);
        assert!(buffer.is_empty());
        assert_eq!(buffer.st_frame_id(), IfdId::new(0));
        assert_eq!(buffer.ed_frame_id(), IfdId::new(0));
        assert!(buffer.get(IfdId::new(0)).is_none());
    }

    #[test]
    fn put_assigns_sequential_ids() {
        let mut buffer: FrameRingBuffer<IfdId, u32> = FrameRingBuffer::new(4);
        for i in 0..4 {
            let id = buffer.put(i * 10);
            assert_eq!(id, IfdId::new(i as i32));
        }
        assert_eq!(buffer.count(), 4);
        assert_eq!(buffer.get(IfdId::new(2)), Some(&20));
    }

    #[test]
    fn full_put_evicts_head() {
        let mut buffer: FrameRingBuffer<IfdId, u32> = FrameRingBuffer::new(3);
        for i in 0..5u32 {
            buffer.put(i);
            assert_invariants(&buffer);
        }
        assert_eq!(buffer.count(), 3);
        assert_eq!(buffer.st_frame_id(), IfdId::new(2));
        assert_eq!(buffer.ed_frame_id(), IfdId::new(5));
        assert!(buffer.get(IfdId::new(1)).is_none());
        assert_eq!(buffer.get(IfdId::new(2)), Some(&2));
        assert_eq!(buffer.get(IfdId::new(4)), Some(&4));
    }

    #[test]
    fn get_outside_window_is_none_not_error() {
        let mut buffer: FrameRingBuffer<RdfId, &str> = FrameRingBuffer::new(4);
        buffer.put("a");
        assert!(buffer.get(RdfId::new(-1)).is_none());
        assert!(buffer.get(RdfId::new(1)).is_none());
        assert!(buffer.get(RdfId::new(100)).is_none());
    }

    #[test]
    fn pop_advances_start() {
        let mut buffer: FrameRingBuffer<IfdId, u32> = FrameRingBuffer::new(4);
        buffer.put(1);
        buffer.put(2);
        assert_eq!(buffer.pop().copied(), Some(1));
        assert_eq!(buffer.st_frame_id(), IfdId::new(1));
        assert_eq!(buffer.count(), 1);
        assert_eq!(buffer.pop().copied(), Some(2));
        assert!(buffer.pop().is_none());
        assert_invariants(&buffer);
    }

    #[test]
    fn pop_tail_retracts_end() {
        let mut buffer: FrameRingBuffer<IfdId, u32> = FrameRingBuffer::new(4);
        buffer.put(1);
        buffer.put(2);
        assert_eq!(buffer.pop_tail().copied(), Some(2));
        assert_eq!(buffer.ed_frame_id(), IfdId::new(1));
        // The freed id is reassigned by the next put.
        let id = buffer.put(99);
        assert_eq!(id, IfdId::new(1));
        assert_eq!(buffer.get(IfdId::new(1)), Some(&99));
        assert_invariants(&buffer);
    }

    #[test]
    fn clear_keeps_capacity_resets_ids() {
        let mut buffer: FrameRingBuffer<IfdId, u32> = FrameRingBuffer::new(4);
        for i in 0..7u32 {
            buffer.put(i);
        }
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.st_frame_id(), IfdId::new(0));
        let id = buffer.put(42);
        assert_eq!(id, IfdId::new(0));
    }

    #[test]
    fn reset_to_rebases_ids() {
        let mut buffer: FrameRingBuffer<RdfId, u32> = FrameRingBuffer::new(4);
        buffer.put(1);
        buffer.reset_to(RdfId::new(100));
        assert!(buffer.is_empty());
        let id = buffer.put(7);
        assert_eq!(id, RdfId::new(100));
        assert_eq!(buffer.get(RdfId::new(100)), Some(&7));
        assert!(buffer.get(RdfId::new(0)).is_none());
    }

    #[test]
    fn dry_put_reuses_evicted_storage() {
        let mut buffer: FrameRingBuffer<IfdId, Vec<u32>> = FrameRingBuffer::new(2);
        buffer.put(vec![1, 2, 3]);
        buffer.put(vec![4]);
        // Third put evicts id 0; the slot still holds the old Vec for reuse.
        let (id, slot) = buffer.dry_put();
        assert_eq!(id, IfdId::new(2));
        let storage = slot.get_or_insert_with(Vec::new);
        assert_eq!(*storage, vec![1, 2, 3]);
        storage.clear();
        storage.push(9);
        assert_eq!(buffer.get(IfdId::new(2)), Some(&vec![9]));
    }

    #[test]
    fn first_and_last_track_window() {
        let mut buffer: FrameRingBuffer<IfdId, u32> = FrameRingBuffer::new(3);
        assert!(buffer.first().is_none());
        for i in 0..5u32 {
            buffer.put(i);
        }
        assert_eq!(buffer.first(), Some(&2));
        assert_eq!(buffer.last(), Some(&4));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            DryPut,
            Pop,
            PopTail,
            Clear,
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                4 => Just(Op::DryPut),
                2 => Just(Op::Pop),
                1 => Just(Op::PopTail),
                1 => Just(Op::Clear),
            ]
        }

        proptest! {
            #[test]
            fn invariants_hold_under_arbitrary_ops(
                capacity in 1usize..16,
                ops in prop::collection::vec(op_strategy(), 0..256),
            ) {
                let mut buffer: FrameRingBuffer<IfdId, u64> = FrameRingBuffer::new(capacity);
                for op in ops {
                    match op {
                        Op::DryPut => {
                            let (id, slot) = buffer.dry_put();
                            *slot = Some(id.as_i32() as u64);
                        }
                        Op::Pop => {
                            let _ = buffer.pop();
                        }
                        Op::PopTail => {
                            let _ = buffer.pop_tail();
                        }
                        Op::Clear => buffer.clear(),
                    }
                    assert_invariants(&buffer);
                    // Window width always matches the live count.
                    prop_assert_eq!(
                        buffer.ed_frame_id() - buffer.st_frame_id(),
                        buffer.count() as i32
                    );
                }
            }

            #[test]
            fn live_window_contents_survive_eviction(
                capacity in 1usize..16,
                puts in 1usize..64,
            ) {
                let mut buffer: FrameRingBuffer<IfdId, u64> = FrameRingBuffer::new(capacity);
                for i in 0..puts {
                    buffer.put(i as u64);
                }
                let st = buffer.st_frame_id().as_i32();
                let ed = buffer.ed_frame_id().as_i32();
                prop_assert_eq!(ed, puts as i32);
                for id in st..ed {
                    prop_assert_eq!(buffer.get(IfdId::new(id)), Some(&(id as u64)));
                }
            }
        }
    }
}
