//! Atomics-based ring buffer for concurrent producer/consumer handoff.
//!
//! Unlike [`FrameRingBuffer`](crate::FrameRingBuffer), which relies on the
//! per-battle external-lock contract, [`MpmcRingBuffer`] supports `try_put`,
//! `pop` and `pop_tail` from independent threads without an external lock.
//! Index bookkeeping is a single packed atomic word; each slot carries its own
//! short-lived lock for the value move itself.
//!
//! This type is for cross-thread handoff *outside* the per-battle hot path
//! (e.g. shuttling encoded snapshots to a broadcast thread); the sync engines
//! never use it internally.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

// Head and tail cursors are absolute wrapping u32 sequence numbers packed into
// one u64: `st` in the high half, `ed` in the low half. The live count is
// `ed - st` (wrapping), which stays unambiguous as long as capacity < 2^31.
#[inline]
const fn pack(st: u32, ed: u32) -> u64 {
    ((st as u64) << 32) | ed as u64
}

#[inline]
const fn unpack(state: u64) -> (u32, u32) {
    ((state >> 32) as u32, state as u32)
}

/// A bounded multi-producer/multi-consumer ring buffer.
///
/// `try_put` appends at the tail and fails (returning the value) when full;
/// `pop` removes from the head, `pop_tail` from the tail. All three may be
/// called concurrently from any number of threads.
#[derive(Debug)]
pub struct MpmcRingBuffer<T> {
    slots: Box<[Mutex<Option<T>>]>,
    n: usize,
    // Packed (st, ed) cursors; see `pack`.
    state: AtomicU64,
}

impl<T> MpmcRingBuffer<T> {
    /// Creates an empty buffer with `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or does not fit in 31 bits.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        assert!(capacity < (1 << 31), "ring buffer capacity too large");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Mutex::new(None));
        Self {
            slots: slots.into_boxed_slice(),
            n: capacity,
            state: AtomicU64::new(0),
        }
    }

    /// Returns the slot capacity.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.n
    }

    /// Returns the number of live values at the time of the call. Purely
    /// advisory under concurrency.
    #[must_use]
    pub fn len(&self) -> usize {
        let (st, ed) = unpack(self.state.load(Ordering::Acquire));
        ed.wrapping_sub(st) as usize
    }

    /// Returns `true` if the buffer held no values at the time of the call.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `value` at the tail, or returns it back if the buffer is full.
    pub fn try_put(&self, value: T) -> Result<(), T> {
        loop {
            let state = self.state.load(Ordering::Acquire);
            let (st, ed) = unpack(state);
            if ed.wrapping_sub(st) as usize >= self.n {
                return Err(value);
            }
            // Hold the target slot's lock across the cursor publish so that a
            // consumer claiming this sequence number blocks until the value is
            // in place.
            let mut guard = self.slots[ed as usize % self.n].lock();
            if guard.is_some() {
                // Previous occupant was claimed by a consumer that has not
                // finished taking it out yet.
                drop(guard);
                std::hint::spin_loop();
                continue;
            }
            if self
                .state
                .compare_exchange(
                    state,
                    pack(st, ed.wrapping_add(1)),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }
            *guard = Some(value);
            return Ok(());
        }
    }

    /// Removes and returns the oldest value, or `None` if empty.
    pub fn pop(&self) -> Option<T> {
        loop {
            let state = self.state.load(Ordering::Acquire);
            let (st, ed) = unpack(state);
            if st == ed {
                return None;
            }
            if self
                .state
                .compare_exchange(
                    state,
                    pack(st.wrapping_add(1), ed),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }
            // We own sequence number `st` now; the producer that published it
            // stored the value under the slot lock before we could get here.
            loop {
                let mut guard = self.slots[st as usize % self.n].lock();
                if let Some(value) = guard.take() {
                    return Some(value);
                }
                drop(guard);
                std::hint::spin_loop();
            }
        }
    }

    /// Removes and returns the newest value, or `None` if empty.
    pub fn pop_tail(&self) -> Option<T> {
        loop {
            let state = self.state.load(Ordering::Acquire);
            let (st, ed) = unpack(state);
            if st == ed {
                return None;
            }
            let target = ed.wrapping_sub(1);
            if self
                .state
                .compare_exchange(
                    state,
                    pack(st, target),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }
            loop {
                let mut guard = self.slots[target as usize % self.n].lock();
                if let Some(value) = guard.take() {
                    return Some(value);
                }
                drop(guard);
                std::hint::spin_loop();
            }
        }
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
    use std::sync::Arc;

    #[test]
    fn put_pop_round_trip() {
        let buffer = MpmcRingBuffer::new(4);
        assert!(buffer.try_put(1u32).is_ok());
        assert!(buffer.try_put(2).is_ok());
        assert_eq!(buffer.pop(), Some(1));
        assert_eq!(buffer.pop(), Some(2));
        assert_eq!(buffer.pop(), None);
    }

    #[test]
    fn pop_tail_is_lifo() {
        let buffer = MpmcRingBuffer::new(4);
        for i in 0..3u32 {
            assert!(buffer.try_put(i).is_ok());
        }
        assert_eq!(buffer.pop_tail(), Some(2));
        assert_eq!(buffer.pop(), Some(0));
        assert_eq!(buffer.pop_tail(), Some(1));
        assert!(buffer.is_empty());
    }

    #[test]
    fn full_buffer_rejects_put() {
        let buffer = MpmcRingBuffer::new(2);
        assert!(buffer.try_put(1u32).is_ok());
        assert!(buffer.try_put(2).is_ok());
        assert_eq!(buffer.try_put(3), Err(3));
        assert_eq!(buffer.pop(), Some(1));
        assert!(buffer.try_put(3).is_ok());
    }

    #[test]
    fn wraps_around_capacity() {
        let buffer = MpmcRingBuffer::new(3);
        for round in 0..10u32 {
            assert!(buffer.try_put(round).is_ok());
            assert_eq!(buffer.pop(), Some(round));
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn concurrent_producers_and_consumers_lose_nothing() {
        const PER_PRODUCER: usize = 1000;
        let buffer = Arc::new(MpmcRingBuffer::new(8));
        let mut handles = Vec::new();
        for producer in 0..4u64 {
            let buffer = Arc::clone(&buffer);
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_PRODUCER as u64 {
                    let mut value = producer * 1_000_000 + i;
                    loop {
                        match buffer.try_put(value) {
                            Ok(()) => break,
                            Err(v) => {
                                value = v;
                                std::thread::yield_now();
                            }
                        }
                    }
                }
            }));
        }
        let mut consumers = Vec::new();
        for consumer in 0..4 {
            let buffer = Arc::clone(&buffer);
            consumers.push(std::thread::spawn(move || {
                let mut seen = Vec::new();
                while seen.len() < PER_PRODUCER {
                    let taken = if consumer % 2 == 0 {
                        buffer.pop()
                    } else {
                        buffer.pop_tail()
                    };
                    match taken {
                        Some(v) => seen.push(v),
                        None => std::thread::yield_now(),
                    }
                }
                seen
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let mut all: Vec<u64> = Vec::new();
        for consumer in consumers {
            all.extend(consumer.join().unwrap());
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4 * PER_PRODUCER);
    }
}
