//! # Lockstep Rollback
//!
//! The synchronization core of a rollback-netcode lockstep simulation, written
//! in 100% safe Rust. It reconciles per-player input streams that arrive out of
//! order, with loss, and over two channels of different reliability into one
//! deterministic timeline of simulation ticks.
//!
//! Memory is bounded by fixed-capacity, frame-id-indexed ring buffers; the cost
//! of correcting mispredictions is bounded by incremental re-simulation
//! ("chasing"). The crate deliberately contains no sockets and no game rules:
//! simulation itself is delegated to a user-provided [`TickSimulator`], and wire
//! payloads are plain serializable values (see [`wire`]).
//!
//! The two protocol roles are:
//! - [`BackendSyncEngine`]: the authority. Consumes per-player upsync batches,
//!   tracks confirmation, force-confirms under eviction pressure, and produces
//!   canonical downsync snapshots.
//! - [`FrontendSyncEngine`]: a client. Predicts missing remote inputs, detects
//!   mispredictions when true inputs arrive, and chases the live frontier after
//!   a rollback.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use backend::{BackendSyncEngine, LcacStepOutcome, UpsyncOutcome};
pub use confirmation::ConfirmationTracker;
pub use error::SyncError;
pub use frame_info::InputFrame;
pub use frontend::{FrontendSyncEngine, SyncIds};
pub use input_store::{InputFrameStore, UpsertOutcome};
pub use registry::{BattleHandle, BattleRegistry};
pub use ring_buffer::mpmc::MpmcRingBuffer;
pub use ring_buffer::{FrameId, FrameRingBuffer};
pub use wire::messages::{DownsyncSnapshot, UpsyncSnapshot};

pub mod backend;
pub mod confirmation;
#[doc(hidden)]
pub mod error;
#[doc(hidden)]
pub mod frame_info;
pub mod frontend;
pub mod input_store;
pub mod registry;
pub mod ring_buffer;
/// Wire payload shapes and their binary codec.
pub mod wire {
    /// Binary codec for wire payloads, built on bincode with fixed-int encoding.
    pub mod codec;
    #[doc(hidden)]
    pub mod messages;
}

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no frame / invalid frame, for both id spaces.
pub const NULL_FRAME: i32 = -1;

/// Default log2 of the number of render frames covered by one input frame.
///
/// With the default of 2, each input frame covers `1 << 2 = 4` render frames;
/// sampling input at a quarter of the tick rate keeps upsync traffic small
/// without a noticeable change in responsiveness.
pub const DEFAULT_INPUT_SCALE_FRAMES: u32 = 2;

/// Default number of render frames an input frame is delayed before first use.
///
/// A small delay gives inputs time to propagate to peers before the tick that
/// consumes them, shrinking the average rollback depth.
pub const DEFAULT_INPUT_DELAY_FRAMES: i32 = 2;

/// Default input-frame ring capacity for the backend: 30 seconds of input
/// history at 60 ticks per second, plus one slot.
pub const DEFAULT_BACKEND_INPUT_BUFFER_SIZE: usize =
    ((30 * 60) >> DEFAULT_INPUT_SCALE_FRAMES) + 1;

/// How far beyond the end of a full input buffer an upsync batch may start
/// before the backend rejects it outright instead of force-evicting.
pub const UPSYNC_ST_IFD_ID_TOLERANCE: i32 = 8;

/// Default ceiling on render frames re-simulated per chase invocation.
pub const DEFAULT_MAX_CHASING_RDFS_PER_UPDATE: i32 = 9;

/// The maximum number of players a battle can hold: one bit per join index in
/// the `u64` confirmation masks.
pub const MAX_PLAYERS: usize = 64;

// #############
// # FRAME IDS #
// #############

macro_rules! frame_id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug,
            Copy,
            Clone,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Default,
            serde::Serialize,
            serde::Deserialize,
        )]
        pub struct $name(i32);

        impl $name {
            /// The null id, representing "no frame" / "uninitialized".
            pub const NULL: $name = $name(NULL_FRAME);

            /// Creates a new id from an `i32` value without validation.
            #[inline]
            #[must_use]
            pub const fn new(id: i32) -> Self {
                $name(id)
            }

            /// Returns the underlying `i32` value.
            #[inline]
            #[must_use]
            pub const fn as_i32(self) -> i32 {
                self.0
            }

            /// Returns `true` if this id equals [`NULL_FRAME`].
            #[inline]
            #[must_use]
            pub const fn is_null(self) -> bool {
                self.0 == NULL_FRAME
            }

            /// Returns `true` if this id is a real (non-negative) frame id.
            #[inline]
            #[must_use]
            pub const fn is_valid(self) -> bool {
                self.0 >= 0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                if self.is_null() {
                    write!(f, "NULL_FRAME")
                } else {
                    write!(f, "{}", self.0)
                }
            }
        }

        impl std::ops::Add<i32> for $name {
            type Output = $name;

            #[inline]
            fn add(self, rhs: i32) -> Self::Output {
                $name(self.0 + rhs)
            }
        }

        impl std::ops::AddAssign<i32> for $name {
            #[inline]
            fn add_assign(&mut self, rhs: i32) {
                self.0 += rhs;
            }
        }

        impl std::ops::Sub<i32> for $name {
            type Output = $name;

            #[inline]
            fn sub(self, rhs: i32) -> Self::Output {
                $name(self.0 - rhs)
            }
        }

        impl std::ops::Sub<$name> for $name {
            type Output = i32;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }

        impl From<i32> for $name {
            #[inline]
            fn from(value: i32) -> Self {
                $name(value)
            }
        }

        impl From<$name> for i32 {
            #[inline]
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl crate::ring_buffer::FrameId for $name {
            #[inline]
            fn from_raw(raw: i32) -> Self {
                $name(raw)
            }

            #[inline]
            fn raw(self) -> i32 {
                self.0
            }
        }
    };
}

frame_id_newtype! {
    /// Identifies one render frame: a single discrete simulation tick.
    ///
    /// Render-frame ids are strictly increasing; each tick advances the
    /// simulation from id `n` to `n + 1`. The special value [`RdfId::NULL`]
    /// (-1) represents "no frame".
    RdfId
}

frame_id_newtype! {
    /// Identifies one input frame: the per-player input data covering a
    /// contiguous, fixed-size range of render frames (see [`FrameWindow`]).
    ///
    /// The special value [`IfdId::NULL`] (-1) represents "no frame"; it is also
    /// the initial "last consecutively all-confirmed" id, meaning no input
    /// frame is confirmed yet.
    IfdId
}

/// A stable, 1-based per-player slot number within a battle.
///
/// Join index `n` owns bit `n - 1` in the `u64` confirmation masks, so a battle
/// holds at most [`MAX_PLAYERS`] players.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct JoinIndex(u32);

impl JoinIndex {
    /// Creates a new join index. Valid indices are `1..=MAX_PLAYERS`; validity
    /// against a concrete battle's player count is checked at the engine
    /// boundary.
    #[inline]
    #[must_use]
    pub const fn new(index: u32) -> Self {
        JoinIndex(index)
    }

    /// Returns the underlying 1-based index.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Returns the 0-based slot offset into per-player lists.
    #[inline]
    #[must_use]
    pub const fn slot(self) -> usize {
        (self.0 - 1) as usize
    }

    /// Returns this player's bit in a confirmation mask.
    #[inline]
    #[must_use]
    pub const fn mask(self) -> u64 {
        1u64 << (self.0 - 1)
    }

    /// Returns `true` if this index is within a battle of `players_cnt` players.
    #[inline]
    #[must_use]
    pub const fn is_within(self, players_cnt: usize) -> bool {
        1 <= self.0 && self.0 as usize <= players_cnt
    }
}

impl std::fmt::Display for JoinIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returns the mask with one confirmation bit set per join index in
/// `1..=players_cnt`.
#[inline]
#[must_use]
pub const fn all_confirmed_mask(players_cnt: usize) -> u64 {
    if players_cnt >= MAX_PLAYERS {
        u64::MAX
    } else {
        (1u64 << players_cnt) - 1
    }
}

// ###############
// # FRAME WINDOW #
// ###############

/// Maps between the two frame-id spaces.
///
/// One input frame covers `1 << input_scale_frames` consecutive render frames,
/// offset by `input_delay_frames`: input frame `k` is first consumed at render
/// frame `(k << scale) + delay` and last consumed `(1 << scale) - 1` render
/// frames later.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FrameWindow {
    /// Log2 of the number of render frames covered per input frame.
    pub input_scale_frames: u32,
    /// Render frames an input frame is delayed before first use.
    pub input_delay_frames: i32,
}

impl Default for FrameWindow {
    fn default() -> Self {
        Self {
            input_scale_frames: DEFAULT_INPUT_SCALE_FRAMES,
            input_delay_frames: DEFAULT_INPUT_DELAY_FRAMES,
        }
    }
}

impl FrameWindow {
    /// The input-frame id covering `rdf_id` under a caller-chosen delay.
    ///
    /// Ids before the delay window all map to input frame 0; the delay may be
    /// negative (see [`generating_ifd_id`](Self::generating_ifd_id)).
    #[inline]
    #[must_use]
    pub const fn ifd_id_for(self, rdf_id: RdfId, delay: i32) -> IfdId {
        let raw = rdf_id.as_i32();
        if raw < delay {
            IfdId::new(0)
        } else {
            IfdId::new((raw - delay) >> self.input_scale_frames)
        }
    }

    /// The input-frame id whose data is consumed when simulating `rdf_id`.
    #[inline]
    #[must_use]
    pub const fn delayed_ifd_id(self, rdf_id: RdfId) -> IfdId {
        self.ifd_id_for(rdf_id, self.input_delay_frames)
    }

    /// The input-frame id a local player is generating while `rdf_id` is the
    /// live tick. `extra_delay` shifts generation further ahead, which some
    /// drivers use to smooth jittery input devices.
    #[inline]
    #[must_use]
    pub const fn generating_ifd_id(self, rdf_id: RdfId, extra_delay: i32) -> IfdId {
        self.ifd_id_for(rdf_id, -extra_delay)
    }

    /// The first render frame that consumes input frame `ifd_id`.
    #[inline]
    #[must_use]
    pub const fn first_used_rdf_id(self, ifd_id: IfdId) -> RdfId {
        RdfId::new((ifd_id.as_i32() << self.input_scale_frames) + self.input_delay_frames)
    }

    /// The last render frame that consumes input frame `ifd_id`.
    #[inline]
    #[must_use]
    pub const fn last_used_rdf_id(self, ifd_id: IfdId) -> RdfId {
        RdfId::new(
            (ifd_id.as_i32() << self.input_scale_frames)
                + self.input_delay_frames
                + (1 << self.input_scale_frames)
                - 1,
        )
    }
}

// ##################
// # STEP COLLABORATOR #
// ##################

/// The external simulation collaborator: advances opaque render state by one
/// tick using one input frame.
///
/// Implementations must be deterministic: identical `(from_rdf_id, state,
/// input)` always produce an identical result, or clients will silently
/// diverge from the authority. The sync engines never inspect `State`; they
/// only store, copy, and replay it.
pub trait TickSimulator {
    /// The opaque per-tick simulation state.
    type State;

    /// Produces the state of `from_rdf_id + 1` from the state of `from_rdf_id`
    /// and the input frame covering it.
    fn step_one_tick(
        &mut self,
        from_rdf_id: RdfId,
        state: &Self::State,
        input: &InputFrame,
    ) -> Self::State;
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
mod frame_id_tests {
    use super::*;

    #[test]
    fn null_ids_are_null() {
        assert!(RdfId::NULL.is_null());
        assert!(IfdId::NULL.is_null());
        assert!(!RdfId::new(0).is_null());
    }

    #[test]
    fn validity_is_non_negative() {
        assert!(RdfId::new(0).is_valid());
        assert!(IfdId::new(12345).is_valid());
        assert!(!IfdId::new(-2).is_valid());
        assert!(!RdfId::NULL.is_valid());
    }

    #[test]
    fn arithmetic_round_trips() {
        let id = IfdId::new(10);
        assert_eq!(id + 5, IfdId::new(15));
        assert_eq!(id - 3, IfdId::new(7));
        assert_eq!(IfdId::new(15) - id, 5);
        let mut id = RdfId::new(0);
        id += 4;
        assert_eq!(id, RdfId::new(4));
    }

    #[test]
    fn display_names_null() {
        assert_eq!(format!("{}", RdfId::NULL), "NULL_FRAME");
        assert_eq!(format!("{}", RdfId::new(7)), "7");
    }

    #[test]
    fn join_index_masks() {
        assert_eq!(JoinIndex::new(1).mask(), 0b01);
        assert_eq!(JoinIndex::new(2).mask(), 0b10);
        assert_eq!(JoinIndex::new(5).mask(), 0b10000);
        assert_eq!(JoinIndex::new(3).slot(), 2);
        assert!(JoinIndex::new(2).is_within(2));
        assert!(!JoinIndex::new(3).is_within(2));
        assert!(!JoinIndex::new(0).is_within(2));
    }

    #[test]
    fn all_confirmed_masks() {
        assert_eq!(all_confirmed_mask(1), 0b1);
        assert_eq!(all_confirmed_mask(2), 0b11);
        assert_eq!(all_confirmed_mask(4), 0b1111);
        assert_eq!(all_confirmed_mask(64), u64::MAX);
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod frame_window_tests {
    use super::*;

    fn w() -> FrameWindow {
        FrameWindow::default()
    }

    #[test]
    fn delayed_ifd_id_matches_defaults() {
        // scale=2, delay=2: rdf ids 0..=1 map to ifd 0; then windows of 4.
        assert_eq!(w().delayed_ifd_id(RdfId::new(0)), IfdId::new(0));
        assert_eq!(w().delayed_ifd_id(RdfId::new(1)), IfdId::new(0));
        assert_eq!(w().delayed_ifd_id(RdfId::new(2)), IfdId::new(0));
        assert_eq!(w().delayed_ifd_id(RdfId::new(5)), IfdId::new(0));
        assert_eq!(w().delayed_ifd_id(RdfId::new(6)), IfdId::new(1));
        assert_eq!(w().delayed_ifd_id(RdfId::new(9)), IfdId::new(1));
        assert_eq!(w().delayed_ifd_id(RdfId::new(10)), IfdId::new(2));
    }

    #[test]
    fn used_range_brackets_each_ifd() {
        for raw in 0..64 {
            let ifd = IfdId::new(raw);
            let first = w().first_used_rdf_id(ifd);
            let last = w().last_used_rdf_id(ifd);
            assert_eq!(last - first, (1 << w().input_scale_frames) - 1);
            assert_eq!(w().delayed_ifd_id(first), ifd);
            assert_eq!(w().delayed_ifd_id(last), ifd);
            assert_eq!(w().delayed_ifd_id(last + 1), ifd + 1);
        }
    }

    #[test]
    fn generating_ifd_id_leads_delayed() {
        // The id being generated at a tick is never behind the id consumed.
        for raw in 0..256 {
            let rdf = RdfId::new(raw);
            assert!(w().generating_ifd_id(rdf, 0) >= w().delayed_ifd_id(rdf));
        }
    }

    #[test]
    fn first_used_of_generating_is_in_the_future() {
        // Whatever ifd a tick generates is only consumed at a strictly later
        // tick, which is what makes local input available in time.
        for raw in 2..256 {
            let rdf = RdfId::new(raw);
            let gen = w().generating_ifd_id(rdf, 0);
            assert!(w().last_used_rdf_id(gen) >= rdf);
        }
    }

    #[test]
    fn backend_buffer_size_constant() {
        assert_eq!(DEFAULT_BACKEND_INPUT_BUFFER_SIZE, 451);
    }
}
