use serde::{Deserialize, Serialize};

use crate::frame_info::InputFrame;
use crate::{IfdId, JoinIndex, RdfId};

/// One player's upsync batch: a contiguous run of input values starting at
/// `st_ifd_id`, reported by `join_index`.
///
/// The same batch may arrive via the reliable channel, the fast channel, or
/// both; which channel carried it is metadata of the transport session, not of
/// the payload, so it is passed alongside rather than inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsyncSnapshot {
    /// The reporting player's join index.
    pub join_index: JoinIndex,
    /// The input-frame id of `cmd_list[0]`.
    pub st_ifd_id: IfdId,
    /// One input value per consecutive input-frame id.
    pub cmd_list: Vec<u64>,
}

impl UpsyncSnapshot {
    /// Creates a batch covering `st_ifd_id..st_ifd_id + cmd_list.len()`.
    #[must_use]
    pub fn new(join_index: JoinIndex, st_ifd_id: IfdId, cmd_list: Vec<u64>) -> Self {
        Self {
            join_index,
            st_ifd_id,
            cmd_list,
        }
    }

    /// One past the last input-frame id this batch covers.
    #[inline]
    #[must_use]
    pub fn ed_ifd_id(&self) -> IfdId {
        self.st_ifd_id + self.cmd_list.len() as i32
    }

    /// Returns `true` if the batch carries no commands.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cmd_list.is_empty()
    }
}

/// The authority's canonical broadcast: a contiguous batch of finalized input
/// frames, optionally accompanied by a reference render frame for reseeding.
///
/// `ifd_batch` ids are consecutive starting at `st_ifd_id`. Frames that were
/// force-confirmed under eviction pressure carry the bits of the players that
/// never reported in `unconfirmed_mask`, so clients can surface which inputs
/// were made up by the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownsyncSnapshot<S> {
    /// Join indices whose inputs inside this batch were finalized without an
    /// actual report (0 when every input was genuinely confirmed).
    pub unconfirmed_mask: u64,
    /// The input-frame id of `ifd_batch[0]`.
    pub st_ifd_id: IfdId,
    /// The finalized input frames, in id order.
    pub ifd_batch: Vec<InputFrame>,
    /// The id of `ref_rdf`, when present.
    pub ref_rdf_id: Option<RdfId>,
    /// A full render-frame state to reseed a joining or badly lagged client.
    pub ref_rdf: Option<S>,
}

impl<S> DownsyncSnapshot<S> {
    /// Creates an empty batch starting at `st_ifd_id`, without a reference
    /// render frame.
    #[must_use]
    pub fn new(unconfirmed_mask: u64, st_ifd_id: IfdId) -> Self {
        Self {
            unconfirmed_mask,
            st_ifd_id,
            ifd_batch: Vec::new(),
            ref_rdf_id: None,
            ref_rdf: None,
        }
    }

    /// One past the last input-frame id this batch covers.
    #[inline]
    #[must_use]
    pub fn ed_ifd_id(&self) -> IfdId {
        self.st_ifd_id + self.ifd_batch.len() as i32
    }

    /// Returns `true` if the snapshot carries neither input frames nor a
    /// reference render frame.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ifd_batch.is_empty() && self.ref_rdf.is_none()
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
    fn upsync_bounds() {
        let batch = UpsyncSnapshot::new(JoinIndex::new(1), IfdId::new(10), vec![1, 2, 3]);
        assert_eq!(batch.ed_ifd_id(), IfdId::new(13));
        assert!(!batch.is_empty());
        let empty = UpsyncSnapshot::new(JoinIndex::new(1), IfdId::new(10), vec![]);
        assert_eq!(empty.ed_ifd_id(), IfdId::new(10));
        assert!(empty.is_empty());
    }

    #[test]
    fn downsync_bounds() {
        let mut snapshot: DownsyncSnapshot<u32> = DownsyncSnapshot::new(0b10, IfdId::new(5));
        assert!(snapshot.is_empty());
        snapshot
            .ifd_batch
            .push(InputFrame::blank(IfdId::new(5), 2));
        assert_eq!(snapshot.ed_ifd_id(), IfdId::new(6));
        assert!(!snapshot.is_empty());
    }

    #[test]
    fn ref_rdf_alone_is_not_empty() {
        let mut snapshot: DownsyncSnapshot<u32> = DownsyncSnapshot::new(0, IfdId::new(0));
        snapshot.ref_rdf_id = Some(RdfId::new(40));
        snapshot.ref_rdf = Some(7);
        assert!(!snapshot.is_empty());
    }
}
