//! Binary codec for wire payloads.
//!
//! Encapsulates the bincode configuration so every payload in the protocol is
//! serialized identically: `standard()` with fixed-int encoding, which keeps
//! message sizes deterministic across platforms and avoids variable-length
//! integer overhead for the small ids that dominate these payloads.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::SyncError;

fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Encodes a value into a new `Vec<u8>`.
///
/// For hot paths with a reusable buffer, prefer [`encode_into`] or
/// [`encode_append`].
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, SyncError> {
    bincode::serde::encode_to_vec(value, config()).map_err(|e| SyncError::SerializationError {
        context: format!("encode: {e}"),
    })
}

/// Encodes a value into an existing byte slice, returning the number of bytes
/// written. Fails if the buffer is too small.
pub fn encode_into<T: Serialize>(value: &T, buffer: &mut [u8]) -> Result<usize, SyncError> {
    bincode::serde::encode_into_slice(value, buffer, config()).map_err(|e| {
        SyncError::SerializationError {
            context: format!("encode into {}-byte buffer: {e}", buffer.len()),
        }
    })
}

/// Encodes a value by appending to `buffer`, returning the number of bytes
/// appended.
pub fn encode_append<T: Serialize>(value: &T, buffer: &mut Vec<u8>) -> Result<usize, SyncError> {
    let start_len = buffer.len();
    bincode::serde::encode_into_std_write(value, buffer, config())
        .map(|_| buffer.len() - start_len)
        .map_err(|e| SyncError::SerializationError {
            context: format!("encode append: {e}"),
        })
}

/// Decodes a value from a byte slice, returning the value and the number of
/// bytes consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), SyncError> {
    bincode::serde::decode_from_slice(bytes, config()).map_err(|e| {
        SyncError::SerializationError {
            context: format!("decode: {e}"),
        }
    })
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
    use crate::wire::messages::{DownsyncSnapshot, UpsyncSnapshot};
    use crate::{IfdId, InputFrame, JoinIndex, RdfId};

    #[test]
    fn upsync_round_trip() {
        let batch = UpsyncSnapshot::new(JoinIndex::new(2), IfdId::new(100), vec![0, 5, u64::MAX]);
        let bytes = encode(&batch).unwrap();
        let (back, consumed): (UpsyncSnapshot, usize) = decode(&bytes).unwrap();
        assert_eq!(back, batch);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn downsync_round_trip_with_ref_rdf() {
        let mut snapshot: DownsyncSnapshot<Vec<u8>> = DownsyncSnapshot::new(0b100, IfdId::new(7));
        let mut frame = InputFrame::blank(IfdId::new(7), 3);
        frame.input_list[1] = 42;
        frame.confirmed_list = 0b111;
        snapshot.ifd_batch.push(frame);
        snapshot.ref_rdf_id = Some(RdfId::new(31));
        snapshot.ref_rdf = Some(vec![1, 2, 3]);
        let bytes = encode(&snapshot).unwrap();
        let (back, _): (DownsyncSnapshot<Vec<u8>>, usize) = decode(&bytes).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn fixed_int_ids_are_four_bytes() {
        let bytes = encode(&IfdId::new(1)).unwrap();
        assert_eq!(bytes.len(), 4);
        let bytes = encode(&IfdId::new(0x7FFF_FFFF)).unwrap();
        assert_eq!(bytes.len(), 4);
    }

    #[test]
    fn encode_into_respects_buffer() {
        let batch = UpsyncSnapshot::new(JoinIndex::new(1), IfdId::new(0), vec![1, 2, 3, 4]);
        let mut buffer = [0u8; 256];
        let len = encode_into(&batch, &mut buffer).unwrap();
        let (back, _): (UpsyncSnapshot, usize) = decode(&buffer[..len]).unwrap();
        assert_eq!(back, batch);

        let mut tiny = [0u8; 4];
        assert!(encode_into(&batch, &mut tiny).is_err());
    }

    #[test]
    fn encode_append_builds_incrementally() {
        let mut buffer = Vec::new();
        let first = encode_append(&IfdId::new(3), &mut buffer).unwrap();
        let second = encode_append(&IfdId::new(4), &mut buffer).unwrap();
        assert_eq!(buffer.len(), first + second);
        let (a, used): (IfdId, usize) = decode(&buffer).unwrap();
        let (b, _): (IfdId, usize) = decode(&buffer[used..]).unwrap();
        assert_eq!((a, b), (IfdId::new(3), IfdId::new(4)));
    }

    #[test]
    fn truncated_payload_fails_to_decode() {
        let batch = UpsyncSnapshot::new(JoinIndex::new(1), IfdId::new(0), vec![1, 2]);
        let bytes = encode(&batch).unwrap();
        let result: Result<(UpsyncSnapshot, usize), _> = decode(&bytes[..bytes.len() - 1]);
        assert!(result.is_err());
    }
}
