use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::{JoinIndex, RdfId};

/// This enum contains all error messages this library can return. Fallible API
/// functions generally return a [`Result<_, SyncError>`].
///
/// Note that obsolete or already-confirmed inputs are *not* errors: those are
/// normal protocol outcomes and surface as
/// [`UpsertOutcome`](crate::UpsertOutcome) variants instead.
///
/// [`Result<_, SyncError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SyncError {
    /// An invalid join index was provided. Join indices are 1-based and must
    /// not exceed the battle's player count.
    InvalidJoinIndex {
        /// The join index that was invalid.
        join_index: JoinIndex,
        /// The battle's player count.
        players_cnt: usize,
    },
    /// You made an invalid request, usually by using wrong parameters for
    /// function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// A render frame that must be resident in history was not found, e.g. the
    /// dynamics frontier was evicted before it was consumed.
    MissingRenderFrame {
        /// The render-frame id that was missing.
        rdf_id: RdfId,
    },
    /// Serialization or deserialization of a wire payload failed.
    SerializationError {
        /// A description of what failed to serialize/deserialize.
        context: String,
    },
}

impl Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::InvalidJoinIndex {
                join_index,
                players_cnt,
            } => {
                write!(
                    f,
                    "Invalid join index {}: must be within 1..={}",
                    join_index, players_cnt
                )
            }
            SyncError::InvalidRequest { info } => {
                write!(f, "Invalid Request: {}", info)
            }
            SyncError::MissingRenderFrame { rdf_id } => {
                write!(f, "Render frame {} is not resident in history", rdf_id)
            }
            SyncError::SerializationError { context } => {
                write!(f, "Serialization error: {}", context)
            }
        }
    }
}

impl Error for SyncError {}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn display_covers_all_variants() {
        let errors = [
            SyncError::InvalidJoinIndex {
                join_index: JoinIndex::new(3),
                players_cnt: 2,
            },
            SyncError::InvalidRequest {
                info: "bad".to_owned(),
            },
            SyncError::MissingRenderFrame {
                rdf_id: RdfId::new(42),
            },
            SyncError::SerializationError {
                context: "truncated".to_owned(),
            },
        ];
        for err in errors {
            assert!(!err.to_string().is_empty());
        }
    }

    #[test]
    fn join_index_error_names_both_sides() {
        let err = SyncError::InvalidJoinIndex {
            join_index: JoinIndex::new(5),
            players_cnt: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains('5'));
        assert!(msg.contains('4'));
    }
}
