//!
//! Concord: a replicated document model that converges.
//! This library provides an eventually consistent mapping from row ids to
//! field/value records, kept convergent across replicas through per-field
//! last-writer-wins merge, plus two continuously maintained views over it.
//!
//! ## Core Concepts
//!
//! * **Rows (`row::Row`)**: single mutable records — an id plus a field map. Rows own no
//!   merge logic; they package mutation requests for their document.
//! * **Documents (`doc::Doc`)**: the sole authority for applying updates. Every mutation,
//!   local or remote, funnels through `Doc::apply_update`, which merges per field against
//!   history and fans change notifications out to the views.
//! * **Sets (`set::Set`)**: cached, reactive filtered views over the rows (exact
//!   field/value match or arbitrary predicate), maintained incrementally.
//! * **Sequences (`seq::Seq`)**: totally ordered list views built on fractional sort
//!   keys, resolving concurrent-insert collisions deterministically.
//! * **Updates (`protocol::Update`)**: the immutable replicated unit — `(payload,
//!   timestamp, source)` — exchanged with the transport layer, which stays external;
//!   `Doc::history` provides the anti-entropy surface.
//!
//! Convergence needs no coordinator: any two replicas that apply the same
//! finite set of updates, in any delivery order, reach identical state.

pub mod clock;
pub mod constants;
pub mod doc;
pub mod events;
pub mod protocol;
pub mod row;
pub mod seq;
pub mod set;
pub mod value;

#[cfg(any(test, feature = "testing"))]
pub use clock::FixedClock;
pub use clock::{Clock, SystemClock};
pub use doc::{Doc, DocError};
pub use events::Subscription;
pub use protocol::{RowId, SourceFilter, SourceId, Timestamp, Update, create_id};
pub use row::{Row, RowError};
pub use seq::{Seq, SeqError, SeqItem};
pub use set::{RowRef, Set, SetError};
pub use value::{FieldMap, Value, fields_from_json};

/// Result type used throughout the Concord library.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the Concord library.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Structured document errors from the doc module
    #[error(transparent)]
    Doc(doc::DocError),

    /// Structured row errors from the row module
    #[error(transparent)]
    Row(row::RowError),

    /// Structured set errors from the set module
    #[error(transparent)]
    Set(set::SetError),

    /// Structured sequence errors from the seq module
    #[error(transparent)]
    Seq(seq::SeqError),
}

impl Error {
    /// Get the originating module for this error.
    pub fn module(&self) -> &'static str {
        match self {
            Error::Serialize(_) => "serialize",
            Error::Doc(_) => "doc",
            Error::Row(_) => "row",
            Error::Set(_) => "set",
            Error::Seq(_) => "seq",
        }
    }

    /// Check if this error is a malformed update or row id.
    pub fn is_invalid_update(&self) -> bool {
        match self {
            Error::Doc(err) => err.is_invalid_update() || err.is_invalid_row_id(),
            _ => false,
        }
    }

    /// Check if this error is an attempt to rewrite a row id.
    pub fn is_immutable_id(&self) -> bool {
        match self {
            Error::Row(err) => err.is_immutable_id(),
            _ => false,
        }
    }

    /// Check if this error is a removal attempt on a predicate set.
    pub fn is_unsupported_removal(&self) -> bool {
        match self {
            Error::Set(err) => err.is_unsupported_removal(),
            _ => false,
        }
    }

    /// Check if this error is an insert into an inverted or empty interval.
    pub fn is_impossible_insert(&self) -> bool {
        match self {
            Error::Seq(err) => err.is_impossible_insert(),
            _ => false,
        }
    }
}
