//! Error types for document operations.

use thiserror::Error;

/// Structured error types for document operations.
///
/// `InvalidUpdate` never surfaces as a return value: malformed updates are
/// dropped with an `invalid` notification, as expected under eventual
/// consistency where peers may gossip garbage.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DocError {
    /// An update arrived without a usable row id.
    #[error("invalid update: {reason}")]
    InvalidUpdate { reason: String },

    /// `add` was handed an `id` field that is not a non-empty string.
    #[error("invalid row id: {reason}")]
    InvalidRowId { reason: String },

    /// A view operation needed the owning document, but it was dropped.
    #[error("owning document no longer exists")]
    DocumentDropped,
}

impl DocError {
    /// Check if this error is a malformed update.
    pub fn is_invalid_update(&self) -> bool {
        matches!(self, DocError::InvalidUpdate { .. })
    }

    /// Check if this error is a malformed row id.
    pub fn is_invalid_row_id(&self) -> bool {
        matches!(self, DocError::InvalidRowId { .. })
    }
}

impl From<DocError> for crate::Error {
    fn from(err: DocError) -> Self {
        crate::Error::Doc(err)
    }
}
