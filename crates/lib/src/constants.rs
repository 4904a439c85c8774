//! Constants used throughout the Concord library.
//!
//! Central definitions for reserved field names.

/// Reserved field name carrying a row's identity. Fixed at creation.
pub const ID_FIELD: &str = "id";

/// Reserved field name carrying a sequence member's sort key.
pub const SORT_FIELD: &str = "_sort";
