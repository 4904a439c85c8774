//! Update wire format and replication primitives.
//!
//! An [`Update`] is the immutable unit of mutation exchanged between
//! replicas: a `(payload, timestamp, source)` triple whose payload is either
//! a partial field map or the tombstone marker retracting a row. This module
//! also provides the primitives the merge engine and the replication
//! collaborator share: the total-order comparison deciding which of two
//! updates to the same field wins, source-frontier filtering for
//! anti-entropy exchange, canonical sorting, and unique id generation.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::FieldMap;

/// Row identifier.
pub type RowId = String;

/// Replica identity stamped on every update.
pub type SourceId = String;

/// Logical timestamp: milliseconds, strictly monotonic per source.
pub type Timestamp = i64;

/// Generates a globally unique row id.
pub fn create_id() -> RowId {
    uuid::Uuid::new_v4().to_string()
}

/// Positional wire form: `[[row id, changes | null], timestamp, source]`.
type UpdateWire = ((RowId, Option<FieldMap>), Timestamp, SourceId);

/// An immutable replicated mutation.
///
/// `changes` of `None` is the tombstone marker: "retract every currently
/// present field of this row". Updates serialize in the positional wire
/// shape consumed and produced by the replication layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "UpdateWire", into = "UpdateWire")]
pub struct Update {
    row_id: RowId,
    changes: Option<FieldMap>,
    timestamp: Timestamp,
    source: SourceId,
}

impl Update {
    /// Creates an update carrying `changes` for the row `row_id`.
    pub fn new(
        row_id: impl Into<RowId>,
        changes: Option<FieldMap>,
        timestamp: Timestamp,
        source: impl Into<SourceId>,
    ) -> Self {
        Self {
            row_id: row_id.into(),
            changes,
            timestamp,
            source: source.into(),
        }
    }

    /// Creates a tombstone update for the row `row_id`.
    pub fn tombstone(
        row_id: impl Into<RowId>,
        timestamp: Timestamp,
        source: impl Into<SourceId>,
    ) -> Self {
        Self::new(row_id, None, timestamp, source)
    }

    /// The target row id.
    pub fn row_id(&self) -> &str {
        &self.row_id
    }

    /// The carried field changes; `None` marks a tombstone.
    pub fn changes(&self) -> Option<&FieldMap> {
        self.changes.as_ref()
    }

    /// Whether this update retracts its row.
    pub fn is_tombstone(&self) -> bool {
        self.changes.is_none()
    }

    /// The logical timestamp.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// The identity of the replica that produced this update.
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl From<UpdateWire> for Update {
    fn from(((row_id, changes), timestamp, source): UpdateWire) -> Self {
        Self {
            row_id,
            changes,
            timestamp,
            source,
        }
    }
}

impl From<Update> for UpdateWire {
    fn from(update: Update) -> Self {
        ((update.row_id, update.changes), update.timestamp, update.source)
    }
}

/// Total order over updates: timestamp first, source identity breaks ties.
///
/// Distinct replicas carry distinct source ids and per-source timestamps are
/// strictly monotonic, so no ties survive between different updates.
pub fn order(a: &Update, b: &Update) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.source.cmp(&b.source))
}

/// Canonical deterministic ordering of an update collection.
pub fn sort(mut updates: Vec<Update>) -> Vec<Update> {
    updates.sort_by(|a, b| order(a, b).then_with(|| a.row_id.cmp(&b.row_id)));
    updates
}

/// Whether `update` passes `sources`: true when the filter has no frontier
/// entry for the update's source, or the update is newer than the frontier.
pub fn filter(update: &Update, sources: &SourceFilter) -> bool {
    sources.matches(update)
}

/// Per-source timestamp frontier restricting [`history`] output.
///
/// An empty filter matches everything. Recording `(source, timestamp)` pairs
/// excludes updates the peer has already seen, which is what an anti-entropy
/// exchange asks for.
///
/// [`history`]: crate::Doc::history
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceFilter {
    frontier: BTreeMap<SourceId, Timestamp>,
}

impl SourceFilter {
    /// A filter matching every update.
    pub fn all() -> Self {
        Self::default()
    }

    /// Records that everything from `source` up to and including
    /// `timestamp` has been seen.
    pub fn seen(mut self, source: impl Into<SourceId>, timestamp: Timestamp) -> Self {
        self.frontier.insert(source.into(), timestamp);
        self
    }

    /// Whether `update` lies beyond this frontier.
    pub fn matches(&self, update: &Update) -> bool {
        match self.frontier.get(update.source()) {
            None => true,
            Some(seen) => update.timestamp() > *seen,
        }
    }
}
