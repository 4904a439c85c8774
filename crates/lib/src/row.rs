//! A single mutable record.
//!
//! A [`Row`] holds the canonical field map for one entity. Rows own no merge
//! logic: `set` packages the requested change and hands it to the owning
//! [`Doc`], the sole authority for applying updates. The applied result —
//! which may differ from the request when concurrent updates win — flows
//! back through the row's notifications.
//!
//! [`Doc`]: crate::Doc

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use thiserror::Error;

use crate::constants::{ID_FIELD, SORT_FIELD};
use crate::doc::{Doc, DocShared};
use crate::events::{Listeners, Subscription};
use crate::protocol::{RowId, Update};
use crate::value::{FieldMap, Value};

/// Structured error types for row operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum RowError {
    /// The `id` field is fixed at creation and cannot be rewritten.
    #[error("row {id}: id cannot be changed (attempted {attempted})")]
    ImmutableId { id: RowId, attempted: String },
}

impl RowError {
    /// Check if this error is an attempt to rewrite a row id.
    pub fn is_immutable_id(&self) -> bool {
        matches!(self, RowError::ImmutableId { .. })
    }
}

impl From<RowError> for crate::Error {
    fn from(err: RowError) -> Self {
        crate::Error::Row(err)
    }
}

/// Handle to a single row. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Row {
    pub(crate) shared: Rc<RowShared>,
}

pub(crate) struct RowShared {
    pub(crate) id: RowId,
    pub(crate) doc: Weak<DocShared>,
    pub(crate) state: RefCell<FieldMap>,
    /// True until the first applied update has been announced.
    pub(crate) fresh: Cell<bool>,
    /// Cleared when a winning tombstone evicts the row; a detached row
    /// drops further mutation requests.
    pub(crate) live: Cell<bool>,
    pub(crate) events: RowEvents,
}

#[derive(Default)]
pub(crate) struct RowEvents {
    /// (winning update, applied changes)
    pub(crate) update: Listeners<(Update, FieldMap)>,
    /// (requested changes — `None` for a tombstone, applied changes)
    pub(crate) changes: Listeners<(Option<FieldMap>, FieldMap)>,
    /// applied changes
    pub(crate) change: Listeners<FieldMap>,
    pub(crate) removed: Listeners<()>,
}

impl Row {
    pub(crate) fn new(id: impl Into<RowId>, doc: Weak<DocShared>) -> Self {
        let id = id.into();
        let mut state = FieldMap::new();
        state.insert(ID_FIELD.to_string(), Value::Text(id.clone()));
        Row {
            shared: Rc::new(RowShared {
                id,
                doc,
                state: RefCell::new(state),
                fresh: Cell::new(true),
                live: Cell::new(true),
                events: RowEvents::default(),
            }),
        }
    }

    /// The row's immutable id.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Returns a single field value, cloned out of the live state.
    pub fn get(&self, key: impl AsRef<str>) -> Option<Value> {
        self.shared.state.borrow().get(key.as_ref()).cloned()
    }

    /// Snapshot of the current state. The live state keeps changing under
    /// subsequent updates; the snapshot does not.
    pub fn to_json(&self) -> FieldMap {
        self.shared.state.borrow().clone()
    }

    /// The current sort key, when the row carries a textual `_sort` field.
    pub(crate) fn sort_key(&self) -> Option<String> {
        match self.shared.state.borrow().get(SORT_FIELD) {
            Some(Value::Text(key)) => Some(key.clone()),
            _ => None,
        }
    }

    /// Requests a single-field change through the owning document.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> crate::Result<()> {
        let mut changes = FieldMap::new();
        changes.insert(key.into(), value.into());
        self.set_map(changes)
    }

    /// Requests a multi-field change through the owning document.
    ///
    /// The change is applied by the document, not here; whether each field
    /// actually changes depends on the per-field comparison against history.
    /// Fails with [`RowError::ImmutableId`] when `changes` tries to move the
    /// `id` field to a different value.
    pub fn set_map(&self, changes: FieldMap) -> crate::Result<()> {
        if let Some(attempted) = changes.get(ID_FIELD) {
            let unchanged = matches!(attempted, Value::Text(id) if *id == self.shared.id);
            if !unchanged {
                return Err(RowError::ImmutableId {
                    id: self.shared.id.clone(),
                    attempted: attempted.to_string(),
                }
                .into());
            }
        }
        self.request(Some(changes));
        Ok(())
    }

    /// Requests retraction of every currently present field (a row
    /// tombstone) through the owning document.
    pub fn clear(&self) -> crate::Result<()> {
        self.request(None);
        Ok(())
    }

    fn request(&self, changes: Option<FieldMap>) {
        // a row evicted by a tombstone no longer reaches its document;
        // a fresh row for the same id must be materialized through Doc
        if !self.shared.live.get() {
            return;
        }
        if let Some(doc) = self.shared.doc.upgrade() {
            Doc::from_shared(doc).local_update(self.shared.id.clone(), changes);
        }
    }

    /// Notifies on every winning update applied to this row, with the
    /// update and the fields it actually changed.
    pub fn on_update(&self, f: impl Fn(&Update, &FieldMap) + 'static) -> Subscription {
        self.shared
            .events
            .update
            .on(move |(update, applied)| f(update, applied))
    }

    /// Detaches an [`on_update`](Row::on_update) listener.
    pub fn off_update(&self, sub: Subscription) -> bool {
        self.shared.events.update.off(sub)
    }

    /// Notifies with the requested change set (`None` for a tombstone) and
    /// the fields that actually changed.
    pub fn on_changes(
        &self,
        f: impl Fn(Option<&FieldMap>, &FieldMap) + 'static,
    ) -> Subscription {
        self.shared
            .events
            .changes
            .on(move |(requested, applied)| f(requested.as_ref(), applied))
    }

    /// Detaches an [`on_changes`](Row::on_changes) listener.
    pub fn off_changes(&self, sub: Subscription) -> bool {
        self.shared.events.changes.off(sub)
    }

    /// Notifies with the fields that actually changed.
    pub fn on_change(&self, f: impl Fn(&FieldMap) + 'static) -> Subscription {
        self.shared.events.change.on(f)
    }

    /// Detaches an [`on_change`](Row::on_change) listener.
    pub fn off_change(&self, sub: Subscription) -> bool {
        self.shared.events.change.off(sub)
    }

    /// Notifies once a winning tombstone has evicted this row.
    pub fn on_removed(&self, f: impl Fn() + 'static) -> Subscription {
        self.shared.events.removed.on(move |_| f())
    }

    /// Detaches an [`on_removed`](Row::on_removed) listener.
    pub fn off_removed(&self, sub: Subscription) -> bool {
        self.shared.events.removed.off(sub)
    }
}

impl PartialEq for Row {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Row {}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Row")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state.borrow())
            .finish()
    }
}
