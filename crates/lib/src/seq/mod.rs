//! The ordered-list view: a [`Set`] kept in ascending `_sort` order.
//!
//! A [`Seq`] is an exact-match set whose members additionally carry a
//! fractional sort key in the reserved `_sort` field. Inserting between two
//! neighbors computes a key strictly between theirs ([`keys`]), so nothing
//! else is renumbered; a short random suffix makes concurrent same-position
//! inserts unlikely to collide exactly. When two distinct members do end up
//! with equal keys, the sequence nudges the changed one forward through an
//! ordinary update — the resolution replicates like any other mutation and
//! converges on every replica that observes the collision.
//!
//! Items are relative to each other, more like a linked list than an
//! index-addressed array; `before`/`after`/`push`/`unshift` are the natural
//! interface, with positional access layered on top.

mod keys;

use std::fmt;
use std::ops::Deref;
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::constants::{ID_FIELD, SORT_FIELD};
use crate::doc::Doc;
use crate::events::{Listeners, Subscription};
use crate::protocol::create_id;
use crate::row::Row;
use crate::set::{Condition, RowRef, Set};
use crate::value::{FieldMap, Value};

/// Structured error types for sequence operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum SeqError {
    /// The resolved boundary keys leave no room: the lower boundary does
    /// not precede the upper one in the current order. Caller misuse, not a
    /// concurrency condition.
    #[error("impossible insert: boundary {lo:?} does not precede {hi:?}")]
    ImpossibleInsert { lo: String, hi: String },
}

impl SeqError {
    /// Check if this error is an insert into an inverted or empty interval.
    pub fn is_impossible_insert(&self) -> bool {
        matches!(self, SeqError::ImpossibleInsert { .. })
    }
}

impl From<SeqError> for crate::Error {
    fn from(err: SeqError) -> Self {
        crate::Error::Seq(err)
    }
}

/// Item handed to [`Seq::insert`]: an existing row (by handle or document
/// id) or a fresh field map to be added to the document.
pub enum SeqItem {
    /// An existing row handle.
    Row(Row),
    /// The id of a row in the owning document.
    Id(String),
    /// A fresh field map; the sequence fills in `_sort` and its defining
    /// field, and submits it with the map's `id` or a generated one.
    Fields(FieldMap),
}

impl From<Row> for SeqItem {
    fn from(row: Row) -> Self {
        SeqItem::Row(row)
    }
}

impl From<&Row> for SeqItem {
    fn from(row: &Row) -> Self {
        SeqItem::Row(row.clone())
    }
}

impl From<&str> for SeqItem {
    fn from(id: &str) -> Self {
        SeqItem::Id(id.to_string())
    }
}

impl From<String> for SeqItem {
    fn from(id: String) -> Self {
        SeqItem::Id(id)
    }
}

impl From<FieldMap> for SeqItem {
    fn from(fields: FieldMap) -> Self {
        SeqItem::Fields(fields)
    }
}

/// Handle to an ordered view. Cheap to clone; clones share state.
///
/// Derefs to [`Set`] for the shared view surface (`get_row`, `remove`,
/// `on_add`, `to_json`, ...); the member array is always kept sorted by
/// `(sort key, id)`.
#[derive(Clone)]
pub struct Seq {
    shared: Rc<SeqShared>,
}

pub(crate) struct SeqShared {
    set: Set,
    moved: Listeners<Row>,
}

impl Deref for Seq {
    type Target = Set;

    fn deref(&self) -> &Set {
        &self.shared.set
    }
}

impl Seq {
    /// Builds the ordered view over rows whose `field` equals `value` and
    /// wires up collision resolution.
    pub(crate) fn new(doc: &Doc, field: String, value: Value) -> Seq {
        let set = Set::exact(doc, field, value);
        let seq = Seq {
            shared: Rc::new(SeqShared {
                set,
                moved: Listeners::new(),
            }),
        };
        seq.sort_members();

        // admissions land at the end of the member array; restore order
        // right away, even when the admission did not touch `_sort`
        let weak = Rc::downgrade(&seq.shared);
        seq.shared.set.shared.events.add.on(move |_row| {
            if let Some(shared) = weak.upgrade() {
                Seq { shared }.sort_members();
            }
        });

        let weak = Rc::downgrade(&seq.shared);
        seq.shared.set.on_changes(move |row, applied| {
            if !applied.contains_key(SORT_FIELD) {
                return;
            }
            let Some(shared) = weak.upgrade() else {
                return;
            };
            Seq { shared }.resolve_collision(row);
        });
        seq
    }

    /// Borrow of the underlying set.
    pub fn as_set(&self) -> &Set {
        &self.shared.set
    }

    fn sort_members(&self) {
        self.shared.set.shared.order.borrow_mut().sort_by(|a, b| {
            (a.sort_key(), a.id()).cmp(&(b.sort_key(), b.id()))
        });
    }

    /// A member's `_sort` just changed: restore order, then either nudge a
    /// colliding member forward or announce the move.
    fn resolve_collision(&self, row: &Row) {
        self.sort_members();
        let Some(key) = row.sort_key() else {
            return;
        };
        let colliding = {
            let order = self.shared.set.shared.order.borrow();
            order
                .iter()
                .find(|other| {
                    other.id() != row.id() && other.sort_key().as_deref() == Some(key.as_str())
                })
                .cloned()
        };
        match colliding {
            Some(neighbor) => {
                debug!(row = %row.id(), key = %key, "sort key collision, nudging forward");
                // re-insert just after the member we collided with; the
                // nudge is an ordinary update, so every replica observing
                // the collision converges on the same resolution
                let after = self.next(Some(RowRef::Handle(row.clone())));
                if let Err(err) = self.insert(
                    SeqItem::Row(row.clone()),
                    Some(RowRef::Handle(neighbor)),
                    after.map(RowRef::Handle),
                ) {
                    warn!(row = %row.id(), %err, "collision nudge failed");
                }
            }
            None => self.shared.moved.emit(row),
        }
    }

    fn boundary_key(&self, r: Option<RowRef>, sentinel: &str) -> String {
        r.and_then(|r| self.shared.set.get_row(r))
            .and_then(|row| row.sort_key())
            .unwrap_or_else(|| sentinel.to_string())
    }

    /// Inserts `item` between two boundary members: `before` is the member
    /// the item should follow, `after` the member it should precede. An
    /// absent (or non-member) boundary means the corresponding list
    /// sentinel.
    ///
    /// Fails with [`SeqError::ImpossibleInsert`] when the resolved
    /// boundaries are inverted or empty.
    pub fn insert(
        &self,
        item: impl Into<SeqItem>,
        before: Option<RowRef>,
        after: Option<RowRef>,
    ) -> crate::Result<Row> {
        let lo = self.boundary_key(before, keys::LOW);
        let hi = self.boundary_key(after, keys::HIGH);
        if lo.as_str() >= hi.as_str() {
            return Err(SeqError::ImpossibleInsert { lo, hi }.into());
        }
        let sort_key = format!("{}{}", keys::between(&lo, &hi), keys::random_suffix(3));

        match item.into() {
            SeqItem::Row(row) => self.apply_key(row, sort_key),
            SeqItem::Id(id) => {
                let doc = self
                    .shared
                    .set
                    .doc()
                    .ok_or(crate::doc::DocError::DocumentDropped)?;
                let row = doc.get(id);
                self.apply_key(row, sort_key)
            }
            SeqItem::Fields(mut fields) => {
                fields.insert(SORT_FIELD.to_string(), Value::Text(sort_key));
                if let Condition::Exact { field, value } = &self.shared.set.shared.condition {
                    fields.insert(field.clone(), value.clone());
                }
                let id = match fields.get(ID_FIELD) {
                    Some(Value::Text(id)) if !id.is_empty() => id.clone(),
                    _ => create_id(),
                };
                let doc = self
                    .shared
                    .set
                    .doc()
                    .ok_or(crate::doc::DocError::DocumentDropped)?;
                doc.set(id, Some(fields))
            }
        }
    }

    /// Applies a freshly computed sort key (and, when missing, the defining
    /// field) to an existing row through the normal mutation path.
    fn apply_key(&self, row: Row, sort_key: String) -> crate::Result<Row> {
        let mut changes = FieldMap::new();
        changes.insert(SORT_FIELD.to_string(), Value::Text(sort_key));
        if let Condition::Exact { field, value } = &self.shared.set.shared.condition {
            if row.get(field).as_ref() != Some(value) {
                changes.insert(field.clone(), value.clone());
            }
        }
        row.set_map(changes)?;
        Ok(row)
    }

    /// The closest member strictly before `r` in the current order, or the
    /// last member when `r` is absent or not a member.
    pub fn prev(&self, r: Option<RowRef>) -> Option<Row> {
        let bound = self.boundary_key(r, keys::HIGH);
        let order = self.shared.set.shared.order.borrow();
        let mut best: Option<(String, Row)> = None;
        for member in order.iter() {
            let Some(key) = member.sort_key() else {
                continue;
            };
            let closer = best
                .as_ref()
                .is_none_or(|(best_key, _)| key.as_str() > best_key.as_str());
            if key.as_str() < bound.as_str() && closer {
                best = Some((key, member.clone()));
            }
        }
        best.map(|(_, row)| row)
    }

    /// The closest member strictly after `r` in the current order, or the
    /// first member when `r` is absent or not a member.
    pub fn next(&self, r: Option<RowRef>) -> Option<Row> {
        let bound = self.boundary_key(r, keys::LOW);
        let order = self.shared.set.shared.order.borrow();
        let mut best: Option<(String, Row)> = None;
        for member in order.iter() {
            let Some(key) = member.sort_key() else {
                continue;
            };
            let closer = best
                .as_ref()
                .is_none_or(|(best_key, _)| key.as_str() < best_key.as_str());
            if key.as_str() > bound.as_str() && closer {
                best = Some((key, member.clone()));
            }
        }
        best.map(|(_, row)| row)
    }

    /// Inserts `item` immediately before the member `r`.
    pub fn before(&self, item: impl Into<SeqItem>, r: impl Into<RowRef>) -> crate::Result<Row> {
        let r = r.into();
        let lo = self.prev(Some(r.clone())).map(RowRef::Handle);
        self.insert(item, lo, Some(r))
    }

    /// Inserts `item` immediately after the member `r`.
    pub fn after(&self, item: impl Into<SeqItem>, r: impl Into<RowRef>) -> crate::Result<Row> {
        let r = r.into();
        let hi = self.next(Some(r.clone())).map(RowRef::Handle);
        self.insert(item, Some(r), hi)
    }

    /// Appends `item` after the current last member.
    pub fn push(&self, item: impl Into<SeqItem>) -> crate::Result<Row> {
        let last = self.last().map(RowRef::Handle);
        self.insert(item, last, None)
    }

    /// Prepends `item` before the current first member.
    pub fn unshift(&self, item: impl Into<SeqItem>) -> crate::Result<Row> {
        let first = self.first().map(RowRef::Handle);
        self.insert(item, None, first)
    }

    /// The first member in order.
    pub fn first(&self) -> Option<Row> {
        self.shared.set.shared.order.borrow().first().cloned()
    }

    /// The last member in order.
    pub fn last(&self) -> Option<Row> {
        self.shared.set.shared.order.borrow().last().cloned()
    }

    /// The member at position `index`.
    pub fn at(&self, index: usize) -> Option<Row> {
        self.shared.set.shared.order.borrow().get(index).cloned()
    }

    /// The position of `r` in the current order.
    pub fn index_of(&self, r: impl Into<RowRef>) -> Option<usize> {
        let row = self.get_row(r)?;
        self.shared
            .set
            .shared
            .order
            .borrow()
            .iter()
            .position(|member| member.id() == row.id())
    }

    /// Removes the last member by retracting the defining field.
    pub fn pop(&self) -> crate::Result<Option<Row>> {
        match self.last() {
            Some(row) => self.remove(RowRef::Handle(row)),
            None => Ok(None),
        }
    }

    /// Removes the first member by retracting the defining field.
    pub fn shift(&self) -> crate::Result<Option<Row>> {
        match self.first() {
            Some(row) => self.remove(RowRef::Handle(row)),
            None => Ok(None),
        }
    }

    /// Notifies when a member's sort key changed without colliding.
    pub fn on_moved(&self, f: impl Fn(&Row) + 'static) -> Subscription {
        self.shared.moved.on(f)
    }

    /// Detaches an [`on_moved`](Seq::on_moved) listener.
    pub fn off_moved(&self, sub: Subscription) -> bool {
        self.shared.moved.off(sub)
    }
}

impl fmt::Debug for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seq")
            .field("members", &self.len())
            .finish()
    }
}
