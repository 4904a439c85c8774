//! A cached, reactive filtered view over document rows.
//!
//! A [`Set`] admits exactly the rows whose state satisfies its defining
//! condition — an exact field/value match, or an arbitrary predicate — and
//! keeps that membership current incrementally: one scan of the row table at
//! construction, then per-field broadcasts and per-row listeners, never a
//! re-scan. Sets never mutate document state directly; removing a member is
//! expressed as a field retraction replayed through the document's normal
//! mutation path.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use thiserror::Error;

use crate::constants::{ID_FIELD, SORT_FIELD};
use crate::doc::{Doc, DocShared};
use crate::events::{Listeners, Subscription};
use crate::protocol::RowId;
use crate::row::Row;
use crate::value::{FieldMap, Value};

/// Structured error types for set operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum SetError {
    /// Predicate sets have no single field to retract.
    #[error("cannot remove rows from a predicate-based set")]
    UnsupportedRemoval,
}

impl SetError {
    /// Check if this error is a removal attempt on a predicate set.
    pub fn is_unsupported_removal(&self) -> bool {
        matches!(self, SetError::UnsupportedRemoval)
    }
}

impl From<SetError> for crate::Error {
    fn from(err: SetError) -> Self {
        crate::Error::Set(err)
    }
}

/// Reference to a row at the view API boundary: by id, by position in the
/// member array, or by handle.
#[derive(Clone)]
pub enum RowRef {
    /// A row id.
    Id(RowId),
    /// A position in the member array.
    Index(usize),
    /// A row handle.
    Handle(Row),
}

impl From<&str> for RowRef {
    fn from(id: &str) -> Self {
        RowRef::Id(id.to_string())
    }
}

impl From<String> for RowRef {
    fn from(id: String) -> Self {
        RowRef::Id(id)
    }
}

impl From<usize> for RowRef {
    fn from(index: usize) -> Self {
        RowRef::Index(index)
    }
}

impl From<Row> for RowRef {
    fn from(row: Row) -> Self {
        RowRef::Handle(row)
    }
}

impl From<&Row> for RowRef {
    fn from(row: &Row) -> Self {
        RowRef::Handle(row.clone())
    }
}

impl fmt::Debug for RowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowRef::Id(id) => write!(f, "RowRef::Id({id:?})"),
            RowRef::Index(i) => write!(f, "RowRef::Index({i})"),
            RowRef::Handle(row) => write!(f, "RowRef::Handle({:?})", row.id()),
        }
    }
}

/// The defining condition of a set. Fixed at construction.
pub(crate) enum Condition {
    Exact { field: String, value: Value },
    Predicate(Rc<dyn Fn(&FieldMap) -> bool>),
}

impl Condition {
    pub(crate) fn satisfies(&self, state: &FieldMap) -> bool {
        match self {
            Condition::Exact { field, value } => state.get(field) == Some(value),
            Condition::Predicate(predicate) => predicate(state),
        }
    }
}

/// Handle to a filtered view. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Set {
    pub(crate) shared: Rc<SetShared>,
}

pub(crate) struct SetShared {
    pub(crate) doc: Weak<DocShared>,
    pub(crate) condition: Condition,
    members: RefCell<HashMap<RowId, Row>>,
    pub(crate) order: RefCell<Vec<Row>>,
    member_subs: RefCell<HashMap<RowId, Subscription>>,
    pub(crate) events: SetEvents,
}

#[derive(Default)]
pub(crate) struct SetEvents {
    pub(crate) add: Listeners<Row>,
    pub(crate) remove: Listeners<Row>,
    /// (member, applied changes)
    pub(crate) changes: Listeners<(Row, FieldMap)>,
}

impl Drop for SetShared {
    fn drop(&mut self) {
        // detach per-row listeners so a dropped uncached set leaves no
        // dead slots behind on surviving rows
        let members = self.members.borrow();
        for (id, sub) in self.member_subs.borrow().iter() {
            if let Some(row) = members.get(id) {
                row.off_changes(*sub);
            }
        }
    }
}

impl Set {
    fn with_condition(doc: &Doc, condition: Condition) -> Set {
        Set {
            shared: Rc::new(SetShared {
                doc: Rc::downgrade(&doc.shared),
                condition,
                members: RefCell::new(HashMap::new()),
                order: RefCell::new(Vec::new()),
                member_subs: RefCell::new(HashMap::new()),
                events: SetEvents::default(),
            }),
        }
    }

    /// Builds an exact-match set: scans current rows once, then follows the
    /// per-field broadcast for the defining field.
    pub(crate) fn exact(doc: &Doc, field: String, value: Value) -> Set {
        let set = Set::with_condition(
            doc,
            Condition::Exact {
                field: field.clone(),
                value: value.clone(),
            },
        );
        set.scan(doc);

        let weak = Rc::downgrade(&set.shared);
        let expected = value;
        let field_name = field.clone();
        doc.shared.fields.on(&field, move |change: &(Row, FieldMap)| {
            let (row, applied) = change;
            if applied.get(&field_name) != Some(&expected) {
                return;
            }
            if let Some(shared) = weak.upgrade() {
                Set { shared }.add(row);
            }
        });
        set
    }

    /// Builds a predicate set: scans current rows once, then re-tests newly
    /// created rows. Member rows are re-tested on every change through the
    /// per-row listener; a non-member that only later starts satisfying the
    /// predicate is not admitted.
    pub(crate) fn predicate(doc: &Doc, predicate: impl Fn(&FieldMap) -> bool + 'static) -> Set {
        let set = Set::with_condition(doc, Condition::Predicate(Rc::new(predicate)));
        set.scan(doc);

        let weak = Rc::downgrade(&set.shared);
        doc.on_create(move |row| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let set = Set { shared };
            let admit = set.shared.condition.satisfies(&row.shared.state.borrow());
            if admit {
                set.add(row);
            }
        });
        set
    }

    fn scan(&self, doc: &Doc) {
        let rows: Vec<Row> = doc.shared.rows.borrow().values().cloned().collect();
        for row in rows {
            let admit = self.shared.condition.satisfies(&row.shared.state.borrow());
            if admit {
                self.add(&row);
            }
        }
    }

    /// Admits `row`. Idempotent: a current member is left alone. Emits
    /// `add`, then tracks the member — every subsequent change re-evaluates
    /// membership, emitting `changes` while the condition still holds and
    /// `changes` + `remove` (with the tracker detached) once it stops.
    pub fn add(&self, row: &Row) {
        if self.shared.members.borrow().contains_key(row.id()) {
            return;
        }
        self.shared
            .members
            .borrow_mut()
            .insert(row.id().to_string(), row.clone());
        self.shared.order.borrow_mut().push(row.clone());
        self.shared.events.add.emit(row);

        let weak = Rc::downgrade(&self.shared);
        let weak_row = Rc::downgrade(&row.shared);
        let sub = row.on_changes(move |_requested, applied| {
            let (Some(shared), Some(row_shared)) = (weak.upgrade(), weak_row.upgrade()) else {
                return;
            };
            Set { shared }.reevaluate(&Row { shared: row_shared }, applied);
        });
        self.shared
            .member_subs
            .borrow_mut()
            .insert(row.id().to_string(), sub);
    }

    fn reevaluate(&self, row: &Row, applied: &FieldMap) {
        let still_member = self.shared.condition.satisfies(&row.shared.state.borrow());
        if still_member {
            self.shared
                .events
                .changes
                .emit(&(row.clone(), applied.clone()));
            return;
        }
        self.shared.members.borrow_mut().remove(row.id());
        self.shared.order.borrow_mut().retain(|r| r.id() != row.id());
        let sub = self.shared.member_subs.borrow_mut().remove(row.id());
        self.shared
            .events
            .changes
            .emit(&(row.clone(), applied.clone()));
        self.shared.events.remove.emit(row);
        if let Some(sub) = sub {
            row.off_changes(sub);
        }
    }

    /// Drops `row` from the member structures without issuing updates.
    /// Used by the document when a winning tombstone removes the row.
    pub(crate) fn evict(&self, row: &Row) {
        if self.shared.members.borrow_mut().remove(row.id()).is_none() {
            return;
        }
        self.shared.order.borrow_mut().retain(|r| r.id() != row.id());
        if let Some(sub) = self.shared.member_subs.borrow_mut().remove(row.id()) {
            row.off_changes(sub);
        }
        self.shared.events.remove.emit(row);
    }

    /// Resolves `r` to a live member, if any.
    pub fn get_row(&self, r: impl Into<RowRef>) -> Option<Row> {
        match r.into() {
            RowRef::Id(id) => self.shared.members.borrow().get(&id).cloned(),
            RowRef::Index(index) => self.shared.order.borrow().get(index).cloned(),
            RowRef::Handle(row) => self.shared.members.borrow().get(row.id()).cloned(),
        }
    }

    /// Whether `r` resolves to a live member.
    pub fn has(&self, r: impl Into<RowRef>) -> bool {
        self.get_row(r).is_some()
    }

    /// Removes a member by retracting the defining field — the actual
    /// removal happens through the document's normal mutation path, so it
    /// replicates like any other update. Returns the member the retraction
    /// was issued for, or `None` when `r` is not a member.
    ///
    /// Fails with [`SetError::UnsupportedRemoval`] on a predicate set,
    /// which has no single field to retract.
    pub fn remove(&self, r: impl Into<RowRef>) -> crate::Result<Option<Row>> {
        let Some(row) = self.get_row(r) else {
            return Ok(None);
        };
        match &self.shared.condition {
            Condition::Exact { field, .. } => {
                row.set(field.clone(), Value::Null)?;
                Ok(Some(row))
            }
            Condition::Predicate(_) => Err(SetError::UnsupportedRemoval.into()),
        }
    }

    /// Number of current members.
    pub fn len(&self) -> usize {
        self.shared.order.borrow().len()
    }

    /// Whether the set has no members.
    pub fn is_empty(&self) -> bool {
        self.shared.order.borrow().is_empty()
    }

    /// Snapshot of the member array.
    pub fn rows(&self) -> Vec<Row> {
        self.shared.order.borrow().clone()
    }

    /// Iterates the current members.
    pub fn for_each(&self, mut f: impl FnMut(&Row)) {
        for row in self.rows() {
            f(&row);
        }
    }

    /// Runs `f` for every current member and every future admission.
    pub fn on_each(&self, f: impl Fn(&Row) + 'static) -> Subscription {
        for row in self.rows() {
            f(&row);
        }
        self.shared.events.add.on(f)
    }

    /// The defining field of an exact-match set.
    pub fn field(&self) -> Option<&str> {
        match &self.shared.condition {
            Condition::Exact { field, .. } => Some(field),
            Condition::Predicate(_) => None,
        }
    }

    /// The defining value of an exact-match set.
    pub fn value(&self) -> Option<&Value> {
        match &self.shared.condition {
            Condition::Exact { value, .. } => Some(value),
            Condition::Predicate(_) => None,
        }
    }

    /// Whether this set is predicate-based.
    pub fn is_predicate(&self) -> bool {
        matches!(self.shared.condition, Condition::Predicate(_))
    }

    /// Snapshot of member states, ordered by `_sort` when present and id
    /// otherwise, so output is reproducible even for unordered sets.
    pub fn to_json(&self) -> Vec<FieldMap> {
        let mut states: Vec<FieldMap> = self.rows().iter().map(Row::to_json).collect();
        states.sort_by(|a, b| Self::json_key(a).cmp(&Self::json_key(b)));
        states
    }

    fn json_key(state: &FieldMap) -> &str {
        let sort = state.get(SORT_FIELD).and_then(Value::as_text);
        sort.or_else(|| state.get(ID_FIELD).and_then(Value::as_text))
            .unwrap_or("")
    }

    pub(crate) fn doc(&self) -> Option<Doc> {
        self.shared.doc.upgrade().map(Doc::from_shared)
    }

    /// Notifies with every admitted member.
    pub fn on_add(&self, f: impl Fn(&Row) + 'static) -> Subscription {
        self.shared.events.add.on(f)
    }

    /// Detaches an [`on_add`](Set::on_add) listener.
    pub fn off_add(&self, sub: Subscription) -> bool {
        self.shared.events.add.off(sub)
    }

    /// Notifies with every member leaving the set.
    pub fn on_remove(&self, f: impl Fn(&Row) + 'static) -> Subscription {
        self.shared.events.remove.on(f)
    }

    /// Detaches an [`on_remove`](Set::on_remove) listener.
    pub fn off_remove(&self, sub: Subscription) -> bool {
        self.shared.events.remove.off(sub)
    }

    /// Notifies with a member and its applied changes after every change to
    /// a member (including the change that removes it).
    pub fn on_changes(&self, f: impl Fn(&Row, &FieldMap) + 'static) -> Subscription {
        self.shared
            .events
            .changes
            .on(move |(row, applied)| f(row, applied))
    }

    /// Detaches an [`on_changes`](Set::on_changes) listener.
    pub fn off_changes(&self, sub: Subscription) -> bool {
        self.shared.events.changes.off(sub)
    }
}

impl fmt::Debug for Set {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.shared.condition {
            Condition::Exact { field, value } => format!("{field}={value}"),
            Condition::Predicate(_) => "<predicate>".to_string(),
        };
        f.debug_struct("Set")
            .field("condition", &kind)
            .field("members", &self.len())
            .finish()
    }
}
