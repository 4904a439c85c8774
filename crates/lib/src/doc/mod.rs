//! The replicated document: sole authority for applying updates.
//!
//! All mutation, local or remote, funnels through [`Doc::apply_update`]. The
//! document owns the row table, the per-row per-field history, and the
//! registry of cached views; [`Set`]s and [`Seq`]s are passive subscribers
//! fed by the notification fan-out at the end of each apply, and never touch
//! document state directly (removal is itself expressed as an update,
//! replayed through the same entry point).
//!
//! # Merge rules
//!
//! Every field of every row is a last-writer-wins register: an incoming
//! update wins a field exactly when it beats the field's current history
//! entry under the total order of [`protocol::order`]. Applying the same
//! finite set of updates in any delivery order therefore yields identical
//! state — no locking, no coordinator, only local per-field comparisons.
//! A tombstone update retracts every currently present field of its row and
//! drops the row from the table; superseded history entries are retained
//! (never deleted) so updates arriving out of causal order stay comparable.
//!
//! # Example
//!
//! ```
//! use concord::Doc;
//! use serde_json::json;
//!
//! let a = Doc::new();
//! let b = Doc::new();
//!
//! a.add(concord::fields_from_json(json!({"id": "abc", "hello": 3})).unwrap())
//!     .unwrap();
//!
//! // replay everything `a` knows into `b`
//! for update in a.history(&concord::SourceFilter::all()) {
//!     b.apply_update(update);
//! }
//! assert_eq!(a.to_json(), b.to_json());
//! ```

pub mod errors;

pub use errors::DocError;

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::constants::ID_FIELD;
use crate::events::{FieldHub, Listeners, Subscription};
use crate::protocol::{self, RowId, SourceFilter, SourceId, Timestamp, Update, create_id};
use crate::row::Row;
use crate::seq::Seq;
use crate::set::Set;
use crate::value::{FieldMap, Value};

/// Key under which exact-match views are cached: the defining field/value
/// pair.
pub(crate) type ViewKey = (String, Value);

/// Handle to a replicated document. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Doc {
    pub(crate) shared: Rc<DocShared>,
}

pub(crate) struct DocShared {
    source: SourceId,
    clock: Rc<dyn Clock>,
    last_timestamp: Cell<Timestamp>,
    pub(crate) rows: RefCell<BTreeMap<RowId, Row>>,
    hist: RefCell<BTreeMap<RowId, BTreeMap<String, Rc<Update>>>>,
    sets: RefCell<BTreeMap<ViewKey, Set>>,
    seqs: RefCell<BTreeMap<ViewKey, Seq>>,
    /// Per-field broadcast: how exact-match views learn of relevant changes
    /// without the document knowing about them.
    pub(crate) fields: FieldHub<(Row, FieldMap)>,
    events: DocEvents,
}

#[derive(Default)]
struct DocEvents {
    add: Listeners<Row>,
    create: Listeners<Row>,
    update: Listeners<Row>,
    remove: Listeners<Row>,
    invalid: Listeners<DocError>,
    retired: Listeners<Update>,
    raw_update: Listeners<Update>,
}

impl Doc {
    /// Creates a document with a random source identity and the system
    /// clock.
    pub fn new() -> Self {
        Self::build(create_id(), Rc::new(SystemClock))
    }

    /// Creates a document with an explicit source identity.
    pub fn with_source(source: impl Into<SourceId>) -> Self {
        Self::build(source.into(), Rc::new(SystemClock))
    }

    /// Creates a document with an explicit source identity and clock.
    #[cfg(any(test, feature = "testing"))]
    pub fn with_clock(source: impl Into<SourceId>, clock: impl Clock + 'static) -> Self {
        Self::build(source.into(), Rc::new(clock))
    }

    fn build(source: SourceId, clock: Rc<dyn Clock>) -> Self {
        Doc {
            shared: Rc::new(DocShared {
                source,
                clock,
                last_timestamp: Cell::new(0),
                rows: RefCell::new(BTreeMap::new()),
                hist: RefCell::new(BTreeMap::new()),
                sets: RefCell::new(BTreeMap::new()),
                seqs: RefCell::new(BTreeMap::new()),
                fields: FieldHub::new(),
                events: DocEvents::default(),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Rc<DocShared>) -> Self {
        Doc { shared }
    }

    /// This replica's source identity.
    pub fn source(&self) -> &str {
        &self.shared.source
    }

    // === Row access ===

    /// Looks up a row without materializing it.
    pub fn row(&self, id: impl AsRef<str>) -> Option<Row> {
        self.shared.rows.borrow().get(id.as_ref()).cloned()
    }

    /// Returns the row for `id`, materializing an empty one when absent.
    pub fn get(&self, id: impl AsRef<str>) -> Row {
        self.materialize(id.as_ref())
    }

    /// Snapshot of all live row handles.
    pub fn rows(&self) -> Vec<Row> {
        self.shared.rows.borrow().values().cloned().collect()
    }

    /// Adds a row. The id comes from the `id` field when present (it must
    /// be a non-empty string), otherwise a fresh one is generated. The
    /// initial fields travel through the normal mutation path.
    pub fn add(&self, fields: FieldMap) -> crate::Result<Row> {
        let id = match fields.get(ID_FIELD) {
            Some(Value::Text(id)) if !id.is_empty() => id.clone(),
            Some(other) => {
                return Err(DocError::InvalidRowId {
                    reason: format!("expected a non-empty string, got {}", other.type_name()),
                }
                .into());
            }
            None => create_id(),
        };
        let row = self.materialize(&id);
        self.local_update(id, Some(fields));
        Ok(row)
    }

    /// Applies `changes` to the row `id`, materializing it when absent;
    /// `None` retracts the row.
    pub fn set(&self, id: impl Into<RowId>, changes: Option<FieldMap>) -> crate::Result<Row> {
        let id = id.into();
        let row = self.materialize(&id);
        match changes {
            Some(changes) => row.set_map(changes)?,
            None => row.clear()?,
        }
        Ok(row)
    }

    /// Retracts the row `id` (sugar for `set(id, None)`).
    pub fn rm(&self, id: impl Into<RowId>) -> crate::Result<()> {
        self.set(id, None).map(|_| ())
    }

    /// Snapshot of all live rows as id → field map.
    pub fn to_json(&self) -> BTreeMap<RowId, FieldMap> {
        self.shared
            .rows
            .borrow()
            .iter()
            .map(|(id, row)| (id.clone(), row.to_json()))
            .collect()
    }

    /// JSON string form of [`Doc::to_json`].
    pub fn to_json_string(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(&self.to_json())?)
    }

    // === Views ===

    /// Returns the cached [`Set`] admitting rows whose `field` equals
    /// `value`, creating it on first use.
    pub fn create_set(&self, field: impl Into<String>, value: impl Into<Value>) -> Set {
        let key: ViewKey = (field.into(), value.into());
        if let Some(set) = self.shared.sets.borrow().get(&key) {
            return set.clone();
        }
        let set = Set::exact(self, key.0.clone(), key.1.clone());
        self.shared.sets.borrow_mut().insert(key, set.clone());
        set
    }

    /// Creates an uncached [`Set`] admitting rows that satisfy `predicate`.
    /// Every call creates a new instance.
    pub fn create_set_where(&self, predicate: impl Fn(&FieldMap) -> bool + 'static) -> Set {
        Set::predicate(self, predicate)
    }

    /// Returns the cached [`Seq`] over rows whose `field` equals `value`,
    /// ordered by their `_sort` key, creating it on first use.
    pub fn create_seq(&self, field: impl Into<String>, value: impl Into<Value>) -> Seq {
        let key: ViewKey = (field.into(), value.into());
        if let Some(seq) = self.shared.seqs.borrow().get(&key) {
            return seq.clone();
        }
        let seq = Seq::new(self, key.0.clone(), key.1.clone());
        self.shared.seqs.borrow_mut().insert(key, seq.clone());
        seq
    }

    // === Mutation path ===

    fn next_timestamp(&self) -> Timestamp {
        let now = self.shared.clock.now_millis() as Timestamp;
        let ts = now.max(self.shared.last_timestamp.get() + 1);
        self.shared.last_timestamp.set(ts);
        ts
    }

    /// Stamps a local mutation request and feeds it through
    /// [`Doc::apply_update`]. There is no separate local merge rule.
    pub(crate) fn local_update(&self, row_id: RowId, changes: Option<FieldMap>) -> bool {
        let update = Update::new(
            row_id,
            changes,
            self.next_timestamp(),
            self.shared.source.clone(),
        );
        self.apply_update(update)
    }

    /// Applies one update — the single entry point for all mutation.
    ///
    /// Returns true iff state observably changed. Re-applying a stale or
    /// duplicate update is a silent no-op returning false, which is what
    /// makes delivery idempotent.
    pub fn apply_update(&self, update: Update) -> bool {
        if update.row_id().is_empty() {
            warn!(source = %update.source(), "dropping update without row id");
            self.shared.events.invalid.emit(&DocError::InvalidUpdate {
                reason: "empty row id".to_string(),
            });
            return false;
        }

        let existed = self.shared.rows.borrow().contains_key(update.row_id());
        let row = self.materialize(update.row_id());
        let update = Rc::new(update);

        if update.is_tombstone() {
            self.apply_tombstone(row, update, existed)
        } else {
            self.apply_changes(row, update, existed)
        }
    }

    /// Normal path: per-field last-writer-wins merge.
    fn apply_changes(&self, row: Row, update: Rc<Update>, existed: bool) -> bool {
        let requested = update
            .changes()
            .cloned()
            .unwrap_or_default();

        let mut applied = FieldMap::new();
        let mut superseded: Vec<Rc<Update>> = Vec::new();
        {
            let mut hist_table = self.shared.hist.borrow_mut();
            let hist = hist_table.entry(row.id().to_string()).or_default();
            for (field, value) in &requested {
                let wins = match hist.get(field) {
                    None => true,
                    Some(entry) => protocol::order(entry, &update).is_lt(),
                };
                if !wins {
                    trace!(row = %row.id(), field = %field, "losing field skipped");
                    continue;
                }
                if let Some(entry) = hist.get(field)
                    && !superseded.iter().any(|old| Rc::ptr_eq(old, entry))
                {
                    superseded.push(Rc::clone(entry));
                }
                hist.insert(field.clone(), Rc::clone(&update));
                applied.insert(field.clone(), value.clone());
            }
            // an entry is retired once nothing in the row's history
            // references it anymore
            superseded.retain(|old| !hist.values().any(|entry| Rc::ptr_eq(entry, old)));
        }

        if applied.is_empty() {
            // pure no-op; a row materialized only for this update goes away
            if !existed {
                self.shared.rows.borrow_mut().remove(row.id());
            }
            return false;
        }

        for old in &superseded {
            self.shared.events.retired.emit(old);
        }

        {
            let mut state = row.shared.state.borrow_mut();
            for (field, value) in &applied {
                state.insert(field.clone(), value.clone());
            }
        }
        debug!(row = %row.id(), fields = applied.len(), "applied update");

        for field in applied.keys() {
            self.shared
                .fields
                .emit(field, &(row.clone(), applied.clone()));
        }
        if row.shared.fresh.get() {
            self.shared.events.add.emit(&row);
            self.shared.events.create.emit(&row);
            row.shared.fresh.set(false);
        }
        row.shared
            .events
            .update
            .emit(&((*update).clone(), applied.clone()));
        row.shared
            .events
            .changes
            .emit(&(Some(requested), applied.clone()));
        row.shared.events.change.emit(&applied);
        self.shared.events.raw_update.emit(&update);
        self.shared.events.update.emit(&row);
        true
    }

    /// Tombstone path: retract every field the tombstone wins, then drop
    /// the row.
    fn apply_tombstone(&self, row: Row, update: Rc<Update>, existed: bool) -> bool {
        let present: Vec<String> = row.shared.state.borrow().keys().cloned().collect();

        let mut retracted: Vec<String> = Vec::new();
        let mut retired: Vec<Rc<Update>> = Vec::new();
        {
            let mut hist_table = self.shared.hist.borrow_mut();
            let hist = hist_table.entry(row.id().to_string()).or_default();
            for field in present {
                let wins = match hist.get(&field) {
                    None => true,
                    Some(entry) => protocol::order(entry, &update).is_lt(),
                };
                if !wins {
                    continue;
                }
                if let Some(entry) = hist.get(&field) {
                    retired.push(Rc::clone(entry));
                }
                // the tombstone update itself becomes the field's entry, so
                // history() re-gossips the retraction in valid wire shape
                hist.insert(field.clone(), Rc::clone(&update));
                retracted.push(field);
            }
        }

        if retracted.is_empty() {
            // stale tombstone: pure no-op
            if !existed {
                self.shared.rows.borrow_mut().remove(row.id());
            }
            return false;
        }

        for old in &retired {
            self.shared.events.retired.emit(old);
        }

        // retracted fields leave the live state: a field is absent exactly
        // when its history entry is a tombstone
        {
            let mut state = row.shared.state.borrow_mut();
            for field in &retracted {
                state.remove(field);
            }
        }
        debug!(row = %row.id(), fields = retracted.len(), "tombstone won, removing row");

        // evict from every cached view that currently contains the row
        let sets: Vec<Set> = self.shared.sets.borrow().values().cloned().collect();
        for set in sets {
            set.evict(&row);
        }
        let seqs: Vec<Seq> = self.shared.seqs.borrow().values().cloned().collect();
        for seq in seqs {
            seq.as_set().evict(&row);
        }

        self.shared.rows.borrow_mut().remove(row.id());
        row.shared.live.set(false);
        row.shared.events.removed.emit(&());
        self.shared.events.remove.emit(&row);

        if row.shared.fresh.get() {
            self.shared.events.add.emit(&row);
            self.shared.events.create.emit(&row);
            row.shared.fresh.set(false);
        }
        let applied = FieldMap::new();
        row.shared
            .events
            .update
            .emit(&((*update).clone(), applied.clone()));
        row.shared.events.changes.emit(&(None, applied.clone()));
        row.shared.events.change.emit(&applied);
        self.shared.events.raw_update.emit(&update);
        self.shared.events.update.emit(&row);
        true
    }

    pub(crate) fn materialize(&self, id: &str) -> Row {
        if let Some(row) = self.shared.rows.borrow().get(id) {
            return row.clone();
        }
        let row = Row::new(id, Rc::downgrade(&self.shared));
        self.shared
            .rows
            .borrow_mut()
            .insert(id.to_string(), row.clone());
        row
    }

    // === Anti-entropy ===

    /// Deduplicated, canonically sorted list of all currently winning
    /// history entries, restricted to `sources`. This is what a replication
    /// collaborator exchanges during anti-entropy reconciliation.
    pub fn history(&self, sources: &SourceFilter) -> Vec<Update> {
        let mut seen: BTreeSet<(Timestamp, SourceId)> = BTreeSet::new();
        let mut out = Vec::new();
        for fields in self.shared.hist.borrow().values() {
            for entry in fields.values() {
                let identity = (entry.timestamp(), entry.source().to_string());
                if seen.insert(identity) && protocol::filter(entry, sources) {
                    out.push((**entry).clone());
                }
            }
        }
        protocol::sort(out)
    }

    // === Notifications ===

    /// Notifies when a row receives its first applied update.
    pub fn on_add(&self, f: impl Fn(&Row) + 'static) -> Subscription {
        self.shared.events.add.on(f)
    }

    /// Detaches an [`on_add`](Doc::on_add) listener.
    pub fn off_add(&self, sub: Subscription) -> bool {
        self.shared.events.add.off(sub)
    }

    /// Alias notification for [`on_add`](Doc::on_add).
    pub fn on_create(&self, f: impl Fn(&Row) + 'static) -> Subscription {
        self.shared.events.create.on(f)
    }

    /// Detaches an [`on_create`](Doc::on_create) listener.
    pub fn off_create(&self, sub: Subscription) -> bool {
        self.shared.events.create.off(sub)
    }

    /// Notifies with the affected row after every observable change.
    pub fn on_update(&self, f: impl Fn(&Row) + 'static) -> Subscription {
        self.shared.events.update.on(f)
    }

    /// Detaches an [`on_update`](Doc::on_update) listener.
    pub fn off_update(&self, sub: Subscription) -> bool {
        self.shared.events.update.off(sub)
    }

    /// Notifies when a winning tombstone removes a row.
    pub fn on_remove(&self, f: impl Fn(&Row) + 'static) -> Subscription {
        self.shared.events.remove.on(f)
    }

    /// Detaches an [`on_remove`](Doc::on_remove) listener.
    pub fn off_remove(&self, sub: Subscription) -> bool {
        self.shared.events.remove.off(sub)
    }

    /// Notifies when a malformed update is dropped.
    pub fn on_invalid(&self, f: impl Fn(&DocError) + 'static) -> Subscription {
        self.shared.events.invalid.on(f)
    }

    /// Detaches an [`on_invalid`](Doc::on_invalid) listener.
    pub fn off_invalid(&self, sub: Subscription) -> bool {
        self.shared.events.invalid.off(sub)
    }

    /// Notifies with a superseded history entry that is no longer reachable
    /// — a signal that the replication layer may prune it.
    pub fn on_retired(&self, f: impl Fn(&Update) + 'static) -> Subscription {
        self.shared.events.retired.on(f)
    }

    /// Detaches an [`on_retired`](Doc::on_retired) listener.
    pub fn off_retired(&self, sub: Subscription) -> bool {
        self.shared.events.retired.off(sub)
    }

    /// Notifies with every update that observably changed state, in wire
    /// form.
    pub fn on_raw_update(&self, f: impl Fn(&Update) + 'static) -> Subscription {
        self.shared.events.raw_update.on(f)
    }

    /// Detaches an [`on_raw_update`](Doc::on_raw_update) listener.
    pub fn off_raw_update(&self, sub: Subscription) -> bool {
        self.shared.events.raw_update.off(sub)
    }
}

impl Default for Doc {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Doc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Doc")
            .field("source", &self.shared.source)
            .field("rows", &self.shared.rows.borrow().len())
            .finish()
    }
}
