//! Merge engine tests: convergence, idempotence, tombstones, history.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;

use concord::{SourceFilter, Update, Value};
use serde_json::json;

use crate::helpers::{doc, fields, replicate, replicate_reversed};

#[test]
fn add_replicates_to_a_peer() {
    let a = doc("alice", 1000);
    a.add(fields(json!({"id": "abc", "hello": 3}))).unwrap();

    let b = doc("bob", 5000);
    replicate(&a, &b);

    let expected = BTreeMap::from([(
        "abc".to_string(),
        fields(json!({"id": "abc", "hello": 3})),
    )]);
    assert_eq!(b.to_json(), expected);
    assert_eq!(a.to_json(), b.to_json());
}

#[test]
fn converges_regardless_of_delivery_order() {
    let a = doc("alice", 1000);
    a.add(fields(json!({"id": "r1", "x": 1, "tag": "keep"}))).unwrap();
    a.get("r1").set("x", 2).unwrap();
    a.add(fields(json!({"id": "r2", "x": 9}))).unwrap();
    a.rm("r2").unwrap();

    let forward = doc("bob", 5000);
    replicate(&a, &forward);

    let backward = doc("carol", 9000);
    replicate_reversed(&a, &backward);

    assert_eq!(forward.to_json(), a.to_json());
    assert_eq!(backward.to_json(), a.to_json());
    assert!(a.row("r2").is_none());
    assert_eq!(a.get("r1").get("x"), Some(Value::Int(2)));
}

#[test]
fn concurrent_edits_converge_after_exchange() {
    let a = doc("alice", 1000);
    let b = doc("bob", 5000);

    a.add(fields(json!({"id": "r", "x": 1}))).unwrap();
    replicate(&a, &b);

    // concurrent writes to the same field; bob's clock is ahead, so bob wins
    a.get("r").set("x", 10).unwrap();
    b.get("r").set("x", 20).unwrap();
    // and to different fields, which merge independently
    a.get("r").set("from_a", true).unwrap();
    b.get("r").set("from_b", true).unwrap();

    replicate(&a, &b);
    replicate(&b, &a);

    assert_eq!(a.to_json(), b.to_json());
    let row = a.get("r");
    assert_eq!(row.get("x"), Some(Value::Int(20)));
    assert_eq!(row.get("from_a"), Some(Value::Bool(true)));
    assert_eq!(row.get("from_b"), Some(Value::Bool(true)));
}

#[test]
fn reapplying_a_winning_update_is_a_silent_no_op() {
    let a = doc("alice", 1000);
    a.add(fields(json!({"id": "r", "x": 1}))).unwrap();
    let update = a
        .history(&SourceFilter::all())
        .pop()
        .expect("one update in history");

    let b = doc("bob", 5000);
    let updates_seen = Rc::new(Cell::new(0usize));
    let raw_seen = Rc::new(Cell::new(0usize));
    let u = Rc::clone(&updates_seen);
    b.on_update(move |_| u.set(u.get() + 1));
    let r = Rc::clone(&raw_seen);
    b.on_raw_update(move |_| r.set(r.get() + 1));

    assert!(b.apply_update(update.clone()));
    assert_eq!(updates_seen.get(), 1);

    // the duplicate changes nothing and fires nothing
    assert!(!b.apply_update(update));
    assert_eq!(updates_seen.get(), 1);
    assert_eq!(raw_seen.get(), 1);
    assert_eq!(b.history(&SourceFilter::all()).len(), 1);
}

#[test]
fn stale_updates_leave_no_residue() {
    let a = doc("alice", 1000);
    a.add(fields(json!({"id": "r", "x": 1}))).unwrap();
    let stale = a.history(&SourceFilter::all()).pop().unwrap();

    let b = doc("bob", 5000);
    replicate(&a, &b);
    b.rm("r").unwrap();

    // the already-seen update loses everywhere and must not re-materialize
    // the row
    assert!(!b.apply_update(stale));
    assert!(b.row("r").is_none());
}

#[test]
fn tombstone_precedence_blocks_resurrection() {
    let a = doc("alice", 1000);
    let b = doc("bob", 5000);

    a.add(fields(json!({"id": "r", "x": 1}))).unwrap();
    replicate(&a, &b);

    b.rm("r").unwrap();

    // alice keeps editing without having seen the removal
    a.get("r").set("x", 2).unwrap();
    replicate(&a, &b);

    // the older write cannot resurrect the tombstoned field
    assert!(b.row("r").is_none());

    // a genuinely newer write wins and re-materializes the row
    b.set("r", Some(fields(json!({"x": 3})))).unwrap();
    let row = b.row("r").expect("row lives again");
    assert_eq!(row.get("x"), Some(Value::Int(3)));
}

#[test]
fn tombstones_replicate_through_history() {
    let a = doc("alice", 1000);
    a.add(fields(json!({"id": "r", "x": 1, "y": 2}))).unwrap();
    a.rm("r").unwrap();

    // the tombstone covers several fields but appears once, in wire shape
    let tombstones: Vec<Update> = a
        .history(&SourceFilter::all())
        .into_iter()
        .filter(Update::is_tombstone)
        .collect();
    assert_eq!(tombstones.len(), 1);
    assert_eq!(tombstones[0].row_id(), "r");

    let b = doc("bob", 5000);
    replicate(&a, &b);
    assert!(b.row("r").is_none());
    assert_eq!(a.to_json(), b.to_json());
}

#[test]
fn invalid_updates_are_dropped_with_a_notification() {
    let a = doc("alice", 1000);
    let invalid_seen = Rc::new(Cell::new(0usize));
    let i = Rc::clone(&invalid_seen);
    a.on_invalid(move |err| {
        assert!(err.is_invalid_update());
        i.set(i.get() + 1);
    });

    let malformed = Update::new("", Some(fields(json!({"x": 1}))), 1, "mallory");
    assert!(!a.apply_update(malformed));
    assert_eq!(invalid_seen.get(), 1);
    assert!(a.to_json().is_empty());
}

#[test]
fn retired_fires_once_an_entry_is_unreachable() {
    let a = doc("alice", 1000);
    let retired: Rc<Cell<usize>> = Rc::new(Cell::new(0));
    let r = Rc::clone(&retired);
    a.on_retired(move |_| r.set(r.get() + 1));

    // the initial update carries both `id` and `x`
    a.add(fields(json!({"id": "r", "x": 1}))).unwrap();

    // overwriting `x` leaves the initial update reachable through `id`
    a.get("r").set("x", 2).unwrap();
    assert_eq!(retired.get(), 0);

    // overwriting `x` again strands the intermediate single-field update
    a.get("r").set("x", 3).unwrap();
    assert_eq!(retired.get(), 1);
}

#[test]
fn history_deduplicates_and_filters_by_source() {
    let a = doc("alice", 1000);
    let b = doc("bob", 5000);

    // one update covering two fields is one history entry
    a.add(fields(json!({"id": "r", "x": 1}))).unwrap();
    assert_eq!(a.history(&SourceFilter::all()).len(), 1);

    replicate(&a, &b);
    b.get("r").set("y", 2).unwrap();

    let everything = b.history(&SourceFilter::all());
    assert_eq!(everything.len(), 2);

    // a frontier past alice's writes leaves only bob's
    let frontier = SourceFilter::all().seen("alice", 2000);
    let only_bob = b.history(&frontier);
    assert_eq!(only_bob.len(), 1);
    assert_eq!(only_bob[0].source(), "bob");
}

#[test]
fn get_materializes_and_row_does_not() {
    let a = doc("alice", 1000);
    assert!(a.row("ghost").is_none());

    let ghost = a.get("ghost");
    assert_eq!(ghost.id(), "ghost");
    assert!(a.row("ghost").is_some());
    assert_eq!(
        a.to_json(),
        BTreeMap::from([("ghost".to_string(), fields(json!({"id": "ghost"})))])
    );
}

#[test]
fn add_without_id_generates_one() {
    let a = doc("alice", 1000);
    let row = a.add(fields(json!({"x": 1}))).unwrap();
    assert!(!row.id().is_empty());
    assert!(a.row(row.id()).is_some());
    assert_eq!(row.get("x"), Some(Value::Int(1)));
}

#[test]
fn add_rejects_a_non_string_id() {
    let a = doc("alice", 1000);
    let err = a.add(fields(json!({"id": 5}))).unwrap_err();
    assert!(err.is_invalid_update());
    assert!(a.to_json().is_empty());
}

#[test]
fn row_id_is_immutable() {
    let a = doc("alice", 1000);
    let row = a.add(fields(json!({"id": "r", "x": 1}))).unwrap();

    let err = row.set("id", "other").unwrap_err();
    assert!(err.is_immutable_id());
    assert_eq!(row.get("id"), Some(Value::Text("r".to_string())));

    // writing the same id back is allowed
    row.set("id", "r").unwrap();
}

#[test]
fn detached_rows_drop_mutation_requests() {
    let a = doc("alice", 1000);
    let row = a.add(fields(json!({"id": "r", "x": 1}))).unwrap();
    a.rm("r").unwrap();
    assert!(a.row("r").is_none());

    // the old handle is dead; its requests go nowhere
    row.set("x", 5).unwrap();
    assert!(a.row("r").is_none());

    // a fresh update with the same id materializes a fresh row
    let reborn = a.set("r", Some(fields(json!({"x": 7})))).unwrap();
    assert_ne!(reborn, row);
    assert_eq!(a.get("r").get("x"), Some(Value::Int(7)));
}

#[test]
fn row_notifications_carry_applied_changes() {
    let a = doc("alice", 1000);
    let row = a.add(fields(json!({"id": "r", "x": 1}))).unwrap();

    let last_applied: Rc<Cell<i64>> = Rc::new(Cell::new(0));
    let l = Rc::clone(&last_applied);
    row.on_change(move |applied| {
        if let Some(Value::Int(n)) = applied.get("x") {
            l.set(*n);
        }
    });

    row.set("x", 2).unwrap();
    assert_eq!(last_applied.get(), 2);

    let removed_seen = Rc::new(Cell::new(false));
    let r = Rc::clone(&removed_seen);
    row.on_removed(move || r.set(true));
    a.rm("r").unwrap();
    assert!(removed_seen.get());
}

#[test]
fn doc_add_and_remove_notifications() {
    let a = doc("alice", 1000);
    let added = Rc::new(Cell::new(0usize));
    let removed = Rc::new(Cell::new(0usize));
    let ad = Rc::clone(&added);
    a.on_add(move |_| ad.set(ad.get() + 1));
    let rm = Rc::clone(&removed);
    a.on_remove(move |_| rm.set(rm.get() + 1));

    a.add(fields(json!({"id": "r1", "x": 1}))).unwrap();
    a.add(fields(json!({"id": "r2", "x": 2}))).unwrap();
    // further updates to a known row are not additions
    a.get("r1").set("x", 3).unwrap();
    assert_eq!(added.get(), 2);

    a.rm("r1").unwrap();
    assert_eq!(removed.get(), 1);
}
