//! Ordered view tests: insertion, ordering, collisions, list operations.

use std::cell::Cell;
use std::rc::Rc;

use concord::{RowRef, Seq, Value};
use serde_json::json;

use crate::helpers::{doc, fields, replicate};

fn sort_key(seq: &Seq, id: &str) -> String {
    let row = seq.get_row(id).expect("member");
    match row.get("_sort") {
        Some(Value::Text(key)) => key,
        other => panic!("row {id} has no sort key: {other:?}"),
    }
}

fn member_ids(seq: &Seq) -> Vec<String> {
    seq.rows().iter().map(|row| row.id().to_string()).collect()
}

#[test]
fn push_unshift_and_index_of() {
    let a = doc("alice", 1000);
    let todos = a.create_seq("list", "todo");

    todos.push(fields(json!({"id": "a", "title": "one"}))).unwrap();
    todos.push(fields(json!({"id": "b", "title": "two"}))).unwrap();
    todos.unshift(fields(json!({"id": "c", "title": "zero"}))).unwrap();

    assert_eq!(todos.len(), 3);
    assert_eq!(todos.first().unwrap().id(), "c");
    assert_eq!(todos.last().unwrap().id(), "b");
    assert_eq!(todos.index_of("a"), Some(1));
    assert_eq!(todos.at(0).unwrap().id(), "c");
    assert_eq!(member_ids(&todos), ["c", "a", "b"]);
}

#[test]
fn members_stay_sorted_and_adjacent() {
    let a = doc("alice", 1000);
    let todos = a.create_seq("list", "todo");
    for id in ["a", "b", "c", "d"] {
        todos.push(fields(json!({"id": id}))).unwrap();
    }

    let rows = todos.rows();
    for pair in rows.windows(2) {
        let left = sort_key(&todos, pair[0].id());
        let right = sort_key(&todos, pair[1].id());
        assert!(left < right, "{left:?} should precede {right:?}");
    }

    // prev/next walk the adjacency exactly
    assert_eq!(
        todos.next(Some(RowRef::from(&rows[0]))).unwrap().id(),
        rows[1].id()
    );
    assert_eq!(
        todos.prev(Some(RowRef::from(&rows[1]))).unwrap().id(),
        rows[0].id()
    );
    // absent boundaries mean the list ends
    assert_eq!(todos.next(None).unwrap().id(), rows[0].id());
    assert_eq!(todos.prev(None).unwrap().id(), rows[3].id());
}

#[test]
fn before_and_after_place_items_adjacently() {
    let a = doc("alice", 1000);
    let todos = a.create_seq("list", "todo");
    todos.push(fields(json!({"id": "a"}))).unwrap();
    todos.push(fields(json!({"id": "b"}))).unwrap();

    todos.after(fields(json!({"id": "a2"})), "a").unwrap();
    assert_eq!(member_ids(&todos), ["a", "a2", "b"]);

    todos.before(fields(json!({"id": "a0"})), "a").unwrap();
    assert_eq!(member_ids(&todos), ["a0", "a", "a2", "b"]);
}

#[test]
fn removed_members_can_be_pushed_back() {
    let a = doc("alice", 1000);
    let todos = a.create_seq("list", "todo");
    todos.push(fields(json!({"id": "a"}))).unwrap();
    todos.push(fields(json!({"id": "b"}))).unwrap();
    todos.push(fields(json!({"id": "c"}))).unwrap();

    todos.remove("c").unwrap().expect("was a member");
    assert_eq!(member_ids(&todos), ["a", "b"]);
    // the row itself stays in the document
    assert!(a.row("c").is_some());

    // pushing by id re-applies the defining field and a fresh tail key
    todos.push("c").unwrap();
    assert_eq!(todos.last().unwrap().id(), "c");
    assert_eq!(todos.len(), 3);
}

#[test]
fn pop_and_shift_trim_the_ends() {
    let a = doc("alice", 1000);
    let todos = a.create_seq("list", "todo");
    for id in ["a", "b", "c"] {
        todos.push(fields(json!({"id": id}))).unwrap();
    }

    let popped = todos.pop().unwrap().expect("non-empty");
    assert_eq!(popped.id(), "c");
    let shifted = todos.shift().unwrap().expect("non-empty");
    assert_eq!(shifted.id(), "a");
    assert_eq!(member_ids(&todos), ["b"]);

    todos.pop().unwrap();
    assert!(todos.pop().unwrap().is_none());
    assert!(todos.shift().unwrap().is_none());
}

#[test]
fn inverted_or_empty_intervals_are_rejected() {
    let a = doc("alice", 1000);
    let todos = a.create_seq("list", "todo");
    let first = todos.push(fields(json!({"id": "a"}))).unwrap();
    let last = todos.push(fields(json!({"id": "b"}))).unwrap();

    let inverted = todos
        .insert(
            fields(json!({"id": "z"})),
            Some(RowRef::from(&last)),
            Some(RowRef::from(&first)),
        )
        .unwrap_err();
    assert!(inverted.is_impossible_insert());

    let empty = todos
        .insert(
            fields(json!({"id": "z"})),
            Some(RowRef::from(&first)),
            Some(RowRef::from(&first)),
        )
        .unwrap_err();
    assert!(empty.is_impossible_insert());

    // caller misuse leaves no trace
    assert_eq!(todos.len(), 2);
    assert!(a.row("z").is_none());
}

#[test]
fn equal_sort_keys_are_nudged_apart() {
    let a = doc("alice", 1000);
    let todos = a.create_seq("list", "todo");

    let moved_seen = Rc::new(Cell::new(0usize));
    let m = Rc::clone(&moved_seen);
    todos.on_moved(move |_| m.set(m.get() + 1));

    // manufacture the collision concurrent inserts would produce
    a.add(fields(json!({"id": "x", "list": "todo", "_sort": "M"})))
        .unwrap();
    a.add(fields(json!({"id": "y", "list": "todo", "_sort": "M"})))
        .unwrap();

    let key_x = sort_key(&todos, "x");
    let key_y = sort_key(&todos, "y");
    assert_eq!(key_x, "M");
    assert_ne!(key_x, key_y, "collision must be resolved");
    assert!(key_y > key_x, "the changed member is nudged forward");
    assert_eq!(member_ids(&todos), ["x", "y"]);
    // the uncontested insert announced a plain move
    assert!(moved_seen.get() >= 1);
}

#[test]
fn collision_resolution_converges_across_replicas() {
    let a = doc("alice", 1000);
    let seq_a = a.create_seq("list", "todo");
    a.add(fields(json!({"id": "x", "list": "todo", "_sort": "M"})))
        .unwrap();
    a.add(fields(json!({"id": "y", "list": "todo", "_sort": "M"})))
        .unwrap();

    let b = doc("bob", 5000);
    let seq_b = b.create_seq("list", "todo");
    // replaying the collision makes bob nudge locally as well; exchanging
    // both ways settles the pair on one resolution
    replicate(&a, &b);
    replicate(&b, &a);

    assert_eq!(a.to_json(), b.to_json());
    assert_eq!(seq_a.to_json(), seq_b.to_json());
    assert_eq!(member_ids(&seq_a), member_ids(&seq_b));

    let keys: Vec<String> = seq_b
        .rows()
        .iter()
        .map(|row| sort_key(&seq_b, row.id()))
        .collect();
    assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn sequences_replicate_in_order() {
    let a = doc("alice", 1000);
    let todos = a.create_seq("list", "todo");
    todos.push(fields(json!({"id": "a"}))).unwrap();
    todos.push(fields(json!({"id": "b"}))).unwrap();
    todos.unshift(fields(json!({"id": "c"}))).unwrap();

    let b = doc("bob", 5000);
    replicate(&a, &b);
    let remote = b.create_seq("list", "todo");

    assert_eq!(member_ids(&remote), member_ids(&todos));
    assert_eq!(remote.to_json(), todos.to_json());
}

#[test]
fn existing_rows_join_a_sequence_through_insert() {
    let a = doc("alice", 1000);
    a.add(fields(json!({"id": "loose", "note": "not listed yet"})))
        .unwrap();
    let todos = a.create_seq("list", "todo");
    todos.push(fields(json!({"id": "a"}))).unwrap();

    // handing an existing row to insert applies the defining field too
    let row = a.get("loose");
    todos.push(&row).unwrap();
    assert!(todos.has("loose"));
    assert_eq!(row.get("list"), Some(Value::Text("todo".to_string())));
    assert_eq!(todos.last().unwrap().id(), "loose");
}

#[test]
fn rows_joining_by_field_alone_sort_by_their_existing_key() {
    let a = doc("alice", 1000);
    let todos = a.create_seq("list", "todo");
    todos.push(fields(json!({"id": "a"}))).unwrap();
    todos.push(fields(json!({"id": "b"}))).unwrap();

    // this row already carries a key below every generated one; joining by
    // the defining field alone must still slot it in front
    a.add(fields(json!({"id": "early", "_sort": "!!x"}))).unwrap();
    a.get("early").set("list", "todo").unwrap();

    assert_eq!(member_ids(&todos)[0], "early");
    assert_eq!(todos.first().unwrap().id(), "early");
}

#[test]
fn sequences_built_over_existing_rows_start_sorted() {
    let a = doc("alice", 1000);
    // row-table order (by id) disagrees with key order on purpose
    a.add(fields(json!({"id": "aa", "list": "todo", "_sort": "x"})))
        .unwrap();
    a.add(fields(json!({"id": "zz", "list": "todo", "_sort": "c"})))
        .unwrap();

    let todos = a.create_seq("list", "todo");
    assert_eq!(member_ids(&todos), ["zz", "aa"]);
}
