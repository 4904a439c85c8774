//! Shared helpers for the integration suite.

use concord::{Doc, FieldMap, FixedClock, SourceFilter};

/// Builds a [`FieldMap`] from a `serde_json::json!` object literal.
pub fn fields(value: serde_json::Value) -> FieldMap {
    concord::fields_from_json(value).expect("test fields must be JSON objects with integer numbers")
}

/// A document with a deterministic clock starting at `start_millis`.
///
/// Spacing the start values out (1000, 5000, ...) makes the last-writer-wins
/// outcome between replicas explicit in each test.
pub fn doc(source: &str, start_millis: u64) -> Doc {
    Doc::with_clock(source, FixedClock::new(start_millis))
}

/// Replays everything `from` knows into `to`, in canonical order.
pub fn replicate(from: &Doc, to: &Doc) {
    for update in from.history(&SourceFilter::all()) {
        to.apply_update(update);
    }
}

/// Replays everything `from` knows into `to`, newest first.
pub fn replicate_reversed(from: &Doc, to: &Doc) {
    for update in from.history(&SourceFilter::all()).into_iter().rev() {
        to.apply_update(update);
    }
}
