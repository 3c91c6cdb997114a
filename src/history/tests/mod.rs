
use serde_json::{Value, json};

use crate::history::{Attributes, HistoryEntry};

/// Builds an attribute map from a JSON object literal.
pub fn attrs(value: Value) -> Attributes {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

/// Builds a history entry from a datetime and JSON object literal.
pub fn entry(datetime: &str, value: Value) -> HistoryEntry {
    HistoryEntry::new(datetime, attrs(value))
}

/// Four snapshots exercising additions, changes and removals.
pub fn sample_history() -> Vec<HistoryEntry> {
    vec![
        entry("2010-01-01", json!({"a": 1, "b": 1, "c": 1})),
        entry("2011-01-01", json!({"a": 2, "b": 2})),
        entry("2012-01-01", json!({"a": 3, "b": 3, "c": 3})),
        entry("2013-01-01", json!({"a": 4, "b": 3, "c": 3})),
    ]
}
