use serde_json::Value;
use tracing_subscriber::EnvFilter;

use crate::address::Address;
use crate::history::Attributes;
use crate::loader::{LoadConfig, LoadStats, MergeEngine, Snapshot};
use crate::query::QueryEngine;
use crate::range::StoredRange;
use crate::store::MemoryStore;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn ip(text: &str) -> Address {
    text.parse().unwrap()
}

pub fn attrs(value: Value) -> Attributes {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

/// `leaf` wrapped in `depth` single-element arrays.
pub fn nested(depth: usize) -> Value {
    (0..depth).fold(Value::from("leaf"), |inner, _| Value::Array(vec![inner]))
}

pub fn snap(begin: &str, end: &str, datetime: &str, value: Value) -> Snapshot {
    Snapshot::new(ip(begin), ip(end), datetime, attrs(value))
}

/// Loads `snapshots` as one run with the given config.
pub fn load_with(store: &MemoryStore, config: LoadConfig, snapshots: Vec<Snapshot>) -> LoadStats {
    init_tracing();
    MergeEngine::new(store, config).load(snapshots).unwrap()
}

/// Loads `snapshots` as one run with the default config.
pub fn load(store: &MemoryStore, snapshots: Vec<Snapshot>) -> LoadStats {
    load_with(store, LoadConfig::default(), snapshots)
}

/// Every stored range, in key order.
pub fn stored(store: &MemoryStore) -> Vec<StoredRange> {
    store
        .dump()
        .unwrap()
        .iter()
        .map(|(k, v)| StoredRange::from_kv(k, v).unwrap())
        .collect()
}

/// Stored ranges as `(begin, end, datetimes)` text for compact assertions.
pub fn layout(store: &MemoryStore) -> Vec<(String, String, Vec<String>)> {
    stored(store)
        .into_iter()
        .map(|r| {
            (
                r.begin.to_string(),
                r.end.to_string(),
                r.history.into_iter().map(|e| e.datetime).collect(),
            )
        })
        .collect()
}

pub fn latest(store: &MemoryStore, addr: &str) -> Option<Attributes> {
    QueryEngine::new(store).latest(ip(addr)).unwrap()
}

pub fn at(store: &MemoryStore, addr: &str, datetime: &str) -> Option<Attributes> {
    QueryEngine::new(store).at_time(ip(addr), datetime).unwrap()
}

pub fn datetimes(store: &MemoryStore, addr: &str) -> Vec<String> {
    QueryEngine::new(store)
        .history(ip(addr))
        .unwrap()
        .into_iter()
        .map(|e| e.datetime)
        .collect()
}

/// Value of attribute `x` at `datetime` (or latest), as loaded by the
/// scenario tests.
pub fn x_at(store: &MemoryStore, addr: &str, datetime: Option<&str>) -> Option<i64> {
    let found = match datetime {
        Some(datetime) => at(store, addr, datetime),
        None => latest(store, addr),
    };
    found.map(|attributes| attributes["x"].as_i64().unwrap())
}
