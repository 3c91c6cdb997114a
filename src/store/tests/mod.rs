//! Contract tests shared by every [`Store`] adapter.
//!
//! Each scenario is written once against `&dyn Store` and run for both
//! `MemoryStore` and `RedbStore`.
