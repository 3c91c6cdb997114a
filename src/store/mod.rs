//! # Ordered Key-Value Store
//!
//! Whip does not implement its own storage engine. Everything it persists
//! goes through the [`Store`] trait: an ordered map of byte keys to byte
//! values with point reads, forward seeks and atomic batch writes.
//!
//! Two adapters are provided:
//!
//! - [`MemoryStore`]: a copy-on-write `BTreeMap`; readers iterate an
//!   immutable snapshot, writers publish a whole batch at once.
//! - [`RedbStore`]: a persistent store on top of the `redb` embedded
//!   B-tree database, using its MVCC read transactions for readers and one
//!   write transaction per batch.
//!
//! ## Contract
//!
//! - [`Store::seek`] yields pairs in ascending byte order, starting at the
//!   first key `>=` the given key.
//! - [`Store::write_batch`] applies every operation, in order, or none.
//! - A seek started after `write_batch` returns observes the whole batch.

mod memory;
mod redb;

#[cfg(test)]
mod tests;

pub use self::memory::MemoryStore;
pub use self::redb::RedbStore;

use thiserror::Error;

/// A single key-value pair returned by [`Store::seek`].
pub type KeyValue = (Vec<u8>, Vec<u8>);

/// Forward iterator over store entries.
pub type StoreIter<'a> = Box<dyn Iterator<Item = Result<KeyValue, StoreError>> + 'a>;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors raised by a [`Store`] adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failure reported by the redb backend.
    #[error("redb error: {0}")]
    Backend(#[from] ::redb::Error),

    /// Internal invariant violation (poisoned lock, unexpected state, etc.).
    #[error("internal store error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Write batches
// ------------------------------------------------------------------------------------------------

/// One mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite `key`.
    Put { key: Vec<u8>, value: Vec<u8> },
    /// Remove `key` if present.
    Delete { key: Vec<u8> },
}

/// An ordered list of mutations applied atomically by [`Store::write_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an insert.
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    /// Queues a removal.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

impl IntoIterator for WriteBatch {
    type Item = BatchOp;
    type IntoIter = std::vec::IntoIter<BatchOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

// ------------------------------------------------------------------------------------------------
// Store trait
// ------------------------------------------------------------------------------------------------

/// Ordered binary key-value persistence used by the loader and queries.
///
/// Implementations must allow many concurrent readers alongside a writer.
pub trait Store: Send + Sync {
    /// Reads the value stored under `key`.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Iterates entries in ascending key order starting at the first key
    /// `>= key`.
    fn seek(&self, key: &[u8]) -> Result<StoreIter<'_>, StoreError>;

    /// Applies every operation of `batch` atomically.
    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError>;
}

impl<S: Store + ?Sized> Store for &S {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(key)
    }

    fn seek(&self, key: &[u8]) -> Result<StoreIter<'_>, StoreError> {
        (**self).seek(key)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        (**self).write_batch(batch)
    }
}

impl<S: Store + ?Sized> Store for std::sync::Arc<S> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(key)
    }

    fn seek(&self, key: &[u8]) -> Result<StoreIter<'_>, StoreError> {
        (**self).seek(key)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        (**self).write_batch(batch)
    }
}
