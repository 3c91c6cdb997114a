//! In-memory [`Store`] backed by a copy-on-write `BTreeMap`.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use tracing::trace;

use super::{BatchOp, KeyValue, Store, StoreError, StoreIter, WriteBatch};

type Tree = BTreeMap<Vec<u8>, Vec<u8>>;

/// A volatile ordered map, mainly for tests and embedding.
///
/// The current contents live in an `Arc<BTreeMap>`. Readers clone the `Arc`
/// and iterate that snapshot without holding any lock; [`Store::write_batch`]
/// applies a batch to a private copy (or in place when no reader holds the
/// snapshot) and swaps it in under the write lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tree: RwLock<Arc<Tree>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.snapshot()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.snapshot()?.is_empty())
    }

    /// Copies out every entry in key order.
    pub fn dump(&self) -> Result<Vec<KeyValue>, StoreError> {
        Ok(self
            .snapshot()?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn snapshot(&self) -> Result<Arc<Tree>, StoreError> {
        self.tree
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|_| StoreError::Internal("RwLock poisoned".into()))
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.snapshot()?.get(key).cloned())
    }

    fn seek(&self, key: &[u8]) -> Result<StoreIter<'_>, StoreError> {
        trace!(key_len = key.len(), "memory seek");
        Ok(Box::new(SnapshotCursor {
            tree: self.snapshot()?,
            lower: Bound::Included(key.to_vec()),
        }))
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut guard = self
            .tree
            .write()
            .map_err(|_| StoreError::Internal("RwLock poisoned".into()))?;
        let tree = Arc::make_mut(&mut guard);
        for op in batch {
            match op {
                BatchOp::Put { key, value } => {
                    tree.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    tree.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// Iterates a frozen snapshot, remembering the last key returned.
struct SnapshotCursor {
    tree: Arc<Tree>,
    lower: Bound<Vec<u8>>,
}

impl Iterator for SnapshotCursor {
    type Item = Result<KeyValue, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (key, value) = {
            let lower = self.lower.as_ref().map(Vec::as_slice);
            let (k, v) = self.tree.range::<[u8], _>((lower, Bound::Unbounded)).next()?;
            (k.clone(), v.clone())
        };
        self.lower = Bound::Excluded(key.clone());
        Some(Ok((key, value)))
    }
}
