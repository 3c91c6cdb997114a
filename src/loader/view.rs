//! Store contents overlaid with a run's pending writes.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::btree_map;
use std::iter::Peekable;
use std::ops::Bound;

use crate::store::{KeyValue, Store, StoreError, StoreIter, WriteBatch};

/// Pending value of a key: `Some` for a put, `None` for a delete.
type Pending = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// Read-your-writes view used while planning a load.
///
/// The overlay holds only the net effect per key, so flushing it yields the
/// smallest batch that moves the store to the planned state.
pub(super) struct View<'s, S: Store + ?Sized> {
    store: &'s S,
    pending: Pending,
}

impl<'s, S: Store + ?Sized> View<'s, S> {
    pub(super) fn new(store: &'s S) -> Self {
        Self {
            store,
            pending: BTreeMap::new(),
        }
    }

    pub(super) fn store(&self) -> &'s S {
        self.store
    }

    pub(super) fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.pending.insert(key, Some(value));
    }

    pub(super) fn delete(&mut self, key: Vec<u8>) {
        self.pending.insert(key, None);
    }

    pub(super) fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self.pending.get(key) {
            Some(pending) => Ok(pending.clone()),
            None => self.store.get(key),
        }
    }

    /// Iterates the merged view from the first key `>= key`.
    pub(super) fn seek(&self, key: &[u8]) -> Result<ViewCursor<'_>, StoreError> {
        let overlay = self
            .pending
            .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
            .peekable();
        Ok(ViewCursor {
            base: self.store.seek(key)?.peekable(),
            overlay,
        })
    }

    /// Drains the overlay into a write batch: deletes and puts in key order.
    pub(super) fn take_batch(&mut self) -> WriteBatch {
        let mut batch = WriteBatch::new();
        for (key, value) in std::mem::take(&mut self.pending) {
            match value {
                Some(value) => batch.put(key, value),
                None => batch.delete(key),
            }
        }
        batch
    }
}

/// Merge of a store cursor and the overlay; the overlay wins on equal keys
/// and pending deletes hide store entries.
pub(super) struct ViewCursor<'a> {
    base: Peekable<StoreIter<'a>>,
    overlay: Peekable<btree_map::Range<'a, Vec<u8>, Option<Vec<u8>>>>,
}

impl Iterator for ViewCursor<'_> {
    type Item = Result<KeyValue, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let order = match (self.base.peek(), self.overlay.peek()) {
                (None, None) => return None,
                (Some(Err(_)), _) => return self.base.next(),
                (Some(Ok(_)), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(Ok((base_key, _))), Some((pending_key, _))) => {
                    base_key.as_slice().cmp(pending_key.as_slice())
                }
            };

            match order {
                Ordering::Less => return self.base.next(),
                Ordering::Equal => {
                    self.base.next();
                }
                Ordering::Greater => {}
            }

            if let Some((key, Some(value))) = self.overlay.next() {
                return Some(Ok((key.clone(), value.clone())));
            }
        }
    }
}
