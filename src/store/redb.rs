//! Persistent [`Store`] on top of the `redb` embedded database.
//!
//! All ranges live in one table keyed by raw bytes. Each
//! [`Store::write_batch`] is a single redb write transaction, so a batch is
//! either fully committed or not visible at all. Seeks run inside a read
//! transaction and therefore see a consistent snapshot even while a load is
//! committing.

use std::collections::VecDeque;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use ::redb::{
    CommitError, Database, DatabaseError, ReadOnlyTable, ReadTransaction, ReadableTable,
    StorageError, TableDefinition, TableError, TransactionError,
};
use tracing::{debug, info, trace};

use super::{BatchOp, KeyValue, Store, StoreError, StoreIter, WriteBatch};

/// Table holding `end key -> encoded range value`.
const RANGES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("ranges");

/// Number of entries a cursor pulls from the table per refill.
const PREFETCH: usize = 64;

// ------------------------------------------------------------------------------------------------
// Error conversions
// ------------------------------------------------------------------------------------------------

macro_rules! impl_from_redb {
    ($($err:ty),* $(,)?) => {
        $(
            impl From<$err> for StoreError {
                fn from(e: $err) -> Self {
                    StoreError::Backend(e.into())
                }
            }
        )*
    };
}

impl_from_redb!(
    CommitError,
    DatabaseError,
    StorageError,
    TableError,
    TransactionError
);

// ------------------------------------------------------------------------------------------------
// RedbStore
// ------------------------------------------------------------------------------------------------

/// A redb database file holding the range index.
pub struct RedbStore {
    db: Database,
    path: PathBuf,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Opens the database file at `path`, creating it (and the range table)
    /// if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let db = Database::create(&path)?;

        // Read transactions cannot create tables; make sure it exists.
        let txn = db.begin_write()?;
        txn.open_table(RANGES)?;
        txn.commit()?;

        info!(path = %path.display(), "range store opened");
        Ok(Self { db, path })
    }
}

impl Store for RedbStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(RANGES)?;
        let value = table.get(key)?.map(|guard| guard.value().to_vec());
        Ok(value)
    }

    fn seek(&self, key: &[u8]) -> Result<StoreIter<'_>, StoreError> {
        trace!(key_len = key.len(), "redb seek");
        let txn = self.db.begin_read()?;
        let table = txn.open_table(RANGES)?;
        Ok(Box::new(RedbCursor {
            table,
            _txn: txn,
            resume: Some(Bound::Included(key.to_vec())),
            buffer: VecDeque::with_capacity(PREFETCH),
        }))
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let ops = batch.len();
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(RANGES)?;
            for op in batch {
                match op {
                    BatchOp::Put { key, value } => {
                        table.insert(key.as_slice(), value.as_slice())?;
                    }
                    BatchOp::Delete { key } => {
                        table.remove(key.as_slice())?;
                    }
                }
            }
        }
        txn.commit()?;
        debug!(ops, "redb batch committed");
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Cursor
// ------------------------------------------------------------------------------------------------

/// Forward cursor reading the table in chunks of [`PREFETCH`] entries.
struct RedbCursor {
    table: ReadOnlyTable<&'static [u8], &'static [u8]>,
    _txn: ReadTransaction,
    /// Lower bound of the next refill; `None` once the table is exhausted.
    resume: Option<Bound<Vec<u8>>>,
    buffer: VecDeque<KeyValue>,
}

impl RedbCursor {
    fn refill(&mut self) -> Result<(), StoreError> {
        let Some(resume) = self.resume.take() else {
            return Ok(());
        };
        let lower = resume.as_ref().map(Vec::as_slice);
        let range = self.table.range::<&[u8]>((lower, Bound::Unbounded))?;
        for item in range.take(PREFETCH) {
            let (k, v) = item?;
            self.buffer.push_back((k.value().to_vec(), v.value().to_vec()));
        }
        if self.buffer.len() == PREFETCH {
            self.resume = self.buffer.back().map(|(k, _)| Bound::Excluded(k.clone()));
        }
        Ok(())
    }
}

impl Iterator for RedbCursor {
    type Item = Result<KeyValue, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() {
            if let Err(e) = self.refill() {
                self.resume = None;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
