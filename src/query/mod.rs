//! # Point Queries
//!
//! Answers "what was true for this address" against the stored ranges.
//!
//! Every query costs exactly one forward seek: range keys are end
//! addresses, so the first key `>= addr` belongs to the only range that
//! can contain `addr`. If that range begins after `addr`, the address
//! falls in a gap and the answer is empty. Stored bytes that fail to
//! decode surface as [`QueryError::Corrupt`]; they are never reported as
//! "not found".


use thiserror::Error;
use tracing::trace;

use crate::address::Address;
use crate::encoding::CodecError;
use crate::history::{Attributes, EncodedHistory, HistoryEntry};
use crate::keys::{self, encode_key};
use crate::store::{Store, StoreError};

/// Errors raised while answering a query.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The range found by the seek could not be decoded.
    #[error("corrupt stored range {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: CodecError,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Read-only query front end over a [`Store`].
#[derive(Debug)]
pub struct QueryEngine<'s, S: Store + ?Sized> {
    store: &'s S,
}

impl<'s, S: Store + ?Sized> QueryEngine<'s, S> {
    pub fn new(store: &'s S) -> Self {
        Self { store }
    }

    /// Finds the history of the range containing `addr`.
    ///
    /// Returns `Ok(None)` when no stored range covers the address.
    pub fn lookup(&self, addr: Address) -> Result<Option<EncodedHistory>, QueryError> {
        let Some(item) = self.store.seek(&encode_key(addr))?.next() else {
            trace!(%addr, "lookup past last range");
            return Ok(None);
        };
        let (key, value) = item?;

        let corrupt = |source| QueryError::Corrupt {
            key: keys::describe_key(&key),
            source,
        };
        keys::decode_key(&key).map_err(corrupt)?;
        let history = EncodedHistory::parse(&value).map_err(corrupt)?;

        if history.begin() > addr {
            trace!(%addr, next_begin = %history.begin(), "lookup in gap");
            return Ok(None);
        }
        Ok(Some(history))
    }

    /// Attributes of the newest entry covering `addr`.
    pub fn latest(&self, addr: Address) -> Result<Option<Attributes>, QueryError> {
        Ok(self.lookup(addr)?.map(|history| history.latest()))
    }

    /// Attributes in effect for `addr` at time `at`: those of the newest
    /// entry whose datetime is `<= at`.
    ///
    /// Datetimes compare as plain strings. Returns `Ok(None)` when the
    /// address is uncovered or `at` predates its first entry.
    pub fn at_time(&self, addr: Address, at: &str) -> Result<Option<Attributes>, QueryError> {
        let Some(history) = self.lookup(addr)? else {
            return Ok(None);
        };
        Ok(history
            .position_at(at)
            .and_then(|index| history.reconstruct(index)))
    }

    /// Every entry covering `addr`, oldest first. Empty when uncovered.
    pub fn history(&self, addr: Address) -> Result<Vec<HistoryEntry>, QueryError> {
        Ok(self
            .lookup(addr)?
            .map(|history| history.entries())
            .unwrap_or_default())
    }
}
