//! The persisted unit: a closed address range and its history.

use crate::address::Address;
use crate::encoding::CodecError;
use crate::history::{self, HistoryEntry};
use crate::keys::{self, KEY_LEN};

/// A disjoint address range `[begin, end]` with its datetime-ordered history.
///
/// Stored as `encode_key(end) -> history::encode(begin, history)`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRange {
    pub begin: Address,
    pub end: Address,
    pub history: Vec<HistoryEntry>,
}

impl StoredRange {
    /// A range seen for the first time, with a single-entry history.
    pub fn fresh(begin: Address, end: Address, entry: HistoryEntry) -> Self {
        Self {
            begin,
            end,
            history: vec![entry],
        }
    }

    /// Store key of this range.
    pub fn key(&self) -> [u8; KEY_LEN] {
        keys::encode_key(self.end)
    }

    /// Store value of this range.
    pub fn encode_value(&self) -> Result<Vec<u8>, CodecError> {
        history::encode(self.begin, &self.history)
    }

    /// Rebuilds a range from a raw store key/value pair.
    pub fn from_kv(key: &[u8], value: &[u8]) -> Result<Self, CodecError> {
        let end = keys::decode_key(key)?;
        Self::from_value(end, value)
    }

    /// Rebuilds a range from its end address and raw store value.
    pub fn from_value(end: Address, value: &[u8]) -> Result<Self, CodecError> {
        let (begin, history) = history::decode(value)?;
        if begin > end {
            return Err(CodecError::Corrupt(format!(
                "stored range begins at {begin} after its end {end}"
            )));
        }
        Ok(Self {
            begin,
            end,
            history,
        })
    }
}
