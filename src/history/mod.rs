//! # History Diff Codec
//!
//! Encodes the time-ordered attribute history of one stored range as a
//! **base record plus forward diffs**. Successive snapshots of the same range
//! usually repeat most attributes, so storing only what changed keeps values
//! small; the price is a linear replay when an older or newer entry is
//! reconstructed.
//!
//! ## Value layout
//!
//! ```text
//! [u8 version = 1]
//! [begin address: 16 B big-endian]
//! [u32 entry count]
//!   [String datetime][u32 n]([String key][Value])*n[u32 m]([String removed])*m   (per entry)
//! [u32 crc32 of everything above]
//! ```
//!
//! Entry 0 carries the full attribute map in its `set` part and never
//! removes anything. Entry `i > 0` carries the keys that were added or
//! changed relative to the reconstruction of entry `i - 1`, plus the keys
//! that disappeared.
//!
//! ## Invariants
//!
//! - A history holds at least one entry.
//! - Datetimes are strictly increasing (lexicographic on the string form).
//! - `decode(encode(h)) == h` for every valid history `h`, comparing
//!   attribute maps structurally.

#[cfg(test)]
mod tests;

use serde_json::{Map, Value};

use crate::address::Address;
use crate::encoding::{self, CodecError, Decode, Encode};

/// Current on-disk version byte of encoded histories.
pub const FORMAT_VERSION: u8 = 1;

/// Open attribute mapping attached to a snapshot.
pub type Attributes = Map<String, Value>;

// ------------------------------------------------------------------------------------------------
// History entries
// ------------------------------------------------------------------------------------------------

/// One timestamped attribute snapshot of a range.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    /// ISO-8601 timestamp, compared lexicographically.
    pub datetime: String,
    /// Attribute values valid from `datetime` on.
    pub attributes: Attributes,
}

impl HistoryEntry {
    pub fn new(datetime: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            datetime: datetime.into(),
            attributes,
        }
    }
}

/// Inserts `entry` into a datetime-ordered history.
///
/// An entry with the same datetime is replaced wholesale; otherwise the new
/// entry is placed at its sorted position.
pub fn upsert_entry(history: &mut Vec<HistoryEntry>, entry: HistoryEntry) {
    match history.binary_search_by(|e| e.datetime.as_str().cmp(entry.datetime.as_str())) {
        Ok(i) => history[i] = entry,
        Err(i) => history.insert(i, entry),
    }
}

// ------------------------------------------------------------------------------------------------
// Attribute diffs
// ------------------------------------------------------------------------------------------------

/// Changes turning one attribute map into another.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AttributeDiff {
    /// Keys that were added or whose value changed, with their new values.
    pub set: Attributes,
    /// Keys present in the base but absent from the target.
    pub removed: Vec<String>,
}

impl AttributeDiff {
    /// `true` when applying the diff changes nothing.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.removed.is_empty()
    }
}

/// Computes the diff that turns `base` into `next`.
///
/// Values are compared by structural equality; nested objects are not
/// diffed recursively.
pub fn diff(base: &Attributes, next: &Attributes) -> AttributeDiff {
    let set = next
        .iter()
        .filter(|&(k, v)| base.get(k) != Some(v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let removed = base
        .keys()
        .filter(|k| !next.contains_key(k.as_str()))
        .cloned()
        .collect();
    AttributeDiff { set, removed }
}

/// Applies `diff` to `target` in place. Inverse of [`diff`].
pub fn patch(target: &mut Attributes, diff: &AttributeDiff) {
    for (k, v) in &diff.set {
        target.insert(k.clone(), v.clone());
    }
    for k in &diff.removed {
        target.remove(k);
    }
}

impl Encode for AttributeDiff {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        self.set.encode_to(buf)?;
        encoding::encode_vec(&self.removed, buf)
    }
}

impl Decode for AttributeDiff {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let (set, mut offset) = Attributes::decode_from(buf)?;
        let (removed, n) = encoding::decode_vec::<String>(&buf[offset..])?;
        offset += n;
        Ok((AttributeDiff { set, removed }, offset))
    }
}

// ------------------------------------------------------------------------------------------------
// Encoded steps
// ------------------------------------------------------------------------------------------------

/// A datetime with the diff leading to its attributes.
#[derive(Debug, Clone, PartialEq)]
struct Step {
    datetime: String,
    diff: AttributeDiff,
}

impl Encode for Step {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        self.datetime.encode_to(buf)?;
        self.diff.encode_to(buf)
    }
}

impl Decode for Step {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let (datetime, mut offset) = String::decode_from(buf)?;
        let (diff, n) = AttributeDiff::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Step { datetime, diff }, offset))
    }
}

fn check_order<'a>(datetimes: impl Iterator<Item = &'a str>) -> Result<usize, CodecError> {
    let mut count = 0;
    let mut previous: Option<&str> = None;
    for dt in datetimes {
        match previous {
            Some(prev) if prev >= dt => {
                return Err(CodecError::Corrupt(format!(
                    "history datetimes not strictly increasing: {prev:?} then {dt:?}"
                )));
            }
            _ => {}
        }
        previous = Some(dt);
        count += 1;
    }
    if count == 0 {
        return Err(CodecError::Corrupt("history has no entries".into()));
    }
    Ok(count)
}

// ------------------------------------------------------------------------------------------------
// Encode / decode
// ------------------------------------------------------------------------------------------------

/// Encodes `begin` and a datetime-ordered history into a stored value.
///
/// # Errors
///
/// - [`CodecError::Corrupt`] if the history is empty or its datetimes are
///   not strictly increasing.
/// - [`CodecError::LengthOverflow`] if an attribute exceeds a decoding
///   limit such as [`encoding::MAX_NESTING`].
pub fn encode(begin: Address, history: &[HistoryEntry]) -> Result<Vec<u8>, CodecError> {
    check_order(history.iter().map(|e| e.datetime.as_str()))?;

    let mut buf = Vec::with_capacity(64);
    FORMAT_VERSION.encode_to(&mut buf)?;
    begin.value().to_be_bytes().encode_to(&mut buf)?;

    let empty = Attributes::new();
    let mut previous = &empty;
    let steps: Vec<Step> = history
        .iter()
        .map(|entry| {
            let step = Step {
                datetime: entry.datetime.clone(),
                diff: diff(previous, &entry.attributes),
            };
            previous = &entry.attributes;
            step
        })
        .collect();
    encoding::encode_vec(&steps, &mut buf)?;

    Ok(encoding::seal(buf))
}

/// Decodes a stored value into its begin address and full history.
pub fn decode(bytes: &[u8]) -> Result<(Address, Vec<HistoryEntry>), CodecError> {
    let encoded = EncodedHistory::parse(bytes)?;
    let begin = encoded.begin();
    Ok((begin, encoded.entries()))
}

// ------------------------------------------------------------------------------------------------
// Random access
// ------------------------------------------------------------------------------------------------

/// A parsed, still diff-encoded history.
///
/// Parsing verifies the checksum and structure once; individual entries are
/// then reconstructed on demand by replaying diffs.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedHistory {
    begin: Address,
    steps: Vec<Step>,
}

impl EncodedHistory {
    /// Verifies and parses a stored value.
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        let payload = encoding::unseal(bytes)?;

        let (version, mut offset) = u8::decode_from(payload)?;
        if version != FORMAT_VERSION {
            return Err(CodecError::InvalidTag {
                tag: u32::from(version),
                type_name: "history format version",
            });
        }
        let (begin, n) = <[u8; 16]>::decode_from(&payload[offset..])?;
        offset += n;
        let (steps, n) = encoding::decode_vec::<Step>(&payload[offset..])?;
        offset += n;
        if offset != payload.len() {
            return Err(CodecError::TrailingBytes(payload.len() - offset));
        }

        check_order(steps.iter().map(|s| s.datetime.as_str()))?;
        if !steps[0].diff.removed.is_empty() {
            return Err(CodecError::Corrupt(
                "base history entry removes attributes".into(),
            ));
        }

        Ok(Self {
            begin: Address::new(u128::from_be_bytes(begin)),
            steps,
        })
    }

    /// First address of the range this history belongs to.
    pub fn begin(&self) -> Address {
        self.begin
    }

    /// Number of entries; always at least one.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Index of the newest entry with `datetime <= at`, if any.
    pub fn position_at(&self, at: &str) -> Option<usize> {
        self.steps
            .partition_point(|s| s.datetime.as_str() <= at)
            .checked_sub(1)
    }

    /// Replays the base and diffs up to and including `upto`.
    ///
    /// Returns `None` if `upto` is out of range.
    pub fn reconstruct(&self, upto: usize) -> Option<Attributes> {
        let steps = self.steps.get(..=upto)?;
        let mut attributes = Attributes::new();
        for step in steps {
            patch(&mut attributes, &step.diff);
        }
        Some(attributes)
    }

    /// Attributes of the newest entry.
    pub fn latest(&self) -> Attributes {
        self.reconstruct(self.steps.len().saturating_sub(1))
            .unwrap_or_default()
    }

    /// Reconstructs every entry in datetime order.
    pub fn entries(&self) -> Vec<HistoryEntry> {
        let mut attributes = Attributes::new();
        self.steps
            .iter()
            .map(|step| {
                patch(&mut attributes, &step.diff);
                HistoryEntry::new(step.datetime.clone(), attributes.clone())
            })
            .collect()
    }
}
