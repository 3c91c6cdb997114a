//! # Incremental Loader
//!
//! Merges a time-stamped snapshot file into the stored range history
//! without discarding what is already there.
//!
//! ## Design Overview
//!
//! A load is driven through a [`LoadRun`]. Every [`Snapshot`] handed to
//! [`LoadRun::apply`] is planned against a *view*: the store's durable
//! contents overlaid with the run's own pending, not yet committed writes.
//! Later snapshots of the same file therefore see the splits made by
//! earlier ones.
//!
//! For one snapshot `[b, e]` at time `t` the planner:
//!
//! 1. Seeks the first stored range with `end >= b`.
//! 2. Walks stored ranges while `begin <= e`, splitting each into the part
//!    before `b` (old history), the overlap (history with `t` upserted) and
//!    the part after `e` (old history).
//! 3. Fills any gap between stored ranges inside `[b, e]` with a fresh
//!    single-entry range, and does the same for the tail after the last
//!    stored range.
//! 4. Optionally coalesces adjacent pieces with equal history, including
//!    the untouched neighbours directly before and after the window.
//!
//! Superseded keys are deleted and new ranges written through the overlay.
//! The overlay is flushed to the store as a single atomic batch on
//! [`LoadRun::commit`], or every `batch_size` snapshots when configured.
//!
//! ## Guarantees
//!
//! - A run that fails or is dropped before commit writes nothing beyond
//!   the batches it already flushed.
//! - [`MergeEngine::load`] checks a batched input in full before the first
//!   flush, so a malformed input writes nothing at all.
//! - Every flushed batch leaves the store fully merged up to some snapshot;
//!   readers never see a half-split range.
//! - Nothing is staged that cannot be decoded again.
//! - Query answers do not depend on whether coalescing is enabled.

mod view;

#[cfg(test)]
mod tests;

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, trace};

use crate::address::Address;
use crate::encoding::{CodecError, Encode};
use crate::history::{self, Attributes, HistoryEntry};
use crate::keys::{self, encode_key};
use crate::range::StoredRange;
use crate::store::{Store, StoreError};

use self::view::View;

// ------------------------------------------------------------------------------------------------
// Input
// ------------------------------------------------------------------------------------------------

/// One record of an input file: attributes valid for `[begin, end]` from
/// `datetime` on.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub begin: Address,
    pub end: Address,
    pub datetime: String,
    pub attributes: Attributes,
}

impl Snapshot {
    pub fn new(
        begin: Address,
        end: Address,
        datetime: impl Into<String>,
        attributes: Attributes,
    ) -> Self {
        Self {
            begin,
            end,
            datetime: datetime.into(),
            attributes,
        }
    }

    /// Checks the record's own datetime and attributes against the
    /// encoding limits.
    pub fn check_encodable(&self) -> Result<(), LoadError> {
        let mut buf = Vec::new();
        self.datetime
            .encode_to(&mut buf)
            .and_then(|()| self.attributes.encode_to(&mut buf))
            .map_err(|source| LoadError::Unencodable {
                begin: self.begin,
                end: self.end,
                source,
            })
    }

    fn entry(&self) -> HistoryEntry {
        HistoryEntry::new(self.datetime.clone(), self.attributes.clone())
    }
}

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Errors raised while loading snapshots.
#[derive(Debug, Error)]
pub enum LoadError {
    /// A record whose begin lies after its end. Only that record is rejected;
    /// the run stays usable.
    #[error("invalid range: begin {begin} is after end {end}")]
    InvalidRange { begin: Address, end: Address },

    /// A record begins before the previous record of the same run.
    #[error("out-of-order input: range beginning at {begin} follows one beginning at {previous}")]
    OutOfOrderInput { previous: Address, begin: Address },

    /// A record overlaps the previous record of the same run.
    #[error("overlapping input: range beginning at {begin} overlaps previous range ending at {previous_end}")]
    OverlapViolation { previous_end: Address, begin: Address },

    /// A stored range could not be decoded.
    #[error("corrupt stored range {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: CodecError,
    },

    /// The merged history of a record cannot be encoded, typically because an
    /// attribute exceeds an encoding limit. Only that record is rejected;
    /// nothing of it is staged and the run stays usable.
    #[error("cannot encode range {begin}-{end}: {source}")]
    Unencodable {
        begin: Address,
        end: Address,
        #[source]
        source: CodecError,
    },

    /// The backing store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

// ------------------------------------------------------------------------------------------------
// Configuration and statistics
// ------------------------------------------------------------------------------------------------

/// Tuning knobs of a load run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadConfig {
    /// Commit a batch every `n` snapshots. `None` commits once per run,
    /// making the whole run atomic.
    ///
    /// Default: `None`. Must not be `Some(0)`.
    pub batch_size: Option<usize>,

    /// Coalesce adjacent ranges whose histories are equal.
    ///
    /// Default: `true`.
    pub merge_adjacent: bool,

    /// Minimum time between two progress log lines.
    ///
    /// Default: 10 s.
    pub progress_interval: Duration,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            batch_size: None,
            merge_adjacent: true,
            progress_interval: Duration::from_secs(10),
        }
    }
}

/// Counters describing a finished (or in-flight) run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    /// Snapshots merged.
    pub snapshots: u64,
    /// Range values written (including rewrites of existing keys).
    pub ranges_written: u64,
    /// Range keys deleted.
    pub ranges_deleted: u64,
    /// Batches committed to the store.
    pub batches: u64,
}

// ------------------------------------------------------------------------------------------------
// Input order
// ------------------------------------------------------------------------------------------------

/// Tracks the previous record of a file to enforce sorted, disjoint input.
#[derive(Debug, Default, Clone, Copy)]
pub struct InputOrder {
    previous: Option<(Address, Address)>,
}

impl InputOrder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks `[begin, end]` against the previous accepted record and
    /// remembers it on success.
    pub fn check(&mut self, begin: Address, end: Address) -> Result<(), LoadError> {
        if begin > end {
            return Err(LoadError::InvalidRange { begin, end });
        }
        if let Some((prev_begin, prev_end)) = self.previous {
            if begin < prev_begin {
                return Err(LoadError::OutOfOrderInput {
                    previous: prev_begin,
                    begin,
                });
            }
            if begin <= prev_end {
                return Err(LoadError::OverlapViolation {
                    previous_end: prev_end,
                    begin,
                });
            }
        }
        self.previous = Some((begin, end));
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Merge engine
// ------------------------------------------------------------------------------------------------

/// Entry point for loading snapshots into a [`Store`].
///
/// Holds no state between runs; every [`LoadRun`] starts from the store's
/// current durable contents.
#[derive(Debug)]
pub struct MergeEngine<'s, S: Store + ?Sized> {
    store: &'s S,
    config: LoadConfig,
}

impl<'s, S: Store + ?Sized> MergeEngine<'s, S> {
    pub fn new(store: &'s S, config: LoadConfig) -> Self {
        Self { store, config }
    }

    /// Starts a new load unit (one input file).
    pub fn begin(&self) -> LoadRun<'s, S> {
        LoadRun {
            view: View::new(self.store),
            config: self.config,
            order: InputOrder::new(),
            stats: LoadStats::default(),
            since_flush: 0,
            progress: Progress::new(self.config.progress_interval),
        }
    }

    /// Loads a complete, sorted, disjoint sequence of snapshots as one run.
    ///
    /// Any error aborts the run and nothing is written. With a
    /// `batch_size`, the input is collected and checked for order, overlap
    /// and encodability before the first batch is flushed.
    pub fn load<I>(&self, snapshots: I) -> Result<LoadStats, LoadError>
    where
        I: IntoIterator<Item = Snapshot>,
    {
        if self.config.batch_size.is_none() {
            return self.run(snapshots);
        }

        let snapshots: Vec<Snapshot> = snapshots.into_iter().collect();
        let mut order = InputOrder::new();
        for snapshot in &snapshots {
            order.check(snapshot.begin, snapshot.end)?;
            snapshot.check_encodable()?;
        }
        self.run(snapshots)
    }

    fn run<I>(&self, snapshots: I) -> Result<LoadStats, LoadError>
    where
        I: IntoIterator<Item = Snapshot>,
    {
        let mut run = self.begin();
        for snapshot in snapshots {
            run.apply(snapshot)?;
        }
        run.commit()
    }
}

/// An in-progress load unit.
///
/// Dropping a run without calling [`LoadRun::commit`] discards every write
/// not yet flushed.
pub struct LoadRun<'s, S: Store + ?Sized> {
    view: View<'s, S>,
    config: LoadConfig,
    order: InputOrder,
    stats: LoadStats,
    since_flush: usize,
    progress: Progress,
}

impl<S: Store + ?Sized> LoadRun<'_, S> {
    /// Merges one snapshot into the pending state.
    ///
    /// # Errors
    ///
    /// - [`LoadError::InvalidRange`] / [`LoadError::Unencodable`]: the
    ///   snapshot is rejected, the run is unaffected and may continue.
    /// - [`LoadError::OutOfOrderInput`] / [`LoadError::OverlapViolation`]:
    ///   the input file is malformed; the run must be abandoned.
    /// - Corrupt stored ranges and store failures.
    pub fn apply(&mut self, snapshot: Snapshot) -> Result<(), LoadError> {
        self.order.check(snapshot.begin, snapshot.end)?;
        snapshot.check_encodable()?;

        let plan = plan(&self.view, &snapshot, self.config.merge_adjacent)?;
        debug!(
            begin = %snapshot.begin,
            end = %snapshot.end,
            datetime = %snapshot.datetime,
            superseded = plan.superseded.len(),
            ranges = plan.ranges.len(),
            "snapshot planned"
        );
        self.stage(plan)?;

        self.stats.snapshots += 1;
        self.since_flush += 1;
        self.progress.tick(&self.stats, snapshot.end);

        if let Some(limit) = self.config.batch_size {
            if self.since_flush >= limit {
                self.flush()?;
            }
        }
        Ok(())
    }

    /// Flushes pending writes and finishes the run.
    pub fn commit(mut self) -> Result<LoadStats, LoadError> {
        self.flush()?;
        info!(
            snapshots = self.stats.snapshots,
            written = self.stats.ranges_written,
            deleted = self.stats.ranges_deleted,
            batches = self.stats.batches,
            "load committed"
        );
        Ok(self.stats)
    }

    /// Counters so far.
    pub fn stats(&self) -> LoadStats {
        self.stats
    }

    fn stage(&mut self, plan: Plan) -> Result<(), LoadError> {
        // Encode everything before touching the overlay.
        let mut writes = Vec::with_capacity(plan.ranges.len());
        for range in &plan.ranges {
            let value = range
                .encode_value()
                .map_err(|source| LoadError::Unencodable {
                    begin: range.begin,
                    end: range.end,
                    source,
                })?;
            writes.push((range.key(), value));
        }

        for end in plan.superseded {
            if plan.ranges.iter().any(|r| r.end == end) {
                continue;
            }
            self.view.delete(encode_key(end).to_vec());
            self.stats.ranges_deleted += 1;
        }
        for (key, value) in writes {
            self.view.put(key.to_vec(), value);
            self.stats.ranges_written += 1;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), LoadError> {
        let batch = self.view.take_batch();
        self.since_flush = 0;
        if batch.is_empty() {
            return Ok(());
        }
        let ops = batch.len();
        self.view.store().write_batch(batch)?;
        self.stats.batches += 1;
        info!(ops, batches = self.stats.batches, "batch committed");
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Planning
// ------------------------------------------------------------------------------------------------

/// Result of merging one snapshot: keys to drop and ranges to write.
#[derive(Debug, Default)]
struct Plan {
    superseded: Vec<Address>,
    ranges: Vec<StoredRange>,
}

fn decode_stored(key: &[u8], value: &[u8]) -> Result<StoredRange, LoadError> {
    StoredRange::from_kv(key, value).map_err(|source| LoadError::Corrupt {
        key: keys::describe_key(key),
        source,
    })
}

fn plan<S: Store + ?Sized>(
    view: &View<'_, S>,
    snapshot: &Snapshot,
    merge_adjacent: bool,
) -> Result<Plan, LoadError> {
    let entry = snapshot.entry();
    let mut plan = Plan::default();

    // First address of the snapshot not yet covered by a planned range.
    let mut uncovered = Some(snapshot.begin);

    for item in view.seek(&encode_key(snapshot.begin))? {
        let Some(pos) = uncovered else { break };
        let (key, value) = item?;
        let existing = decode_stored(&key, &value)?;
        if existing.begin > snapshot.end {
            break;
        }
        trace!(begin = %existing.begin, end = %existing.end, "overlapping range");

        if existing.begin > pos {
            // Gap up to the next stored range; `existing.begin > pos >= 0`.
            let gap_end = Address::new(existing.begin.value() - 1);
            plan.ranges.push(StoredRange::fresh(pos, gap_end, entry.clone()));
        }

        plan.superseded.push(existing.end);

        if existing.begin < snapshot.begin {
            plan.ranges.push(StoredRange {
                begin: existing.begin,
                end: Address::new(snapshot.begin.value() - 1),
                history: existing.history.clone(),
            });
        }

        let mut merged = existing.history.clone();
        history::upsert_entry(&mut merged, entry.clone());
        plan.ranges.push(StoredRange {
            begin: existing.begin.max(snapshot.begin),
            end: existing.end.min(snapshot.end),
            history: merged,
        });

        if existing.end > snapshot.end {
            plan.ranges.push(StoredRange {
                begin: Address::new(snapshot.end.value() + 1),
                end: existing.end,
                history: existing.history,
            });
        }

        if existing.end >= snapshot.end {
            uncovered = None;
            break;
        }
        uncovered = existing.end.successor();
    }

    if let Some(pos) = uncovered {
        plan.ranges.push(StoredRange::fresh(pos, snapshot.end, entry));
    }

    if merge_adjacent {
        plan.ranges = coalesce(std::mem::take(&mut plan.ranges));
        absorb_neighbours(view, &mut plan)?;
    }
    Ok(plan)
}

/// Merges consecutive, touching ranges with equal history.
fn coalesce(ranges: Vec<StoredRange>) -> Vec<StoredRange> {
    let mut out: Vec<StoredRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match out.last_mut() {
            Some(last)
                if last.end.successor() == Some(range.begin) && last.history == range.history =>
            {
                last.end = range.end;
            }
            _ => out.push(range),
        }
    }
    out
}

/// Extends the first and last planned ranges over untouched stored
/// neighbours that carry the same history.
fn absorb_neighbours<S: Store + ?Sized>(
    view: &View<'_, S>,
    plan: &mut Plan,
) -> Result<(), LoadError> {
    if let Some(first) = plan.ranges.first_mut() {
        if let Some(prev_end) = first.begin.predecessor() {
            let key = encode_key(prev_end);
            if let Some(value) = view.get(&key)? {
                let prev = decode_stored(&key, &value)?;
                if prev.history == first.history {
                    first.begin = prev.begin;
                    plan.superseded.push(prev.end);
                }
            }
        }
    }

    if let Some(last) = plan.ranges.last_mut() {
        if let Some(next_begin) = last.end.successor() {
            if let Some(item) = view.seek(&encode_key(next_begin))?.next() {
                let (key, value) = item?;
                let next = decode_stored(&key, &value)?;
                if next.begin == next_begin && next.history == last.history {
                    last.end = next.end;
                    plan.superseded.push(next.end);
                }
            }
        }
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Progress reporting
// ------------------------------------------------------------------------------------------------

/// Rate-limited progress logging for long loads.
struct Progress {
    interval: Duration,
    last: Instant,
}

impl Progress {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
        }
    }

    fn tick(&mut self, stats: &LoadStats, position: Address) {
        if self.last.elapsed() >= self.interval {
            info!(
                snapshots = stats.snapshots,
                written = stats.ranges_written,
                position = %position,
                "load progress"
            );
            self.last = Instant::now();
        }
    }
}
