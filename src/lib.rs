//! # Whip
//!
//! Time-travelling lookups for IP address ranges. Whip merges successive,
//! time-stamped snapshot files describing address ranges (geolocation,
//! ownership, anything keyed by IP) into a single range-partitioned history
//! and answers "what was true for this address at that time" with one seek
//! into an ordered key-value store.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use whip::{Whip, WhipConfig};
//!
//! let whip = Whip::open("/tmp/whip.redb", WhipConfig::default()).unwrap();
//!
//! // One JSON object per line: {"begin": .., "end": .., "datetime": .., ...}
//! whip.load_file("geo-2010-01-01.jsonl.zst").unwrap();
//! whip.load_file("geo-2011-01-01.jsonl.zst").unwrap();
//!
//! let now = whip.latest("1.2.3.4").unwrap();
//! let then = whip.at_time("1.2.3.4", "2010-06-01").unwrap();
//! let all = whip.history("1.2.3.4").unwrap();
//! ```
//!
//! ## Features
//!
//! - **Unified address space**: IPv4 and IPv6 share one ordered key space.
//! - **Incremental loads**: new snapshots split, extend and fill stored
//!   ranges without losing older history, in any load order.
//! - **Compact history**: a base entry plus forward diffs per range,
//!   CRC32-checked.
//! - **Atomic loads**: a file is committed as one batch, or in fully merged
//!   batches of a configurable size.
//! - **Pluggable storage**: any ordered store implementing [`Store`];
//!   `redb` and in-memory adapters are included.

pub mod address;
pub mod encoding;
pub mod history;
pub mod keys;
pub mod loader;
pub mod query;
pub mod range;
pub mod reader;
pub mod store;

pub use address::{Address, AddressError, Family};
pub use history::{Attributes, EncodedHistory, HistoryEntry};
pub use loader::{InputOrder, LoadConfig, LoadError, LoadRun, LoadStats, MergeEngine, Snapshot};
pub use query::{QueryEngine, QueryError};
pub use reader::{ReaderConfig, ReaderError, SnapshotReader};
pub use store::{MemoryStore, RedbStore, Store, StoreError, WriteBatch};

use std::borrow::Borrow;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;

use thiserror::Error;
use tracing::{debug, info, warn};

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Whip`] instance.
///
/// All fields have defaults via [`WhipConfig::default()`]. The
/// configuration is validated when passed to [`Whip::open`] or
/// [`Whip::with_store`].
///
/// # Example
///
/// ```rust
/// use whip::{LoadConfig, WhipConfig};
///
/// // Commit every 10 000 records instead of once per file.
/// let config = WhipConfig {
///     load: LoadConfig {
///         batch_size: Some(10_000),
///         ..LoadConfig::default()
///     },
///     ..WhipConfig::default()
/// };
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct WhipConfig {
    /// Merge behaviour and commit granularity.
    pub load: LoadConfig,

    /// Field names of input documents.
    pub reader: ReaderConfig,

    /// Number of parsed records buffered between the file reader thread
    /// and the loader.
    ///
    /// Default: 1024. Must be ≥ 1.
    pub read_ahead: usize,

    /// Skip records with unparsable addresses or `begin > end` (logging a
    /// warning) instead of aborting the load.
    ///
    /// Default: `true`.
    pub skip_invalid_records: bool,
}

impl Default for WhipConfig {
    fn default() -> Self {
        Self {
            load: LoadConfig::default(),
            reader: ReaderConfig::default(),
            read_ahead: 1024,
            skip_invalid_records: true,
        }
    }
}

impl WhipConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), WhipError> {
        if self.load.batch_size == Some(0) {
            return Err(WhipError::InvalidConfig(
                "batch_size must be >= 1 when set".into(),
            ));
        }
        if self.read_ahead < 1 {
            return Err(WhipError::InvalidConfig("read_ahead must be >= 1".into()));
        }
        self.reader.validate().map_err(WhipError::InvalidConfig)
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Whip`] operations.
#[derive(Debug, Error)]
pub enum WhipError {
    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A query address could not be parsed.
    #[error(transparent)]
    InvalidAddress(#[from] AddressError),

    #[error("load failed: {0}")]
    Load(#[from] LoadError),

    #[error("query failed: {0}")]
    Query(#[from] QueryError),

    #[error("input error: {0}")]
    Reader(#[from] ReaderError),

    #[error("{0}")]
    Store(#[from] StoreError),

    /// The reader thread could not be started or panicked.
    #[error("internal error: {0}")]
    Internal(String),
}

impl WhipError {
    /// `true` for failures confined to a single input record.
    fn is_record_error(&self) -> bool {
        match self {
            WhipError::Load(LoadError::InvalidRange { .. } | LoadError::Unencodable { .. }) => {
                true
            }
            WhipError::Reader(e) => e.is_record_error(),
            _ => false,
        }
    }
}

/// Outcome of a load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub stats: LoadStats,
    /// Records skipped because of an invalid address, an inverted range or
    /// attributes beyond the encoding limits.
    pub rejected: u64,
}

// ------------------------------------------------------------------------------------------------
// Whip handle
// ------------------------------------------------------------------------------------------------

/// The main Whip handle.
///
/// # Thread safety
///
/// `Whip` is `Send + Sync` whenever its store is. Queries run concurrently
/// with each other and with a load; they observe the store as of the last
/// committed batch. Loads are serialized: a second `load`/`load_file`
/// call waits for the first to finish.
pub struct Whip<S: Store = RedbStore> {
    store: S,
    config: WhipConfig,
    load_lock: Mutex<()>,
}

impl<S: Store + std::fmt::Debug> std::fmt::Debug for Whip<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Whip")
            .field("store", &self.store)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Whip<RedbStore> {
    /// Opens (or creates) a redb-backed index at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`WhipError::InvalidConfig`] if any configuration parameter
    /// is out of range, or [`WhipError::Store`] if the database cannot be
    /// opened.
    pub fn open(path: impl AsRef<Path>, config: WhipConfig) -> Result<Self, WhipError> {
        config.validate()?;
        let store = RedbStore::open(path)?;
        Self::with_store(store, config)
    }
}

impl<S: Store> Whip<S> {
    /// Wraps an existing store.
    pub fn with_store(store: S, config: WhipConfig) -> Result<Self, WhipError> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            load_lock: Mutex::new(()),
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &WhipConfig {
        &self.config
    }

    // --------------------------------------------------------------------------------------------
    // Loading
    // --------------------------------------------------------------------------------------------

    /// Loads a snapshot file (JSON lines, optionally `.zst` compressed).
    ///
    /// Records are parsed on a separate reader thread and handed over
    /// through a bounded channel of [`WhipConfig::read_ahead`] records.
    ///
    /// When [`LoadConfig::batch_size`] is set, the file is first read once
    /// to check record order and overlap, so a malformed file is rejected
    /// before any batch is committed.
    ///
    /// # Errors
    ///
    /// Unordered or overlapping records, unreadable input and (unless
    /// [`WhipConfig::skip_invalid_records`] is set) invalid records abort
    /// the load.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<LoadReport, WhipError> {
        let path = path.as_ref();
        let _guard = self.lock_loads();
        info!(path = %path.display(), "loading snapshot file");

        if self.config.load.batch_size.is_some() {
            self.validate_file(path)?;
        }

        let reader = SnapshotReader::open(path, self.config.reader.clone())?;
        let (tx, rx) = crossbeam::channel::bounded(self.config.read_ahead);

        thread::scope(|scope| {
            let producer = thread::Builder::new()
                .name("whip-reader".into())
                .spawn_scoped(scope, move || {
                    for record in reader {
                        // The loader hung up after an error.
                        if tx.send(record).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|e| WhipError::Internal(format!("cannot spawn reader thread: {e}")))?;

            let result = self.apply_records(rx);

            producer
                .join()
                .map_err(|_| WhipError::Internal("reader thread panicked".into()))?;
            result
        })
    }

    /// Loads already parsed snapshots as one load unit.
    ///
    /// The snapshots must be sorted by address and must not overlap. When
    /// [`LoadConfig::batch_size`] is set they are collected and checked
    /// first, as [`Whip::load_file`] does with files.
    pub fn load<I>(&self, snapshots: I) -> Result<LoadReport, WhipError>
    where
        I: IntoIterator<Item = Snapshot>,
    {
        let _guard = self.lock_loads();
        if self.config.load.batch_size.is_none() {
            return self.apply_records(snapshots.into_iter().map(Ok));
        }

        let snapshots: Vec<Snapshot> = snapshots.into_iter().collect();
        let records = self.validate(snapshots.iter().map(Ok))?;
        debug!(records, "snapshots validated");
        self.apply_records(snapshots.into_iter().map(Ok))
    }

    fn apply_records<I>(&self, records: I) -> Result<LoadReport, WhipError>
    where
        I: IntoIterator<Item = Result<Snapshot, ReaderError>>,
    {
        let engine = MergeEngine::new(&self.store, self.config.load);
        let mut run = engine.begin();
        let mut rejected = 0;

        for record in records {
            let outcome = match record {
                Ok(snapshot) => run.apply(snapshot).map_err(WhipError::from),
                Err(e) => Err(e.into()),
            };
            match outcome {
                Ok(()) => {}
                Err(e) if self.config.skip_invalid_records && e.is_record_error() => {
                    warn!(error = %e, "record rejected");
                    rejected += 1;
                }
                Err(e) => return Err(e),
            }
        }

        let stats = run.commit()?;
        Ok(LoadReport { stats, rejected })
    }

    /// Reads `path` once, checking order and overlap without loading.
    fn validate_file(&self, path: &Path) -> Result<(), WhipError> {
        let records = self.validate(SnapshotReader::open(path, self.config.reader.clone())?)?;
        debug!(path = %path.display(), records, "snapshot file validated");
        Ok(())
    }

    /// Runs the checks of [`LoadRun::apply`] that need no store access,
    /// returning the number of records that would be merged.
    fn validate<I, B>(&self, records: I) -> Result<u64, WhipError>
    where
        I: IntoIterator<Item = Result<B, ReaderError>>,
        B: Borrow<Snapshot>,
    {
        let mut order = InputOrder::new();
        let mut accepted = 0u64;

        for record in records {
            let checked = record.map_err(WhipError::from).and_then(|snapshot| {
                let snapshot = snapshot.borrow();
                order.check(snapshot.begin, snapshot.end)?;
                snapshot.check_encodable()?;
                Ok(())
            });
            match checked {
                Ok(()) => accepted += 1,
                Err(e) if self.config.skip_invalid_records && e.is_record_error() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(accepted)
    }

    fn lock_loads(&self) -> MutexGuard<'_, ()> {
        self.load_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // --------------------------------------------------------------------------------------------
    // Queries
    // --------------------------------------------------------------------------------------------

    /// Current attributes of `ip`, or `None` if no range covers it.
    ///
    /// # Errors
    ///
    /// Returns [`WhipError::InvalidAddress`] if `ip` is not a valid IPv4
    /// or IPv6 address.
    pub fn latest(&self, ip: &str) -> Result<Option<Attributes>, WhipError> {
        let addr = Address::parse(ip)?;
        Ok(QueryEngine::new(&self.store).latest(addr)?)
    }

    /// Attributes of `ip` as of `datetime`.
    ///
    /// `datetime` is compared with stored timestamps as a plain string, so
    /// both must use the same sortable format.
    pub fn at_time(&self, ip: &str, datetime: &str) -> Result<Option<Attributes>, WhipError> {
        let addr = Address::parse(ip)?;
        Ok(QueryEngine::new(&self.store).at_time(addr, datetime)?)
    }

    /// Every recorded entry for `ip`, oldest first.
    pub fn history(&self, ip: &str) -> Result<Vec<HistoryEntry>, WhipError> {
        let addr = Address::parse(ip)?;
        Ok(QueryEngine::new(&self.store).history(addr)?)
    }
}
