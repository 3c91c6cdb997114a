//! # Snapshot Files
//!
//! Input files hold one JSON object per line. Three fields locate the
//! record (by default `begin`, `end` and `datetime`); every other field is
//! an attribute. Field names are configurable through [`ReaderConfig`].
//!
//! ```text
//! {"begin": "1.0.0.0", "end": "1.0.0.255", "datetime": "2010-01-01", "cc": "AU"}
//! {"begin": "1.0.1.0", "end": "1.0.3.255", "datetime": "2010-01-01", "cc": "CN"}
//! ```
//!
//! Files whose name ends in `.zst` are decompressed on the fly. Blank lines
//! are skipped; every error carries the 1-based line number it occurred on.


use std::fs::File;
use std::io::{self, BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::address::{Address, AddressError};
use crate::loader::Snapshot;

/// Extension marking zstd-compressed input.
const ZSTD_EXTENSION: &str = "zst";

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ReaderError {
    /// The input file could not be opened.
    #[error("cannot open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Reading or decompressing failed.
    #[error("line {line}: read error: {source}")]
    Io {
        line: usize,
        #[source]
        source: io::Error,
    },

    #[error("line {line}: invalid JSON: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("line {line}: document is not a JSON object")]
    NotAnObject { line: usize },

    #[error("line {line}: missing field {field:?}")]
    MissingField { line: usize, field: String },

    /// A locating field is present but not a string.
    #[error("line {line}: field {field:?} must be a string")]
    InvalidField { line: usize, field: String },

    #[error("line {line}: field {field:?}: {source}")]
    InvalidAddress {
        line: usize,
        field: String,
        #[source]
        source: AddressError,
    },
}

impl ReaderError {
    /// Line the error refers to, if any.
    pub fn line(&self) -> Option<usize> {
        match self {
            ReaderError::Open { .. } => None,
            ReaderError::Io { line, .. }
            | ReaderError::Json { line, .. }
            | ReaderError::NotAnObject { line }
            | ReaderError::MissingField { line, .. }
            | ReaderError::InvalidField { line, .. }
            | ReaderError::InvalidAddress { line, .. } => Some(*line),
        }
    }

    /// `true` for errors confined to one well-formed record, which a load
    /// may skip without losing track of the file.
    pub fn is_record_error(&self) -> bool {
        matches!(self, ReaderError::InvalidAddress { .. })
    }
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Names of the fields locating a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Default: `"begin"`.
    pub begin_field: String,
    /// Default: `"end"`.
    pub end_field: String,
    /// Default: `"datetime"`.
    pub datetime_field: String,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            begin_field: "begin".into(),
            end_field: "end".into(),
            datetime_field: "datetime".into(),
        }
    }
}

impl ReaderConfig {
    /// Checks that the three field names are non-empty and distinct.
    pub fn validate(&self) -> Result<(), String> {
        let fields = [&self.begin_field, &self.end_field, &self.datetime_field];
        if fields.iter().any(|f| f.is_empty()) {
            return Err("reader field names must not be empty".into());
        }
        if fields[0] == fields[1] || fields[0] == fields[2] || fields[1] == fields[2] {
            return Err(format!(
                "reader field names must be distinct (begin={:?}, end={:?}, datetime={:?})",
                fields[0], fields[1], fields[2]
            ));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

/// Boxed input stream of an opened file.
pub type FileInput = Box<dyn BufRead + Send>;

/// Iterator over the records of a snapshot file.
pub struct SnapshotReader<R> {
    lines: Lines<R>,
    config: ReaderConfig,
    line: usize,
    failed: bool,
}

impl SnapshotReader<FileInput> {
    /// Opens `path`, decompressing it when the name ends in `.zst`.
    pub fn open(path: impl AsRef<Path>, config: ReaderConfig) -> Result<Self, ReaderError> {
        let path = path.as_ref();
        let open_err = |source| ReaderError::Open {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(open_err)?;

        let compressed = path.extension().is_some_and(|ext| ext == ZSTD_EXTENSION);
        let input: FileInput = if compressed {
            let decoder = zstd::Decoder::new(file).map_err(open_err)?;
            Box::new(BufReader::new(decoder))
        } else {
            Box::new(BufReader::new(file))
        };

        debug!(path = %path.display(), compressed, "snapshot file opened");
        Ok(Self::from_reader(input, config))
    }
}

impl<R: BufRead> SnapshotReader<R> {
    /// Reads records from an already opened stream.
    pub fn from_reader(input: R, config: ReaderConfig) -> Self {
        Self {
            lines: input.lines(),
            config,
            line: 0,
            failed: false,
        }
    }

    /// Number of lines consumed so far.
    pub fn line(&self) -> usize {
        self.line
    }

    fn parse(&self, text: &str) -> Result<Snapshot, ReaderError> {
        let line = self.line;
        let doc: Value =
            serde_json::from_str(text).map_err(|source| ReaderError::Json { line, source })?;
        let Value::Object(mut doc) = doc else {
            return Err(ReaderError::NotAnObject { line });
        };

        let begin = take_address(&mut doc, &self.config.begin_field, line)?;
        let end = take_address(&mut doc, &self.config.end_field, line)?;
        let datetime = take_string(&mut doc, &self.config.datetime_field, line)?;
        Ok(Snapshot::new(begin, end, datetime, doc))
    }
}

impl<R: BufRead> Iterator for SnapshotReader<R> {
    type Item = Result<Snapshot, ReaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let text = match self.lines.next()? {
                Ok(text) => text,
                Err(source) => {
                    self.failed = true;
                    return Some(Err(ReaderError::Io {
                        line: self.line + 1,
                        source,
                    }));
                }
            };
            self.line += 1;
            if text.trim().is_empty() {
                continue;
            }
            return Some(self.parse(&text));
        }
    }
}

fn take_string(
    doc: &mut Map<String, Value>,
    field: &str,
    line: usize,
) -> Result<String, ReaderError> {
    match doc.remove(field) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(ReaderError::InvalidField {
            line,
            field: field.to_string(),
        }),
        None => Err(ReaderError::MissingField {
            line,
            field: field.to_string(),
        }),
    }
}

fn take_address(
    doc: &mut Map<String, Value>,
    field: &str,
    line: usize,
) -> Result<Address, ReaderError> {
    let text = take_string(doc, field, line)?;
    Address::parse(&text).map_err(|source| ReaderError::InvalidAddress {
        line,
        field: field.to_string(),
        source,
    })
}
