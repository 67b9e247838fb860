//! Error types for the sensorlog storage engine.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::store::StreamId;

/// The main error type for all sensorlog operations.
///
/// Each variant wraps a more specific error for one concern: opening the
/// store, writing to a stream, decoding a stream, validating caller input,
/// or validating a query.
#[derive(Error, Debug)]
pub enum SensorLogError {
    /// The store or one of its streams could not be initialized.
    #[error("initialization failed: {0}")]
    Init(#[from] InitError),

    /// A stream could not persist or read its bytes.
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    /// A stream could not be decoded.
    #[error("corrupt stream: {0}")]
    Corrupt(#[from] CorruptStream),

    /// The caller handed over a sample that does not fit its shape.
    #[error("malformed input: {0}")]
    Input(#[from] InputError),

    /// A query was rejected before touching storage.
    #[error("query error: {0}")]
    Query(#[from] QueryError),
}

/// Errors raised while opening a store. These are fatal: the store cannot
/// be constructed.
#[derive(Error, Debug)]
pub enum InitError {
    /// The store directory could not be created.
    #[error("failed to create store directory '{}': {source}", path.display())]
    CreateDirectory {
        /// The directory that could not be created.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A stream log file could not be opened or created.
    #[error("failed to open log file '{}': {source}", path.display())]
    OpenLog {
        /// The log file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The layout file could not be read or written.
    #[error("failed to access layout file '{}': {source}", path.display())]
    LayoutIo {
        /// The layout file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The layout file is not valid JSON or could not be serialized.
    #[error("invalid layout file '{}': {source}", path.display())]
    LayoutParse {
        /// The layout file path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The store on disk was written with a different record layout.
    #[error("record layout mismatch in '{}': {reason}", path.display())]
    LayoutMismatch {
        /// The layout file path.
        path: PathBuf,
        /// Which part of the layout differs.
        reason: String,
    },

    /// The configuration file could not be read.
    #[error("failed to read config '{}': {source}", path.display())]
    ConfigIo {
        /// The configuration file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON.
    #[error("failed to parse config '{}': {source}", path.display())]
    ConfigParse {
        /// The configuration file path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A configuration value is out of range.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Why the configuration was rejected.
        reason: String,
    },
}

/// Errors raised while moving bytes between a stream cache and its file.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Appending to the log failed twice in a row.
    #[error("failed to append {len} bytes to {stream} log '{}': {source}", path.display())]
    WriteFailed {
        /// The stream whose log failed.
        stream: StreamId,
        /// The log file path.
        path: PathBuf,
        /// Bytes that were pending when the write gave up.
        len: usize,
        /// The error from the retry.
        #[source]
        source: std::io::Error,
    },

    /// Syncing the log to disk failed.
    #[error("failed to sync {stream} log '{}': {source}", path.display())]
    SyncFailed {
        /// The stream whose log failed.
        stream: StreamId,
        /// The log file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Reading the on-disk part of a stream failed.
    #[error("failed to read {stream} log '{}' at offset {offset}: {source}", path.display())]
    ReadFailed {
        /// The stream being read.
        stream: StreamId,
        /// The log file path.
        path: PathBuf,
        /// The byte offset of the read.
        offset: u64,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An earlier write failure stopped this stream; nothing more is logged to it.
    #[error("{stream} stream is stopped after an earlier write failure")]
    Poisoned {
        /// The stopped stream.
        stream: StreamId,
    },
}

/// Decode-time failures while classifying packages in a stream.
///
/// The scanner recovers from these locally, so they usually arrive as
/// warnings attached to a query result instead of as an `Err`.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CorruptStream {
    /// A record was found before any timestamp package established the
    /// high half of the time. The scanner skipped ahead to the next
    /// position that classifies as a timestamp package.
    #[error("record at offset {offset} has no preceding timestamp package ({skipped} bytes skipped)")]
    MissingTimestamp {
        /// Offset where the unanchored record started.
        offset: usize,
        /// Bytes discarded while resynchronizing.
        skipped: usize,
    },

    /// A record read with the current high half went backwards in time or
    /// held bytes no encoder writes. The scanner skipped ahead to the next
    /// usable timestamp package.
    #[error("record at offset {offset} is out of order or malformed ({skipped} bytes skipped)")]
    Misaligned {
        /// Offset where the rejected record started.
        offset: usize,
        /// Bytes discarded while resynchronizing.
        skipped: usize,
    },

    /// The stream ended in the middle of a package or its look-ahead window.
    #[error("stream truncated at offset {offset}: {remaining} trailing bytes")]
    Truncated {
        /// Offset of the incomplete package.
        offset: usize,
        /// Bytes left after that offset.
        remaining: usize,
    },
}

impl CorruptStream {
    /// Shifts the reported offset by `base`, for scans that started part
    /// way into a stream.
    #[must_use]
    pub fn offset_by(self, base: usize) -> Self {
        match self {
            Self::MissingTimestamp { offset, skipped } => Self::MissingTimestamp {
                offset: offset.saturating_add(base),
                skipped,
            },
            Self::Misaligned { offset, skipped } => Self::Misaligned {
                offset: offset.saturating_add(base),
                skipped,
            },
            Self::Truncated { offset, remaining } => Self::Truncated {
                offset: offset.saturating_add(base),
                remaining,
            },
        }
    }
}

/// Caller-supplied samples that cannot be encoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    /// The raw sample has the wrong number of bytes.
    #[error("{kind} sample must be {expected} bytes, got {actual}")]
    WrongLength {
        /// Which kind of sample was malformed.
        kind: &'static str,
        /// The required length.
        expected: usize,
        /// The supplied length.
        actual: usize,
    },

    /// A field of the slow bitstream is outside its encodable range.
    #[error("{field} value {value} exceeds maximum {max}")]
    FieldOutOfRange {
        /// The field name.
        field: &'static str,
        /// The decoded raw value.
        value: u16,
        /// The largest value the field may carry.
        max: u16,
    },

    /// The timestamp is earlier than the last record stored for the stream.
    #[error("timestamp {timestamp} is earlier than last stored {last}")]
    TimestampRegression {
        /// The rejected timestamp.
        timestamp: u32,
        /// The most recent stored timestamp.
        last: u32,
    },
}

/// Errors that reject a query before any decoding happens.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The time range is inverted.
    #[error("invalid time range: start {start} > stop {stop}")]
    InvalidTimeRange {
        /// The start time.
        start: u32,
        /// The stop time.
        stop: u32,
    },

    /// A resolution cap of zero would always return nothing.
    #[error("resolution cap must be at least 1")]
    ZeroResolution,

    /// The channel name is not known.
    #[error("unknown channel '{name}'")]
    UnknownChannel {
        /// The name that failed to parse.
        name: String,
    },
}

/// Type alias for `Result<T, SensorLogError>`.
pub type Result<T> = std::result::Result<T, SensorLogError>;
