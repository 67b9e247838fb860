//! Adaptive timestamp compression.
//!
//! Records carry only the low 16 bits of their unix time. The high 16 bits
//! are written in a separate [`TimestampPackage`] placed immediately before a
//! record, and only when needed:
//!
//! - before the first record a [`TimestampEncoder`] writes,
//! - when the high half changed since the last timestamp package,
//! - when more than the refresh interval passed since the last one.
//!
//! # Classification
//!
//! Timestamp packages have no type tag. A [`Scanner`] classifies the four
//! bytes at its position as a timestamp package iff their `time_low` half
//! equals the `time_low` field of the record that would follow them:
//!
//! ```text
//!   candidate             following record
//! +------+-----+        +-----+------------
//! | high | low |  ==>   | low | ...
//! +------+-----+        +-----+------------
//!          \_____________/ must match
//! ```
//!
//! This is a heuristic. A record whose bytes 2..4 happen to equal the
//! `time_low` that follows it would be read as a timestamp package, so the
//! encoder stamps such records explicitly. The scanner additionally rejects
//! interpretations that run backwards in time or decode to bytes no encoder
//! writes, and resynchronizes at the next timestamp package.
//!
//! # Anchors
//!
//! Scans are only trusted from offset 0 or from a timestamp package a
//! scan from offset 0 already found. [`survey`] collects such
//! [`Anchor`]s so queries can start part way through a stream.

use crate::error::{CorruptStream, InputError};
use crate::package::{RecordShape, TIMESTAMP_PACKAGE_LEN, TimestampPackage, join_time, time_high};

/// Encode-side state deciding when a stream needs a full timestamp.
///
/// Records handed to [`TimestampEncoder::stamp`] lead with their `time_low`
/// field.
#[derive(Debug, Clone)]
pub struct TimestampEncoder {
    /// Longest allowed gap between two timestamp packages, in seconds.
    refresh_secs: u32,
    /// The last timestamp package written, if any.
    last_package: Option<TimestampPackage>,
    /// Timestamp of the last record written.
    last_record: Option<u32>,
    /// Bytes 2..4 of the last record when it was written without a package
    /// and the scanner compares them with the first bytes of the next write.
    pending_match: Option<[u8; 2]>,
}

/// Two bytes of `bytes` starting at `at`.
fn pair(bytes: &[u8], at: usize) -> Option<[u8; 2]> {
    bytes.get(at..at + 2)?.try_into().ok()
}

impl TimestampEncoder {
    /// Creates an encoder that re-emits a full timestamp at least every
    /// `refresh_secs` seconds.
    pub fn new(refresh_secs: u32) -> Self {
        Self {
            refresh_secs,
            last_package: None,
            last_record: None,
            pending_match: None,
        }
    }

    /// Creates an encoder for a stream whose last stored record is at
    /// `last_record`. Earlier timestamps are rejected and the first record
    /// is stamped.
    pub fn resume(refresh_secs: u32, last_record: Option<u32>) -> Self {
        Self {
            last_record,
            ..Self::new(refresh_secs)
        }
    }

    /// Rejects timestamps that would make the stream go backwards.
    ///
    /// # Errors
    ///
    /// Returns [`InputError::TimestampRegression`] if `timestamp` is earlier
    /// than the last record stamped by this encoder.
    pub fn check_order(&self, timestamp: u32) -> Result<(), InputError> {
        match self.last_record {
            Some(last) if timestamp < last => Err(InputError::TimestampRegression { timestamp, last }),
            _ => Ok(()),
        }
    }

    /// Whether a record at `timestamp` must be preceded by a timestamp
    /// package regardless of its bytes.
    pub fn needs_timestamp(&self, timestamp: u32) -> bool {
        match self.last_package {
            None => true,
            Some(last) => {
                last.high != time_high(timestamp)
                    || timestamp.saturating_sub(last.timestamp()) > self.refresh_secs
            }
        }
    }

    /// Registers `record`, about to be written at `timestamp`, and returns
    /// the timestamp package that must precede it, if one is due.
    ///
    /// Besides [`needs_timestamp`](Self::needs_timestamp), a package is
    /// written whenever leaving it out would let the scanner take this
    /// record, or the bare record before it, for a timestamp package.
    pub fn stamp(&mut self, timestamp: u32, record: &[u8]) -> Option<TimestampPackage> {
        let package = TimestampPackage::new(timestamp);
        // a bare record would put its time_low right after the pending bytes
        let after_pending = self.pending_match.is_some() && self.pending_match == pair(record, 0);
        let self_match = record.len() >= TIMESTAMP_PACKAGE_LEN + 2 && pair(record, 2) == pair(record, 4);
        let refresh_only = self
            .last_package
            .is_some_and(|last| last.high == package.high);

        let mut due = self.needs_timestamp(timestamp) || after_pending || self_match;
        if due
            && refresh_only
            && !after_pending
            && !self_match
            && self.pending_match == Some(package.high.to_le_bytes())
        {
            // the package itself would complete the pending match; refresh
            // on the next record instead
            due = false;
        }

        self.last_record = Some(timestamp);
        self.pending_match = if due || record.len() > TIMESTAMP_PACKAGE_LEN {
            None
        } else {
            pair(record, 2)
        };
        if due {
            self.last_package = Some(package);
            Some(package)
        } else {
            None
        }
    }

    /// Forgets the last emitted package so the next record gets a fresh one.
    pub fn reset(&mut self) {
        self.last_package = None;
    }

    /// Timestamp of the last record stamped.
    pub fn last_record(&self) -> Option<u32> {
        self.last_record
    }
}

/// A record recovered from a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannedRecord<'a> {
    /// Byte offset of the record (after any timestamp package).
    pub offset: usize,
    /// Reconstructed unix timestamp.
    pub timestamp: u32,
    /// The record bytes, exactly `shape.len` long.
    pub bytes: &'a [u8],
    /// Whether a timestamp package directly preceded the record.
    pub stamped: bool,
}

/// Decode-side iterator over the records of one stream.
///
/// Carries the last seen high half forward and reports classification
/// problems through [`Scanner::warnings`] instead of stopping at the first
/// one. Records come out with non-decreasing timestamps.
#[derive(Debug)]
pub struct Scanner<'a> {
    data: &'a [u8],
    shape: RecordShape,
    pos: usize,
    time_high: Option<u16>,
    last: Option<u32>,
    warnings: Vec<CorruptStream>,
    done: bool,
}

impl<'a> Scanner<'a> {
    /// Starts scanning `data` from its first byte.
    pub fn new(data: &'a [u8], shape: RecordShape) -> Self {
        Self {
            data,
            shape,
            pos: 0,
            time_high: None,
            last: None,
            warnings: Vec::new(),
            done: false,
        }
    }

    /// Problems found so far.
    pub fn warnings(&self) -> &[CorruptStream] {
        &self.warnings
    }

    /// Consumes the scanner, returning the problems found.
    pub fn into_warnings(self) -> Vec<CorruptStream> {
        self.warnings
    }

    /// Classifies the bytes at `at`. `None` when the look-ahead window runs
    /// past the end of the stream.
    fn is_timestamp_at(&self, at: usize) -> Option<bool> {
        let record_at = at + TIMESTAMP_PACKAGE_LEN;
        if record_at + self.shape.len > self.data.len() {
            return None;
        }
        let candidate_low = &self.data[at + 2..at + 4];
        let low_at = record_at + self.shape.time_low_offset;
        Some(candidate_low == &self.data[low_at..low_at + 2])
    }

    /// High half of a timestamp package at `at` whose record passes
    /// [`accepts`](Self::accepts).
    fn timestamp_at(&self, at: usize) -> Option<u16> {
        if self.is_timestamp_at(at) != Some(true) {
            return None;
        }
        let high = u16::from_le_bytes([self.data[at], self.data[at + 1]]);
        self.accepts(high, at + TIMESTAMP_PACKAGE_LEN).then_some(high)
    }

    /// Whether the record at `record_at`, read with `high`, keeps the stream
    /// in order and holds bytes an encoder could have written.
    fn accepts(&self, high: u16, record_at: usize) -> bool {
        let record = &self.data[record_at..record_at + self.shape.len];
        let timestamp = join_time(high, self.shape.time_low(record));
        self.last.is_none_or(|last| timestamp >= last) && (self.shape.plausible)(record)
    }

    /// Skips forward one byte at a time until a usable timestamp package is
    /// found, reporting the skipped bytes through `warning`.
    fn resync(&mut self, warning: fn(usize, usize) -> CorruptStream) {
        let start = self.pos;
        let mut at = start + 1;
        let found = loop {
            match self.is_timestamp_at(at) {
                None => break None,
                Some(true) if self.timestamp_at(at).is_some() => break Some(at),
                Some(_) => at += 1,
            }
        };
        let skipped = found.unwrap_or(self.data.len()) - start;
        self.warnings.push(warning(start, skipped));
        match found {
            Some(at) => self.pos = at,
            None => self.done = true,
        }
    }

    fn take_record(&mut self, high: u16, stamped: bool) -> ScannedRecord<'a> {
        let offset = self.pos;
        let bytes = &self.data[offset..offset + self.shape.len];
        let timestamp = join_time(high, self.shape.time_low(bytes));
        self.pos += self.shape.len;
        self.last = Some(timestamp);
        ScannedRecord {
            offset,
            timestamp,
            bytes,
            stamped,
        }
    }
}

impl<'a> Iterator for Scanner<'a> {
    type Item = ScannedRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.pos >= self.data.len() {
                return None;
            }

            if let Some(high) = self.timestamp_at(self.pos) {
                self.time_high = Some(high);
                self.pos += TIMESTAMP_PACKAGE_LEN;
                return Some(self.take_record(high, true));
            }

            let remaining = self.data.len() - self.pos;
            if remaining < self.shape.len {
                self.warnings.push(CorruptStream::Truncated {
                    offset: self.pos,
                    remaining,
                });
                self.done = true;
                return None;
            }

            match self.time_high {
                Some(high) if self.accepts(high, self.pos) => return Some(self.take_record(high, false)),
                Some(_) => self.resync(|offset, skipped| CorruptStream::Misaligned { offset, skipped }),
                None => self.resync(|offset, skipped| CorruptStream::MissingTimestamp { offset, skipped }),
            }
        }
    }
}

/// Minimum distance in bytes between two anchors kept by [`survey`].
pub const ANCHOR_SPACING: u64 = 4 * 1024;

/// A timestamp package a scan can start from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    /// Offset of the package in its stream.
    pub offset: u64,
    /// Timestamp of the record following the package.
    pub timestamp: u32,
}

/// What a full scan learned about a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Survey {
    /// Length of the stream without its torn tail.
    pub clean_len: usize,
    /// Timestamp of the last record before `clean_len`.
    pub last: Option<u32>,
    /// Timestamp packages at least [`ANCHOR_SPACING`] bytes apart, in
    /// stream order.
    pub anchors: Vec<Anchor>,
}

/// Whether a bare record at the end of a stream may be the timestamp
/// package of a torn frame. Its first half matches the current high half
/// and its second half the bytes after it, as far as they go.
fn looks_like_torn_package(data: &[u8], record: &ScannedRecord<'_>) -> bool {
    let at = record.offset;
    let high = u16::from_le_bytes([data[at], data[at + 1]]);
    let carried = time_high(record.timestamp);
    let follows = data.get(at + TIMESTAMP_PACKAGE_LEN..).unwrap_or_default();
    (high == carried || high == carried.wrapping_add(1))
        && data[at + 2..at + 4].iter().zip(follows).all(|(a, b)| a == b)
}

/// Scans a whole stream for its anchors and the end of its last complete
/// frame.
///
/// A stream that stops part way through a frame, as left by a crash or a
/// failed write, has `clean_len` below `data.len()`. Bytes the scanner had
/// to skip up to the very end after a good record are cut too. A bare last
/// record that looks like the package of a torn frame is cut with them.
pub fn survey(data: &[u8], shape: RecordShape) -> Survey {
    let mut scanner = Scanner::new(data, shape);
    let mut anchors: Vec<Anchor> = Vec::new();
    let mut last: Option<ScannedRecord<'_>> = None;
    let mut before_last = None;

    for record in scanner.by_ref() {
        if record.stamped {
            let offset = (record.offset - TIMESTAMP_PACKAGE_LEN) as u64;
            if anchors.last().is_none_or(|a| offset - a.offset >= ANCHOR_SPACING) {
                anchors.push(Anchor {
                    offset,
                    timestamp: record.timestamp,
                });
            }
        }
        before_last = last.map(|r| r.timestamp);
        last = Some(record);
    }

    let (clean_len, last) = match scanner.warnings().last() {
        Some(&CorruptStream::Truncated { offset, .. }) => match last {
            Some(record)
                if !record.stamped
                    && record.offset + TIMESTAMP_PACKAGE_LEN + shape.len > data.len()
                    && looks_like_torn_package(data, &record) =>
            {
                (record.offset, before_last)
            }
            _ => (offset, last.map(|r| r.timestamp)),
        },
        Some(&CorruptStream::Misaligned { offset, skipped }) if offset + skipped == data.len() => {
            (offset, last.map(|r| r.timestamp))
        }
        _ => (data.len(), last.map(|r| r.timestamp)),
    };
    anchors.retain(|a| a.offset < clean_len as u64);

    Survey {
        clean_len,
        last,
        anchors,
    }
}
