//! Channel queries over the record store.
//!
//! A [`QueryService`] answers "values of channel C between T0 and T1". It
//! looks up the store's last anchor at or before T0, decodes records in
//! order from there and stops reading once past T1.
//! Results longer than the caller's resolution cap are thinned by uniform
//! stride selection.
//!
//! Decoding problems do not fail a query. The scanner skips what it cannot
//! classify and the warnings travel with the [`QueryResult`]:
//!
//! ```rust,no_run
//! # use sensorlog::{Channel, QueryService, RecordStore, StoreConfig};
//! # let store = RecordStore::open(StoreConfig::new("./data"))?;
//! let result = QueryService::new(&store).fetch(Channel::Co2, 1_700_000_000, 1_700_086_400, 500)?;
//! if result.may_be_truncated() {
//!     eprintln!("warning: stream damaged, result may be incomplete");
//! }
//! for (t, ppm) in result.points() {
//!     println!("{t} {ppm}");
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use serde::Serialize;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::error::{CorruptStream, QueryError, Result};
use crate::package::{NormalPackage, RecordShape, TIMESTAMP_PACKAGE_LEN};
use crate::pir::MotionState;
use crate::slow::SlowRecord;
use crate::store::{RecordStore, StreamId};
use crate::timestamp::Scanner;

/// First read size when scanning a range; doubled until the range ends.
const READ_WINDOW: usize = 16 * 1024;

/// Points of one channel over a time range.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    x: Vec<u32>,
    y: Vec<f64>,
    matched: usize,
    requested_range: (u32, u32),
    warnings: Vec<CorruptStream>,
}

impl QueryResult {
    /// Timestamps, in stream order.
    pub fn x(&self) -> &[u32] {
        &self.x
    }

    /// Values, parallel to [`QueryResult::x`].
    pub fn y(&self) -> &[f64] {
        &self.y
    }

    /// Number of points returned.
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Whether no record fell in range.
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Number of in-range records before downsampling.
    pub fn matched(&self) -> usize {
        self.matched
    }

    /// The `(start, stop)` range that was requested.
    pub fn requested_range(&self) -> (u32, u32) {
        self.requested_range
    }

    /// Decoding problems met while scanning.
    pub fn warnings(&self) -> &[CorruptStream] {
        &self.warnings
    }

    /// Whether records may be missing because part of the stream could not
    /// be decoded.
    pub fn may_be_truncated(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// `(timestamp, value)` pairs.
    pub fn points(&self) -> impl Iterator<Item = (u32, f64)> + '_ {
        self.x.iter().copied().zip(self.y.iter().copied())
    }

    /// Splits the result into its timestamp and value vectors.
    pub fn into_parts(self) -> (Vec<u32>, Vec<f64>) {
        (self.x, self.y)
    }
}

/// Overview of a whole stream, for tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    /// Stream described.
    pub stream: StreamId,
    /// Total bytes, cached ones included.
    pub bytes: u64,
    /// Records decoded.
    pub records: usize,
    /// Timestamp of the first decoded record.
    pub first: Option<u32>,
    /// Timestamp of the last decoded record.
    pub last: Option<u32>,
    /// Decoding problems met while scanning.
    pub warnings: Vec<CorruptStream>,
}

/// Indices kept when thinning `count` points to at most `cap`.
///
/// Keeps every `N`th index with `N = ceil(count / cap)`. When the last
/// index is not on the stride it replaces the final kept one, so the last
/// point survives. A cap of one keeps only the first point.
pub fn stride_indices(count: usize, cap: usize) -> Vec<usize> {
    if count <= cap {
        return (0..count).collect();
    }
    let stride = count.div_ceil(cap.max(1));
    let mut kept: Vec<usize> = (0..count).step_by(stride).collect();
    if kept.len() > 1
        && let Some(slot) = kept.last_mut()
    {
        *slot = count - 1;
    }
    kept
}

/// In-range points decoded from one window of a stream.
struct Scan {
    x: Vec<u32>,
    y: Vec<f64>,
    warnings: Vec<CorruptStream>,
    /// End of the first record past the range, if the window reached one.
    past_stop: Option<usize>,
}

/// Decodes `channel` from `bytes` until the first record after `stop`.
fn scan_window(channel: Channel, bytes: &[u8], shape: RecordShape, start: u32, stop: u32) -> Scan {
    let mut scanner = Scanner::new(bytes, shape);
    let mut motion = MotionState::new();
    let mut x = Vec::new();
    let mut y = Vec::new();
    let mut past_stop = None;

    for record in scanner.by_ref() {
        // Motion state depends on earlier packages, so decode before filtering.
        let Some(value) = decode(channel, record.bytes, &mut motion) else {
            continue;
        };
        if record.timestamp > stop {
            past_stop = Some(record.offset + shape.len);
            break;
        }
        if record.timestamp >= start {
            x.push(record.timestamp);
            y.push(value);
        }
    }

    Scan {
        x,
        y,
        warnings: scanner.into_warnings(),
        past_stop,
    }
}

/// Decodes the value of `channel` from one record.
fn decode(channel: Channel, record: &[u8], motion: &mut MotionState) -> Option<f64> {
    match channel {
        Channel::Motion(n) => {
            let package = NormalPackage::from_bytes(record.try_into().ok()?);
            motion.apply(&package).get(usize::from(n)).copied()
        }
        Channel::Temperature(room) => Some(SlowRecord::from_bytes(record)?.reading().temperature_celsius(room)),
        Channel::Humidity(room) => Some(SlowRecord::from_bytes(record)?.reading().humidity_percent(room)),
        Channel::Co2 => Some(f64::from(SlowRecord::from_bytes(record)?.reading().co2)),
        Channel::Light(sensor) => Some(f64::from(SlowRecord::from_bytes(record)?.light[sensor.index()])),
    }
}

/// Read-only access to decoded channels.
///
/// Borrows the store; any number of services may run next to the writer.
#[derive(Debug, Clone, Copy)]
pub struct QueryService<'a> {
    store: &'a RecordStore,
}

impl<'a> QueryService<'a> {
    /// Creates a service reading from `store`.
    pub fn new(store: &'a RecordStore) -> Self {
        Self { store }
    }

    /// Returns the values of `channel` with timestamps in `[start, stop]`,
    /// at most `resolution_cap` of them.
    ///
    /// Motion channels read 1.0 while confirmed on and 0.0 while confirmed
    /// off. A package that leaves a channel unconfirmed repeats its last
    /// confirmed value. Decoding starts at the timestamp package found by
    /// [`seek`](Self::seek), where every channel reads 0.0 until a package
    /// confirms it.
    ///
    /// An empty range is not an error.
    ///
    /// # Errors
    ///
    /// - [`QueryError::InvalidTimeRange`] if `start > stop`
    /// - [`QueryError::ZeroResolution`] if `resolution_cap` is zero
    /// - [`crate::StorageError::ReadFailed`] if the stream cannot be read
    pub fn fetch(&self, channel: Channel, start: u32, stop: u32, resolution_cap: usize) -> Result<QueryResult> {
        if start > stop {
            return Err(QueryError::InvalidTimeRange { start, stop }.into());
        }
        if resolution_cap == 0 {
            return Err(QueryError::ZeroResolution.into());
        }

        let stream = channel.stream();
        let shape = stream.shape();
        let begin = self.seek(stream, start);

        // Grow the window until it reaches past `stop` with enough bytes
        // after that record for it to have been classified.
        let mut window = READ_WINDOW;
        let scan = loop {
            let bytes = self.store.read_range(stream, begin, window)?;
            let at_end = bytes.len() < window;
            let scan = scan_window(channel, &bytes, shape, start, stop);
            let settled = scan
                .past_stop
                .is_some_and(|end| end + TIMESTAMP_PACKAGE_LEN <= bytes.len());
            if at_end || settled {
                break scan;
            }
            window = window.saturating_mul(2);
        };
        debug!(stream = %stream, %channel, begin, window, "scanned query window");

        let base = usize::try_from(begin).unwrap_or(usize::MAX);
        let warnings: Vec<CorruptStream> = scan.warnings.into_iter().map(|w| w.offset_by(base)).collect();
        for warning in &warnings {
            warn!(stream = %stream, %channel, "{warning}");
        }

        let Scan { x, y, .. } = scan;
        let matched = x.len();
        let (x, y) = if matched > resolution_cap {
            stride_indices(matched, resolution_cap)
                .into_iter()
                .map(|i| (x[i], y[i]))
                .unzip()
        } else {
            (x, y)
        };

        Ok(QueryResult {
            x,
            y,
            matched,
            requested_range: (start, stop),
            warnings,
        })
    }

    /// Offset from which a scan of `stream` reaches every record at or
    /// after `timestamp`: a timestamp package whose record is not later
    /// than `timestamp`, or 0.
    pub fn seek(&self, stream: StreamId, timestamp: u32) -> u64 {
        self.store.anchor_before(stream, timestamp)
    }

    /// Scans a whole stream and reports its extent.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadFailed`] if the stream cannot be read.
    pub fn summary(&self, stream: StreamId) -> Result<StreamSummary> {
        let bytes = self.store.read_all(stream)?;
        let mut scanner = Scanner::new(&bytes, stream.shape());
        let mut records = 0;
        let mut first = None;
        let mut last = None;

        for record in scanner.by_ref() {
            records += 1;
            first.get_or_insert(record.timestamp);
            last = Some(record.timestamp);
        }

        Ok(StreamSummary {
            stream,
            bytes: bytes.len() as u64,
            records,
            first,
            last,
            warnings: scanner.into_warnings(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{LightSensor, Room};
    use crate::config::StoreConfig;
    use crate::error::SensorLogError;
    use crate::pir::PirEncoder;
    use crate::slow::{SlowEncoder, SlowReading, encode_celsius};
    use tempfile::tempdir;

    #[test]
    fn test_stride_keeps_first_and_last() {
        assert_eq!(stride_indices(5, 10), vec![0, 1, 2, 3, 4]);
        assert_eq!(stride_indices(10, 3), vec![0, 4, 9]);
        assert_eq!(stride_indices(9, 3), vec![0, 3, 8]);

        let kept = stride_indices(10_000, 1_000);
        assert_eq!(kept.len(), 1_000);
        assert_eq!(kept[0], 0);
        assert_eq!(kept[1], 10);
        assert_eq!(*kept.last().unwrap(), 9_999);
    }

    #[test]
    fn test_stride_cap_of_one_keeps_first() {
        assert_eq!(stride_indices(5, 1), vec![0]);
        assert_eq!(stride_indices(1, 1), vec![0]);
    }

    #[test]
    fn test_rejects_bad_arguments() {
        let temp_dir = tempdir().unwrap();
        let store = RecordStore::open(StoreConfig::new(temp_dir.path())).unwrap();
        let service = QueryService::new(&store);

        assert!(matches!(
            service.fetch(Channel::Co2, 10, 5, 100),
            Err(SensorLogError::Query(QueryError::InvalidTimeRange { start: 10, stop: 5 }))
        ));
        assert!(matches!(
            service.fetch(Channel::Co2, 0, 5, 0),
            Err(SensorLogError::Query(QueryError::ZeroResolution))
        ));
    }

    #[test]
    fn test_empty_stream_gives_empty_result() {
        let temp_dir = tempdir().unwrap();
        let store = RecordStore::open(StoreConfig::new(temp_dir.path())).unwrap();

        let result = QueryService::new(&store).fetch(Channel::Motion(0), 0, u32::MAX, 10).unwrap();
        assert!(result.is_empty());
        assert!(!result.may_be_truncated());
    }

    #[test]
    fn test_motion_holds_last_confirmed_value() {
        let temp_dir = tempdir().unwrap();
        let store = RecordStore::open(StoreConfig::new(temp_dir.path())).unwrap();
        let mut enc = PirEncoder::new(43_200);

        // channel 1 confirmed on at t=3, then unconfirmed at t=4
        for (raw, t) in [([0b00, 0], 1), ([0b10, 0], 2), ([0b10, 0b01], 3), ([0b00, 0], 4)] {
            if let Some(frame) = enc.process(&raw, t).unwrap() {
                store.write(StreamId::Pir, frame.as_bytes()).unwrap();
            }
        }

        let result = QueryService::new(&store).fetch(Channel::Motion(1), 0, 10, 100).unwrap();
        assert_eq!(result.x(), &[1, 2, 3, 4]);
        assert_eq!(result.y(), &[0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_slow_channels_decode() {
        let temp_dir = tempdir().unwrap();
        let store = RecordStore::open(StoreConfig::new(temp_dir.path())).unwrap();
        let mut enc = SlowEncoder::new(43_200);

        let reading = SlowReading {
            temperature: [encode_celsius(21.5), 501, 502],
            humidity: [455, 0, 1000],
            co2: 812,
        };
        enc.accumulate_light(&[10, 20, 30]);
        enc.accumulate_light(&[30, 40, 50]);
        let frame = enc.process(&reading.encode().unwrap(), 5_000).unwrap().unwrap();
        store.write(StreamId::Atmospheric, frame.as_bytes()).unwrap();

        let service = QueryService::new(&store);
        let fetch = |channel| service.fetch(channel, 5_000, 5_000, 10).unwrap().y().to_vec();

        assert_eq!(fetch(Channel::Temperature(Room::Bed)), vec![21.5]);
        assert_eq!(fetch(Channel::Temperature(Room::Bathroom)), vec![-10.0]);
        assert_eq!(fetch(Channel::Temperature(Room::Door)), vec![40.0]);
        assert_eq!(fetch(Channel::Humidity(Room::Bed)), vec![45.5]);
        assert_eq!(fetch(Channel::Co2), vec![812.0]);
        assert_eq!(fetch(Channel::Light(LightSensor::Kitchen)), vec![30.0]);
    }

    #[test]
    fn test_summary_reports_extent() {
        let temp_dir = tempdir().unwrap();
        let store = RecordStore::open(StoreConfig::new(temp_dir.path())).unwrap();
        let mut enc = PirEncoder::new(43_200);
        // counting up gives a new confirmed pair every sample
        for (i, t) in (100..110).enumerate() {
            let raw = [u8::try_from(i).unwrap(), 0];
            if let Some(frame) = enc.process(&raw, t).unwrap() {
                store.write(StreamId::Pir, frame.as_bytes()).unwrap();
            }
        }

        let summary = QueryService::new(&store).summary(StreamId::Pir).unwrap();
        assert_eq!(summary.first, Some(100));
        assert_eq!(summary.last, Some(109));
        assert_eq!(summary.bytes, store.len(StreamId::Pir));
        assert!(summary.warnings.is_empty());
    }

    #[test]
    fn test_summary_serializes_with_warnings() {
        let temp_dir = tempdir().unwrap();
        let store = RecordStore::open(StoreConfig::new(temp_dir.path())).unwrap();
        store.write(StreamId::Pir, &[0xAB, 0xCD, 0xEF]).unwrap();
        let mut enc = PirEncoder::new(43_200);
        let frame = enc.process(&[1, 0], 1_000).unwrap().unwrap();
        store.write(StreamId::Pir, frame.as_bytes()).unwrap();

        let summary = QueryService::new(&store).summary(StreamId::Pir).unwrap();
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["stream"], "pir");
        assert_eq!(json["records"], 1);
        assert_eq!(json["first"], 1_000);
        assert_eq!(json["warnings"][0]["kind"], "missing_timestamp");
        assert_eq!(json["warnings"][0]["offset"], 0);
    }
}
