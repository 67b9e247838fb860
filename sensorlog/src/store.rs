//! Append-only record store.
//!
//! The store owns one log file per stream and a bounded write-behind cache
//! in front of each. Writes land in the cache; a write that would overflow
//! it first moves the cache to the file. Reads see both parts, so a record
//! is visible to queries as soon as [`RecordStore::write`] returns.
//!
//! # File Layout
//!
//! ```text
//! store_dir/
//! ├── layout.json        <- Format version and record widths
//! ├── pir.log            <- Timestamp and normal packages
//! ├── atmospheric.log    <- Timestamp packages and slow records
//! └── plants.log         <- Timestamp packages and plant records
//! ```
//!
//! The logs have no header or footer. `layout.json` only guards against
//! opening a directory written with different record widths.
//!
//! # Thread Safety
//!
//! Each stream has its own lock covering the cache, the file handle and the
//! flushed length. Readers copy the cached tail under the lock and read the
//! flushed prefix through a read-only memory map after releasing it; bytes
//! already on disk are never rewritten.
//!
//! Encoders are single-threaded. Exactly one writer per stream is expected,
//! while any number of readers may run alongside it.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::error::{InitError, Result, StorageError};
use crate::package::{NORMAL_PACKAGE_LEN, NormalPackage, PLANT_RECORD_LEN, PlantRecord, RecordShape, TIMESTAMP_PACKAGE_LEN};
use crate::slow::{LIGHT_CHANNELS, SLOW_RECORD_LEN, SlowRecord};
use crate::timestamp::{ANCHOR_SPACING, Anchor, survey};

/// Layout file format version.
const FORMAT_VERSION: u32 = 1;

/// Name of the layout file in the store directory.
const LAYOUT_FILE: &str = "layout.json";

/// Identifies one of the store's streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamId {
    /// Motion packages from the fast cycle.
    Pir,
    /// Temperature, humidity, CO2 and light from the slow cycle.
    Atmospheric,
    /// Raw plant sensor samples.
    Plants,
}

impl StreamId {
    /// All streams.
    pub const ALL: [StreamId; 3] = [StreamId::Pir, StreamId::Atmospheric, StreamId::Plants];

    const fn index(self) -> usize {
        self as usize
    }

    /// Log file name inside the store directory.
    pub const fn file_name(self) -> &'static str {
        match self {
            StreamId::Pir => "pir.log",
            StreamId::Atmospheric => "atmospheric.log",
            StreamId::Plants => "plants.log",
        }
    }

    /// Shape of the records stored in this stream.
    pub const fn shape(self) -> RecordShape {
        match self {
            StreamId::Pir => NormalPackage::SHAPE,
            StreamId::Atmospheric => SlowRecord::SHAPE,
            StreamId::Plants => PlantRecord::SHAPE,
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamId::Pir => "pir",
            StreamId::Atmospheric => "atmospheric",
            StreamId::Plants => "plants",
        })
    }
}

/// Record widths stored in `layout.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Layout {
    format_version: u32,
    timestamp_package_len: usize,
    pir_package_len: usize,
    slow_record_len: usize,
    light_channels: usize,
    plant_record_len: usize,
}

impl Layout {
    fn current() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            timestamp_package_len: TIMESTAMP_PACKAGE_LEN,
            pir_package_len: NORMAL_PACKAGE_LEN,
            slow_record_len: SLOW_RECORD_LEN,
            light_channels: LIGHT_CHANNELS,
            plant_record_len: PLANT_RECORD_LEN,
        }
    }

    /// Describes the first field where `found` differs from `self`.
    fn mismatch(&self, found: &Layout) -> Option<String> {
        if self.format_version != found.format_version {
            return Some(format!(
                "format_version: expected {}, found {}",
                self.format_version, found.format_version
            ));
        }
        [
            ("timestamp_package_len", self.timestamp_package_len, found.timestamp_package_len),
            ("pir_package_len", self.pir_package_len, found.pir_package_len),
            ("slow_record_len", self.slow_record_len, found.slow_record_len),
            ("light_channels", self.light_channels, found.light_channels),
            ("plant_record_len", self.plant_record_len, found.plant_record_len),
        ]
        .into_iter()
        .find(|(_, expected, actual)| expected != actual)
        .map(|(field, expected, actual)| format!("{field}: expected {expected}, found {actual}"))
    }
}

/// Writes the layout file on first open, or checks it on later opens.
fn check_layout(dir: &Path) -> std::result::Result<(), InitError> {
    let path = dir.join(LAYOUT_FILE);
    let expected = Layout::current();

    match fs::read_to_string(&path) {
        Ok(json) => {
            let found: Layout = serde_json::from_str(&json).map_err(|source| InitError::LayoutParse {
                path: path.clone(),
                source,
            })?;
            match expected.mismatch(&found) {
                Some(reason) => Err(InitError::LayoutMismatch { path, reason }),
                None => Ok(()),
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let json = serde_json::to_string_pretty(&expected).map_err(|source| InitError::LayoutParse {
                path: path.clone(),
                source,
            })?;
            fs::write(&path, json).map_err(|source| InitError::LayoutIo { path, source })
        }
        Err(source) => Err(InitError::LayoutIo { path, source }),
    }
}

/// Writes `bytes[*written..]`, retrying once from where the first attempt
/// stopped. `written` tracks progress across both attempts.
///
/// Returns the first attempt's error when the retry succeeded.
fn write_with_retry<W: Write>(out: &mut W, bytes: &[u8], written: &mut usize) -> io::Result<Option<io::Error>> {
    match write_from(out, bytes, written) {
        Ok(()) => Ok(None),
        Err(first) => write_from(out, bytes, written).map(|()| Some(first)),
    }
}

fn write_from<W: Write>(out: &mut W, bytes: &[u8], written: &mut usize) -> io::Result<()> {
    while *written < bytes.len() {
        match out.write(&bytes[*written..]) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => *written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Append target behind a stream's cache.
trait LogFile: Write + fmt::Debug + Send {
    /// Forces appended bytes to stable storage.
    fn sync_data(&self) -> io::Result<()>;
}

impl LogFile for File {
    fn sync_data(&self) -> io::Result<()> {
        File::sync_data(self)
    }
}

/// Cache and file of a single stream. Always accessed under its lock.
#[derive(Debug)]
struct StreamState {
    id: StreamId,
    path: PathBuf,
    file: Box<dyn LogFile>,
    cache: Vec<u8>,
    capacity: usize,
    /// Bytes known to be in the file.
    flushed_len: u64,
    /// Timestamp of the newest record written, as far as the store knows.
    last_timestamp: Option<u32>,
    /// Timestamp packages queries may start scanning from.
    anchors: Vec<Anchor>,
    /// Set after a write failed twice; the stream takes no more writes.
    poisoned: bool,
}

impl StreamState {
    /// Opens a stream's log, cutting any torn frame off its end so that new
    /// frames start on a record boundary.
    fn open(dir: &Path, id: StreamId, capacity: usize) -> std::result::Result<Self, InitError> {
        let path = dir.join(id.file_name());
        let open_failed = |source: io::Error| InitError::OpenLog {
            path: path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(open_failed)?;
        let mut flushed_len = file.metadata().map_err(open_failed)?.len();

        let mut last_timestamp = None;
        let mut anchors = Vec::new();
        if flushed_len > 0 {
            let reader = File::open(&path).map_err(open_failed)?;
            // SAFETY: the store is this log's only writer and does not
            // append before the map is dropped at the end of this block.
            let map = unsafe { Mmap::map(&reader) }.map_err(open_failed)?;
            let survey = survey(&map, id.shape());
            last_timestamp = survey.last;
            anchors = survey.anchors;
            if survey.clean_len < map.len() {
                warn!(
                    stream = %id,
                    path = %path.display(),
                    dropped = map.len() - survey.clean_len,
                    "cutting torn frame off log"
                );
                drop(map);
                file.set_len(survey.clean_len as u64).map_err(open_failed)?;
                flushed_len = survey.clean_len as u64;
            }
        }

        info!(stream = %id, path = %path.display(), bytes = flushed_len, anchors = anchors.len(), "opened stream");

        Ok(Self {
            id,
            path,
            file: Box::new(file),
            cache: Vec::with_capacity(capacity),
            capacity,
            flushed_len,
            last_timestamp,
            anchors,
            poisoned: false,
        })
    }

    fn len(&self) -> u64 {
        self.flushed_len + self.cache.len() as u64
    }

    fn ensure_writable(&self) -> std::result::Result<(), StorageError> {
        if self.poisoned {
            Err(StorageError::Poisoned { stream: self.id })
        } else {
            Ok(())
        }
    }

    /// Appends `bytes` to the file. Returns how many bytes reached it; on
    /// error the stream is poisoned.
    fn append_to_file(&mut self, bytes: &[u8]) -> (usize, std::result::Result<(), StorageError>) {
        let mut written = 0;
        let outcome = write_with_retry(&mut self.file, bytes, &mut written);
        self.flushed_len += written as u64;

        match outcome {
            Ok(None) => (written, Ok(())),
            Ok(Some(first)) => {
                warn!(stream = %self.id, path = %self.path.display(), error = %first, "log write failed, retry succeeded");
                (written, Ok(()))
            }
            Err(source) => {
                self.poisoned = true;
                error!(
                    stream = %self.id,
                    path = %self.path.display(),
                    pending = bytes.len() - written,
                    error = %source,
                    "log write failed twice, stopping stream"
                );
                (
                    written,
                    Err(StorageError::WriteFailed {
                        stream: self.id,
                        path: self.path.clone(),
                        len: bytes.len() - written,
                        source,
                    }),
                )
            }
        }
    }

    /// Moves the cache into the file. Bytes that did not make it stay in the
    /// cache so readers still see them.
    fn flush_cache(&mut self) -> std::result::Result<(), StorageError> {
        if self.cache.is_empty() {
            return Ok(());
        }
        let mut pending = std::mem::take(&mut self.cache);
        let (written, result) = self.append_to_file(&pending);
        pending.drain(..written);
        self.cache = pending;
        if result.is_ok() {
            debug!(stream = %self.id, bytes = written, "flushed cache");
        }
        result
    }

    /// Adds `bytes` to the cache, flushing first if they would not fit.
    fn append(&mut self, bytes: &[u8]) -> std::result::Result<(), StorageError> {
        self.ensure_writable()?;
        if self.cache.len() + bytes.len() > self.capacity {
            self.flush_cache()?;
        }
        if bytes.len() > self.capacity {
            self.append_to_file(bytes).1
        } else {
            self.cache.extend_from_slice(bytes);
            Ok(())
        }
    }

    fn sync(&self) -> std::result::Result<(), StorageError> {
        self.file.sync_data().map_err(|source| StorageError::SyncFailed {
            stream: self.id,
            path: self.path.clone(),
            source,
        })
    }
}

/// Durable, ordered, append-only byte logs with write-behind caches.
///
/// Shared by reference between the writer pipeline and any number of query
/// threads.
#[derive(Debug)]
pub struct RecordStore {
    config: StoreConfig,
    streams: [Mutex<StreamState>; 3],
}

impl RecordStore {
    /// Opens the store described by `config`, creating the directory and
    /// log files if absent.
    ///
    /// # Errors
    ///
    /// - [`InitError::InvalidConfig`] if the configuration does not validate
    /// - [`InitError::CreateDirectory`] or [`InitError::OpenLog`] if the
    ///   directory or a log cannot be created
    /// - [`InitError::LayoutMismatch`] if the directory was written with
    ///   different record widths
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        fs::create_dir_all(&config.dir).map_err(|source| InitError::CreateDirectory {
            path: config.dir.clone(),
            source,
        })?;
        check_layout(&config.dir)?;

        let open = |id: StreamId| StreamState::open(&config.dir, id, config.cache_bytes(id)).map(Mutex::new);
        let streams = [open(StreamId::Pir)?, open(StreamId::Atmospheric)?, open(StreamId::Plants)?];

        Ok(Self { config, streams })
    }

    /// The configuration the store was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The store directory.
    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Path of a stream's log file.
    pub fn path(&self, stream: StreamId) -> PathBuf {
        self.config.dir.join(stream.file_name())
    }

    fn lock(&self, stream: StreamId) -> MutexGuard<'_, StreamState> {
        // A panic while holding the lock leaves the cache and lengths
        // consistent: both are only updated after the bytes moved.
        self.streams[stream.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `bytes` to a stream.
    ///
    /// The bytes go to the cache. If they would not fit, the cache is
    /// flushed first; a write larger than the whole cache goes straight to
    /// the file. Either way the bytes are never split across a flush.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::WriteFailed`] if the file rejected a write
    /// twice, and [`StorageError::Poisoned`] for every write after that.
    pub fn write(&self, stream: StreamId, bytes: &[u8]) -> Result<()> {
        self.lock(stream).append(bytes)?;
        Ok(())
    }

    /// Appends one encoded frame whose record is at `timestamp`, and
    /// remembers the timestamp for [`RecordStore::last_timestamp`].
    ///
    /// A frame one timestamp package longer than a record becomes an
    /// anchor for [`RecordStore::anchor_before`].
    ///
    /// # Errors
    ///
    /// See [`RecordStore::write`].
    pub fn write_record(&self, stream: StreamId, bytes: &[u8], timestamp: u32) -> Result<()> {
        let mut state = self.lock(stream);
        let offset = state.len();
        state.append(bytes)?;
        state.last_timestamp = Some(state.last_timestamp.map_or(timestamp, |last| last.max(timestamp)));

        let stamped = bytes.len() == stream.shape().len + TIMESTAMP_PACKAGE_LEN;
        let spaced = state
            .anchors
            .last()
            .is_none_or(|a| offset - a.offset >= ANCHOR_SPACING && timestamp >= a.timestamp);
        if stamped && spaced {
            state.anchors.push(Anchor { offset, timestamp });
        }
        Ok(())
    }

    /// Offset of the last known timestamp package whose record is not
    /// later than `timestamp`, or 0 when there is none. Scanning from there
    /// reaches every record at or after `timestamp`.
    pub fn anchor_before(&self, stream: StreamId, timestamp: u32) -> u64 {
        let state = self.lock(stream);
        let after = state.anchors.partition_point(|a| a.timestamp <= timestamp);
        after
            .checked_sub(1)
            .and_then(|i| state.anchors.get(i))
            .map_or(0, |a| a.offset)
    }

    /// Timestamp of the newest record in a stream: the last one found when
    /// the store was opened, or the last written through
    /// [`RecordStore::write_record`] since.
    pub fn last_timestamp(&self, stream: StreamId) -> Option<u32> {
        self.lock(stream).last_timestamp
    }

    /// Total bytes in a stream, flushed or not.
    pub fn len(&self, stream: StreamId) -> u64 {
        self.lock(stream).len()
    }

    /// Whether a stream holds no bytes.
    pub fn is_empty(&self, stream: StreamId) -> bool {
        self.len(stream) == 0
    }

    /// Bytes of a stream still waiting in its cache.
    pub fn cached_len(&self, stream: StreamId) -> usize {
        self.lock(stream).cache.len()
    }

    /// Whether a stream was stopped by a write failure.
    pub fn is_poisoned(&self, stream: StreamId) -> bool {
        self.lock(stream).poisoned
    }

    #[cfg(test)]
    fn replace_log(&self, stream: StreamId, log: Box<dyn LogFile>) {
        self.lock(stream).file = log;
    }

    /// Reads up to `len` bytes starting at `offset`, including bytes that
    /// are still cached. Returns fewer bytes when the range runs past the end
    /// of the stream.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ReadFailed`] if the log cannot be opened or
    /// mapped, or is shorter than the store's own record of it.
    #[allow(clippy::cast_possible_truncation)] // offsets below the stream length fit in the address space
    pub fn read_range(&self, stream: StreamId, offset: u64, len: usize) -> Result<Vec<u8>> {
        let (start, end, flushed_len, path, cached) = {
            let state = self.lock(stream);
            let end = offset.saturating_add(len as u64).min(state.len());
            let start = offset.min(end);
            let cached = if end > state.flushed_len {
                let from = (start.max(state.flushed_len) - state.flushed_len) as usize;
                let to = (end - state.flushed_len) as usize;
                state.cache[from..to].to_vec()
            } else {
                Vec::new()
            };
            (start, end, state.flushed_len, state.path.clone(), cached)
        };

        let disk_end = end.min(flushed_len);
        if start >= disk_end {
            return Ok(cached);
        }

        let read_failed = |source: io::Error| StorageError::ReadFailed {
            stream,
            path: path.clone(),
            offset: start,
            source,
        };
        let file = File::open(&path).map_err(read_failed)?;
        // SAFETY: the log is append-only. Bytes below `flushed_len` were
        // written before the lock was released and are never modified, so
        // the mapped prefix stays valid while the writer keeps appending.
        let map = unsafe { Mmap::map(&file) }.map_err(read_failed)?;
        let disk = map
            .get(start as usize..disk_end as usize)
            .ok_or_else(|| read_failed(io::Error::from(io::ErrorKind::UnexpectedEof)))?;

        let mut out = Vec::with_capacity(disk.len() + cached.len());
        out.extend_from_slice(disk);
        out.extend_from_slice(&cached);
        Ok(out)
    }

    /// Reads a whole stream.
    ///
    /// # Errors
    ///
    /// See [`RecordStore::read_range`].
    #[allow(clippy::cast_possible_truncation)] // whole stream is mapped anyway
    pub fn read_all(&self, stream: StreamId) -> Result<Vec<u8>> {
        let len = self.len(stream) as usize;
        self.read_range(stream, 0, len)
    }

    /// Moves a stream's cache to its file and syncs the file.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Poisoned`] for a stopped stream,
    /// [`StorageError::WriteFailed`] if the cache could not be written and
    /// [`StorageError::SyncFailed`] if the sync failed.
    pub fn flush(&self, stream: StreamId) -> Result<()> {
        let mut state = self.lock(stream);
        state.ensure_writable()?;
        state.flush_cache()?;
        state.sync()?;
        Ok(())
    }

    /// Flushes every stream. A failing stream does not stop the others.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered.
    pub fn flush_all(&self) -> Result<()> {
        let mut first_error = None;
        for stream in StreamId::ALL {
            if let Err(e) = self.flush(stream) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for RecordStore {
    fn drop(&mut self) {
        for stream in StreamId::ALL {
            let state = self.streams[stream.index()]
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner);
            if state.poisoned || state.cache.is_empty() {
                continue;
            }
            if let Err(e) = state.flush_cache().and_then(|()| state.sync()) {
                warn!(stream = %stream, error = %e, "failed to flush stream on close");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SensorLogError;
    use crate::package::TimestampPackage;
    use tempfile::tempdir;

    fn small_config(dir: &Path, capacity: usize) -> StoreConfig {
        StoreConfig {
            pir_cache_bytes: capacity,
            slow_cache_bytes: capacity,
            plant_cache_bytes: capacity,
            ..StoreConfig::new(dir)
        }
    }

    fn disk_len(store: &RecordStore, stream: StreamId) -> u64 {
        fs::metadata(store.path(stream)).unwrap().len()
    }

    /// Writer that fails on the listed call numbers and accepts at most
    /// `chunk` bytes per call otherwise.
    #[derive(Debug)]
    struct FlakyWriter {
        data: Vec<u8>,
        chunk: usize,
        calls: usize,
        fail_on: Vec<usize>,
    }

    impl Write for FlakyWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            if self.fail_on.contains(&self.calls) {
                return Err(io::Error::other("disk hiccup"));
            }
            let n = buf.len().min(self.chunk);
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogFile for FlakyWriter {
        fn sync_data(&self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_open_creates_logs_and_layout() {
        let temp_dir = tempdir().unwrap();
        let dir = temp_dir.path().join("store");
        let store = RecordStore::open(StoreConfig::new(&dir)).unwrap();

        for stream in StreamId::ALL {
            assert!(store.path(stream).exists(), "{stream} log missing");
            assert!(store.is_empty(stream));
        }
        assert!(dir.join(LAYOUT_FILE).exists());
    }

    #[test]
    fn test_writes_visible_before_flush() {
        let temp_dir = tempdir().unwrap();
        let store = RecordStore::open(StoreConfig::new(temp_dir.path())).unwrap();

        store.write(StreamId::Pir, &[1, 2, 3, 4]).unwrap();
        assert_eq!(disk_len(&store, StreamId::Pir), 0);
        assert_eq!(store.len(StreamId::Pir), 4);
        assert_eq!(store.read_all(StreamId::Pir).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_full_cache_flushes_before_accepting() {
        let temp_dir = tempdir().unwrap();
        let store = RecordStore::open(small_config(temp_dir.path(), 8)).unwrap();

        store.write(StreamId::Pir, &[1; 4]).unwrap();
        store.write(StreamId::Pir, &[2; 4]).unwrap();
        assert_eq!(disk_len(&store, StreamId::Pir), 0, "exactly full is not flushed yet");

        store.write(StreamId::Pir, &[3; 4]).unwrap();
        assert_eq!(disk_len(&store, StreamId::Pir), 8);
        assert_eq!(store.cached_len(StreamId::Pir), 4);

        let mut expected = vec![1; 4];
        expected.extend([2; 4]);
        expected.extend([3; 4]);
        assert_eq!(store.read_all(StreamId::Pir).unwrap(), expected);
    }

    #[test]
    fn test_oversized_write_goes_to_file() {
        let temp_dir = tempdir().unwrap();
        let store = RecordStore::open(small_config(temp_dir.path(), 8)).unwrap();

        store.write(StreamId::Atmospheric, &[9; 3]).unwrap();
        store.write(StreamId::Atmospheric, &[7; 21]).unwrap();
        assert_eq!(disk_len(&store, StreamId::Atmospheric), 24);
        assert_eq!(store.cached_len(StreamId::Atmospheric), 0);
    }

    #[test]
    fn test_read_range_spans_disk_and_cache() {
        let temp_dir = tempdir().unwrap();
        let store = RecordStore::open(small_config(temp_dir.path(), 4)).unwrap();

        store.write(StreamId::Plants, &[0, 1, 2, 3]).unwrap();
        store.write(StreamId::Plants, &[4, 5, 6, 7]).unwrap();
        assert_eq!(disk_len(&store, StreamId::Plants), 4);

        assert_eq!(store.read_range(StreamId::Plants, 2, 4).unwrap(), vec![2, 3, 4, 5]);
        assert_eq!(store.read_range(StreamId::Plants, 6, 100).unwrap(), vec![6, 7]);
        assert!(store.read_range(StreamId::Plants, 50, 4).unwrap().is_empty());
    }

    #[test]
    fn test_reopen_sees_flushed_data() {
        let temp_dir = tempdir().unwrap();
        {
            let store = RecordStore::open(StoreConfig::new(temp_dir.path())).unwrap();
            store.write(StreamId::Pir, &[5, 6, 7, 8]).unwrap();
            store.flush_all().unwrap();
            store.write(StreamId::Pir, &[9, 9, 9, 9]).unwrap();
            // dropped with bytes still cached
        }

        let store = RecordStore::open(StoreConfig::new(temp_dir.path())).unwrap();
        assert_eq!(store.read_all(StreamId::Pir).unwrap(), vec![5, 6, 7, 8, 9, 9, 9, 9]);
    }

    #[test]
    fn test_layout_mismatch_rejected() {
        let temp_dir = tempdir().unwrap();
        drop(RecordStore::open(StoreConfig::new(temp_dir.path())).unwrap());

        let path = temp_dir.path().join(LAYOUT_FILE);
        let mut layout: Layout = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        layout.slow_record_len += 1;
        fs::write(&path, serde_json::to_string(&layout).unwrap()).unwrap();

        match RecordStore::open(StoreConfig::new(temp_dir.path())) {
            Err(SensorLogError::Init(InitError::LayoutMismatch { reason, .. })) => {
                assert!(reason.starts_with("slow_record_len"), "{reason}");
            }
            other => panic!("expected LayoutMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let temp_dir = tempdir().unwrap();
        let config = small_config(temp_dir.path(), 0);
        assert!(matches!(
            RecordStore::open(config),
            Err(SensorLogError::Init(InitError::InvalidConfig { .. }))
        ));
    }

    #[test]
    fn test_retry_resumes_where_write_stopped() {
        let mut out = FlakyWriter {
            data: Vec::new(),
            chunk: 3,
            calls: 0,
            fail_on: vec![2],
        };
        let mut written = 0;
        let first = write_with_retry(&mut out, b"abcdefgh", &mut written).unwrap();
        assert!(first.is_some());
        assert_eq!(written, 8);
        assert_eq!(out.data, b"abcdefgh");
    }

    #[test]
    fn test_second_failure_gives_up() {
        let mut out = FlakyWriter {
            data: Vec::new(),
            chunk: 3,
            calls: 0,
            fail_on: vec![2, 3],
        };
        let mut written = 0;
        assert!(write_with_retry(&mut out, b"abcdefgh", &mut written).is_err());
        assert_eq!(written, 3);
        assert_eq!(out.data, b"abc");
    }

    #[test]
    fn test_failed_flush_stops_only_that_stream() {
        let temp_dir = tempdir().unwrap();
        let store = RecordStore::open(small_config(temp_dir.path(), 8)).unwrap();
        store.replace_log(
            StreamId::Pir,
            Box::new(FlakyWriter {
                data: Vec::new(),
                chunk: 8,
                calls: 0,
                fail_on: (1..=10).collect(),
            }),
        );

        store.write(StreamId::Pir, &[1; 4]).unwrap();
        store.write(StreamId::Pir, &[2; 4]).unwrap();
        // cache is full, so this write flushes first and the flush fails twice
        match store.write(StreamId::Pir, &[3; 4]) {
            Err(SensorLogError::Storage(StorageError::WriteFailed { stream, len, .. })) => {
                assert_eq!(stream, StreamId::Pir);
                assert_eq!(len, 8);
            }
            other => panic!("expected WriteFailed, got {other:?}"),
        }
        assert!(store.is_poisoned(StreamId::Pir));
        assert!(matches!(
            store.write(StreamId::Pir, &[4; 4]),
            Err(SensorLogError::Storage(StorageError::Poisoned { stream: StreamId::Pir }))
        ));
        assert!(matches!(
            store.flush(StreamId::Pir),
            Err(SensorLogError::Storage(StorageError::Poisoned { .. }))
        ));

        // readers still see the bytes that never reached the file
        assert_eq!(store.read_all(StreamId::Pir).unwrap(), vec![1, 1, 1, 1, 2, 2, 2, 2]);
        assert_eq!(disk_len(&store, StreamId::Pir), 0);

        store.write(StreamId::Atmospheric, &[7; 6]).unwrap();
        store.flush(StreamId::Atmospheric).unwrap();
        assert!(!store.is_poisoned(StreamId::Atmospheric));
        assert_eq!(disk_len(&store, StreamId::Atmospheric), 6);
        assert!(store.flush_all().is_err());
    }

    #[test]
    fn test_flush_survives_one_failure() {
        let temp_dir = tempdir().unwrap();
        let store = RecordStore::open(small_config(temp_dir.path(), 8)).unwrap();
        store.replace_log(
            StreamId::Plants,
            Box::new(FlakyWriter {
                data: Vec::new(),
                chunk: 3,
                calls: 0,
                fail_on: vec![1],
            }),
        );

        store.write(StreamId::Plants, &[1, 2, 3, 4, 5]).unwrap();
        store.flush(StreamId::Plants).unwrap();
        assert!(!store.is_poisoned(StreamId::Plants));
        assert_eq!(store.cached_len(StreamId::Plants), 0);
        assert_eq!(store.len(StreamId::Plants), 5);
    }

    #[test]
    fn test_open_cuts_torn_frame() {
        let temp_dir = tempdir().unwrap();
        let frame = |ts: u32, ones: u8, zeros: u8| {
            let mut bytes = TimestampPackage::new(ts).to_bytes().to_vec();
            bytes.extend_from_slice(
                &NormalPackage {
                    time_low: crate::package::time_low(ts),
                    confirmed_ones: ones,
                    confirmed_zeros: zeros,
                }
                .to_bytes(),
            );
            bytes
        };
        {
            let store = RecordStore::open(StoreConfig::new(temp_dir.path())).unwrap();
            store.write(StreamId::Pir, &frame(1_000, 0, 0)).unwrap();
            store.write(StreamId::Pir, &frame(2_000, 1, 0)).unwrap();
            store.write(StreamId::Pir, &[0x55, 0x66]).unwrap();
        }

        let store = RecordStore::open(StoreConfig::new(temp_dir.path())).unwrap();
        assert_eq!(store.len(StreamId::Pir), 16);
        assert_eq!(disk_len(&store, StreamId::Pir), 16);
        assert_eq!(store.last_timestamp(StreamId::Pir), Some(2_000));
    }

    #[test]
    fn test_write_record_tracks_last_timestamp() {
        let temp_dir = tempdir().unwrap();
        let store = RecordStore::open(StoreConfig::new(temp_dir.path())).unwrap();
        assert_eq!(store.last_timestamp(StreamId::Plants), None);

        let mut bytes = TimestampPackage::new(70_000).to_bytes().to_vec();
        bytes.extend_from_slice(&[0x70, 0x11, 1, 2, 3]);
        store.write_record(StreamId::Plants, &bytes, 70_000).unwrap();
        assert_eq!(store.last_timestamp(StreamId::Plants), Some(70_000));
        drop(store);

        let store = RecordStore::open(StoreConfig::new(temp_dir.path())).unwrap();
        assert_eq!(store.last_timestamp(StreamId::Plants), Some(70_000));
        assert_eq!(store.anchor_before(StreamId::Plants, 69_999), 0);
        assert_eq!(store.anchor_before(StreamId::Plants, 70_000), 0);
    }

    #[test]
    fn test_anchors_are_spaced_and_searchable() {
        let temp_dir = tempdir().unwrap();
        let store = RecordStore::open(StoreConfig::new(temp_dir.path())).unwrap();
        let mut offsets = Vec::new();
        for i in 0..1_000u32 {
            let t = 1_000_000 + i * 600;
            let mut bytes = TimestampPackage::new(t).to_bytes().to_vec();
            bytes.extend_from_slice(&crate::package::time_low(t).to_le_bytes());
            bytes.extend_from_slice(&[1, 2, 3]);
            offsets.push(store.len(StreamId::Plants));
            store.write_record(StreamId::Plants, &bytes, t).unwrap();
        }

        assert_eq!(store.anchor_before(StreamId::Plants, 0), 0);
        let late = store.anchor_before(StreamId::Plants, 1_000_000 + 900 * 600);
        assert!(late > 0);
        assert!(offsets.contains(&late));
        assert!(late <= offsets[900]);
        assert!(offsets[900] - late < ANCHOR_SPACING + 9);

        // the reopened store finds the same anchors by scanning
        drop(store);
        let store = RecordStore::open(StoreConfig::new(temp_dir.path())).unwrap();
        assert_eq!(store.anchor_before(StreamId::Plants, 1_000_000 + 900 * 600), late);
    }

    #[test]
    fn test_stream_shapes() {
        assert_eq!(StreamId::Pir.shape().len, 4);
        assert_eq!(StreamId::Atmospheric.shape().len, 17);
        assert_eq!(StreamId::Atmospheric.shape().time_low_offset, 0);
        assert_eq!(StreamId::Plants.to_string(), "plants");
    }
}
