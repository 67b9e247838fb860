//! Integration tests for the record store lifecycle.
//!
//! These tests exercise persistence across reopen, cache flushing under a
//! small capacity, and a reader thread querying while the writer appends.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::thread;

use sensorlog::slow::SlowReading;
use sensorlog::{
    Channel, InputError, QueryService, RecordStore, Recorder, SensorLogError, StoreConfig, StreamId,
};
use tempfile::tempdir;

fn small_cache(dir: &std::path::Path) -> StoreConfig {
    StoreConfig {
        pir_cache_bytes: 64,
        slow_cache_bytes: 64,
        plant_cache_bytes: 64,
        ..StoreConfig::new(dir)
    }
}

#[test]
fn test_full_store_lifecycle() {
    let temp_dir = tempdir().unwrap();
    let store_path = temp_dir.path().join("lifecycle_test");
    let base = 0x6500_0000u32;

    // Phase 1: write, leave some bytes cached at drop
    let written = {
        let store = RecordStore::open(small_cache(&store_path)).unwrap();
        let mut recorder = Recorder::new(&store);
        let mut written = 0;
        for i in 0..100u32 {
            let raw = [u8::try_from(i % 16).unwrap(), 0];
            if recorder.on_fast(&raw, &[0; 3], base + i).unwrap() {
                written += 1;
            }
        }
        recorder.on_plants(&[40, 41, 42], base + 100).unwrap();
        written
    };

    // Phase 2: reopen and read everything back
    {
        let store = RecordStore::open(small_cache(&store_path)).unwrap();
        for stream in StreamId::ALL {
            let on_disk = fs::metadata(store.path(stream)).unwrap().len();
            assert_eq!(on_disk, store.len(stream), "{stream} not fully flushed");
        }

        let service = QueryService::new(&store);
        let result = service.fetch(Channel::Motion(0), base, base + 200, 1_000).unwrap();
        assert_eq!(result.len(), written);
        assert_eq!(result.x()[0], base);
        assert!(result.x().windows(2).all(|w| w[0] < w[1]));

        let plants = service.summary(StreamId::Plants).unwrap();
        assert_eq!(plants.records, 1);
        assert_eq!(plants.first, Some(base + 100));
    }
}

#[test]
fn test_reopen_continues_appending() {
    let temp_dir = tempdir().unwrap();

    {
        let store = RecordStore::open(StoreConfig::new(temp_dir.path())).unwrap();
        let mut recorder = Recorder::new(&store);
        recorder.on_fast(&[1, 0], &[0; 3], 10_000).unwrap();
        recorder.flush().unwrap();
    }
    {
        // a new recorder starts with a fresh timestamp package
        let store = RecordStore::open(StoreConfig::new(temp_dir.path())).unwrap();
        let mut recorder = Recorder::new(&store);
        recorder.on_fast(&[3, 0], &[0; 3], 20_000).unwrap();
        recorder.flush().unwrap();
        assert_eq!(store.len(StreamId::Pir), 16);
    }

    let store = RecordStore::open(StoreConfig::new(temp_dir.path())).unwrap();
    let result = QueryService::new(&store)
        .fetch(Channel::Motion(0), 0, u32::MAX, 10)
        .unwrap();
    assert_eq!(result.x(), &[10_000, 20_000]);
}

#[test]
fn test_streams_are_independent() {
    let temp_dir = tempdir().unwrap();
    let store = RecordStore::open(small_cache(temp_dir.path())).unwrap();

    store.write(StreamId::Pir, &[1; 100]).unwrap();
    assert_eq!(store.len(StreamId::Pir), 100);
    assert!(store.is_empty(StreamId::Atmospheric));
    assert!(store.is_empty(StreamId::Plants));
    assert!(!store.is_poisoned(StreamId::Pir));
}

#[test]
fn test_reader_runs_alongside_writer() {
    let temp_dir = tempdir().unwrap();
    let store = RecordStore::open(small_cache(temp_dir.path())).unwrap();
    let base = 0x0010_0000u32;
    let samples = 250u32;

    let stored = thread::scope(|scope| {
        let writer = scope.spawn(|| {
            let mut recorder = Recorder::new(&store);
            let mut stored = 0;
            for i in 0..samples {
                // low nibble only: upper channels stay confirmed off
                let raw = [u8::try_from(i % 16).unwrap(), 0];
                if recorder.on_fast(&raw, &[0; 3], base + i).unwrap() {
                    stored += 1;
                }
            }
            stored
        });

        let reader = scope.spawn(|| {
            let service = QueryService::new(&store);
            for _ in 0..50 {
                let result = service.fetch(Channel::Motion(0), base, base + samples, 10_000).unwrap();
                assert!(!result.may_be_truncated(), "{:?}", result.warnings());
                assert!(result.x().windows(2).all(|w| w[0] < w[1]));
                thread::yield_now();
            }
        });

        reader.join().unwrap();
        writer.join().unwrap()
    });

    let result = QueryService::new(&store)
        .fetch(Channel::Motion(0), base, base + samples, 10_000)
        .unwrap();
    assert_eq!(result.len(), stored);
}

#[test]
fn test_reopened_recorder_rejects_earlier_samples() {
    let temp_dir = tempdir().unwrap();
    let slow = SlowReading {
        temperature: [300, 300, 300],
        humidity: [400, 400, 400],
        co2: 500,
    }
    .encode()
    .unwrap();

    {
        let store = RecordStore::open(StoreConfig::new(temp_dir.path())).unwrap();
        let mut recorder = Recorder::new(&store);
        recorder.on_fast(&[1, 0], &[0; 3], 20_000).unwrap();
        recorder.on_slow(&slow, 20_000).unwrap();
        recorder.flush().unwrap();
    }

    let store = RecordStore::open(StoreConfig::new(temp_dir.path())).unwrap();
    assert_eq!(store.last_timestamp(StreamId::Pir), Some(20_000));
    let mut recorder = Recorder::new(&store);
    let err = recorder.on_fast(&[0, 0], &[0; 3], 10_000).unwrap_err();
    assert!(matches!(
        err,
        SensorLogError::Input(InputError::TimestampRegression { timestamp: 10_000, last: 20_000 })
    ));
    assert!(recorder.on_slow(&slow, 19_000).is_err());
    assert_eq!(store.len(StreamId::Pir), 8);

    let result = QueryService::new(&store)
        .fetch(Channel::Motion(0), 0, u32::MAX, 10)
        .unwrap();
    assert_eq!(result.x(), &[20_000]);
    assert!(!result.may_be_truncated());
}

#[test]
fn test_appends_after_stray_tail_bytes_read_back() {
    let temp_dir = tempdir().unwrap();

    let pir_path = {
        let store = RecordStore::open(StoreConfig::new(temp_dir.path())).unwrap();
        let mut recorder = Recorder::new(&store);
        recorder.on_fast(&[1, 0], &[0; 3], 100_000).unwrap();
        recorder.on_fast(&[0, 0], &[0; 3], 100_001).unwrap();
        recorder.flush().unwrap();
        store.path(StreamId::Pir)
    };
    // a frame torn by power loss
    OpenOptions::new()
        .append(true)
        .open(&pir_path)
        .unwrap()
        .write_all(&[0x55, 0x66])
        .unwrap();

    let store = RecordStore::open(StoreConfig::new(temp_dir.path())).unwrap();
    assert_eq!(store.len(StreamId::Pir), 12);
    assert_eq!(fs::metadata(&pir_path).unwrap().len(), 12);
    {
        let mut recorder = Recorder::new(&store);
        for i in 0..5u8 {
            assert!(recorder.on_fast(&[i, 0], &[0; 3], 200_000 + u32::from(i)).unwrap());
        }
        recorder.flush().unwrap();
    }

    let result = QueryService::new(&store)
        .fetch(Channel::Motion(0), 0, u32::MAX, 100)
        .unwrap();
    assert_eq!(
        result.x(),
        &[100_000, 100_001, 200_000, 200_001, 200_002, 200_003, 200_004]
    );
    assert!(result.warnings().is_empty());
}

#[test]
fn test_fetch_seeks_into_long_stream() {
    let temp_dir = tempdir().unwrap();
    let config = StoreConfig {
        timestamp_refresh_secs: 600,
        ..StoreConfig::new(temp_dir.path())
    };
    let base = 1_700_000_000u32;

    {
        let store = RecordStore::open(config.clone()).unwrap();
        let mut recorder = Recorder::new(&store);
        for i in 0..3_000u16 {
            let raw = SlowReading {
                temperature: [300, 310, 320],
                humidity: [400, 410, 420],
                co2: i,
            }
            .encode()
            .unwrap();
            assert!(recorder.on_slow(&raw, base + u32::from(i) * 60).unwrap());
        }
        recorder.flush().unwrap();
        assert!(QueryService::new(&store).seek(StreamId::Atmospheric, base + 2_900 * 60) > 0);
    }

    // anchors are rebuilt from the file on reopen
    let store = RecordStore::open(config).unwrap();
    let service = QueryService::new(&store);
    let start = base + 2_500 * 60;
    let stop = base + 2_509 * 60;
    let offset = service.seek(StreamId::Atmospheric, start);
    assert!(offset > 0);
    assert!(offset < store.len(StreamId::Atmospheric));
    assert_eq!(service.seek(StreamId::Atmospheric, base), 0);

    let result = service.fetch(Channel::Co2, start, stop, 100).unwrap();
    let expected_x: Vec<u32> = (2_500..2_510).map(|i| base + i * 60).collect();
    let expected_y: Vec<f64> = (2_500..2_510u32).map(f64::from).collect();
    assert_eq!(result.x(), expected_x.as_slice());
    assert_eq!(result.y(), expected_y.as_slice());
    assert!(!result.may_be_truncated());
}
