//! Records a simulated day of sensor polls and queries it back.
//!
//! This example shows how to:
//! - Feed fast (motion + light) and slow (environment) samples through a recorder
//! - Query a channel with a resolution cap
//! - Inspect per-stream summaries

#![allow(clippy::cast_possible_truncation)]

use sensorlog::error::Result;
use sensorlog::slow::SlowReading;
use sensorlog::{Channel, QueryService, RecordStore, Recorder, Room, StoreConfig, StreamId};

const DAY_START: u32 = 1_700_000_000;
const DAY_SECS: u32 = 86_400;

fn main() -> Result<()> {
    let dir = std::env::temp_dir().join("sensorlog_simulated_day");
    // start from an empty store on every run
    let _ = std::fs::remove_dir_all(&dir);
    let store = RecordStore::open(StoreConfig::new(&dir))?;

    println!("Recording one simulated day into {}", dir.display());
    let mut stored_fast = 0usize;
    let mut stored_slow = 0usize;
    {
        let mut recorder = Recorder::new(&store);
        for t in 0..DAY_SECS {
            let ts = DAY_START + t;

            // someone walks past the door sensor every quarter hour
            let motion = u8::from(t % 900 < 20);
            let light = [(t / 360 % 240) as u16, 0, 50];
            if recorder.on_fast(&[motion, 0], &light, ts)? {
                stored_fast += 1;
            }

            if t % 60 == 0 {
                let minute = t / 60;
                let reading = SlowReading {
                    temperature: [200 + (minute % 50) as u16, 210, 195],
                    humidity: [450, 600 + (minute % 20) as u16, 480],
                    co2: 400 + (minute % 300) as u16,
                };
                if recorder.on_slow(&reading.encode()?, ts)? {
                    stored_slow += 1;
                }
            }

            if t % 3_600 == 0 {
                recorder.on_plants(&[120, 130, (t / 3_600) as u8], ts)?;
            }
        }
        recorder.flush()?;
    }
    println!("  fast records stored: {stored_fast}");
    println!("  slow records stored: {stored_slow}");

    let service = QueryService::new(&store);
    for channel in [Channel::Motion(0), Channel::Temperature(Room::Bed), Channel::Co2] {
        let result = service.fetch(channel, DAY_START, DAY_START + DAY_SECS, 48)?;
        println!("\n{channel}: {} of {} points", result.len(), result.matched());
        for (ts, value) in result.points().take(5) {
            println!("  {:>6}s  {value:.1}", ts - DAY_START);
        }
    }

    println!();
    for stream in StreamId::ALL {
        let summary = service.summary(stream)?;
        println!("{stream}: {} records, {} bytes", summary.records, summary.bytes);
    }

    Ok(())
}
