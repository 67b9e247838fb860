//! # sensorlog
//!
//! Append-only, bit-packed storage engine for home sensor readings.
//!
//! sensorlog turns the raw samples of a home sensor network into compact
//! binary logs and answers time-range queries over them for dashboards and
//! command-line tools. It is built to run on a small always-on host with one
//! writer thread and occasional readers.
//!
//! ## Key Properties
//!
//! - 4-byte motion packages that only store confirmed state changes
//! - 70-bit packed environmental samples with per-cycle light means
//! - Adaptive timestamp compression: full timestamps only when the upper
//!   16 bits change or half a day has passed
//! - Read-your-writes: records are queryable before they reach disk
//! - Bounded per-stream write caches, no background threads
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sensorlog::{Channel, QueryService, RecordStore, Recorder, StoreConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RecordStore::open(StoreConfig::new("./sensor_data"))?;
//!
//! // Writer side: feed samples as they arrive
//! let mut recorder = Recorder::new(&store);
//! recorder.on_fast(&[0b0000_0001, 0], &[120, 80, 300], 1_700_000_000)?;
//! recorder.on_fast(&[0b0000_0001, 0], &[121, 80, 301], 1_700_000_001)?;
//!
//! // Reader side: plot motion sensor 0 over the last hour
//! let result = QueryService::new(&store).fetch(Channel::Motion(0), 1_699_996_400, 1_700_000_001, 600)?;
//! for (t, v) in result.points() {
//!     println!("{t}: {v}");
//! }
//!
//! recorder.flush()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`RecordStore`]: One append-only log per stream behind a write cache
//! - [`Recorder`]: Encoders for each sample kind, writing into the store
//! - [`QueryService`]: Decodes a channel over a time range
//! - [`Channel`]: Names every plottable series
//!
//! ## Modules
//!
//! - [`package`]: On-disk package layouts
//! - [`timestamp`]: Timestamp compression and stream scanning
//! - [`pir`]: Motion sample confirmation and encoding
//! - [`slow`]: Environmental bitstream, light aggregation and encoding
//! - [`bits`]: MSB-first bit packing
//! - [`store`]: Record store and stream identifiers
//! - [`query`]: Channel queries and downsampling
//! - [`recorder`]: Writer pipeline
//! - [`config`]: Store configuration
//! - [`error`]: Error types

pub mod bits;
pub mod channel;
pub mod config;
pub mod error;
pub mod package;
pub mod pir;
pub mod query;
pub mod recorder;
pub mod slow;
pub mod store;
pub mod timestamp;

// Re-export primary API types at crate root for convenience.
pub use channel::{Channel, LightSensor, Room};
pub use config::StoreConfig;
pub use error::{CorruptStream, InitError, InputError, QueryError, Result, SensorLogError, StorageError};
pub use query::{QueryResult, QueryService, StreamSummary};
pub use recorder::Recorder;
pub use store::{RecordStore, StreamId};
