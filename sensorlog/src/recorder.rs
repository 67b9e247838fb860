//! Writer-side pipeline from transport samples to the record store.
//!
//! A [`Recorder`] owns the stateful encoders and borrows the store. It is
//! meant to live on the single thread that receives samples from the sensor
//! nodes; queries run elsewhere against the same store.

use tracing::{trace, warn};

use crate::error::{InputError, Result};
use crate::package::{
    Frame, PLANT_RAW_LEN, PLANT_RECORD_LEN, PlantRecord, TIMESTAMP_PACKAGE_LEN, TimestampPackage, time_low,
};
use crate::pir::PirEncoder;
use crate::slow::{LIGHT_CHANNELS, SlowEncoder};
use crate::store::{RecordStore, StreamId};

/// An encoded plant write: timestamp package plus plant record.
pub type PlantFrame = Frame<{ TIMESTAMP_PACKAGE_LEN + PLANT_RECORD_LEN }>;

/// Encodes incoming samples and appends them to the store.
#[derive(Debug)]
pub struct Recorder<'a> {
    store: &'a RecordStore,
    pir: PirEncoder,
    slow: SlowEncoder,
    last_plant: Option<u32>,
}

impl<'a> Recorder<'a> {
    /// Creates a recorder using the store's timestamp refresh interval.
    ///
    /// Each encoder resumes after the newest record its stream already
    /// holds, so older samples are rejected and the first new record of
    /// every stream gets a timestamp package.
    pub fn new(store: &'a RecordStore) -> Self {
        let refresh = store.config().timestamp_refresh_secs;
        Self {
            store,
            pir: PirEncoder::resume(refresh, store.last_timestamp(StreamId::Pir)),
            slow: SlowEncoder::resume(refresh, store.last_timestamp(StreamId::Atmospheric)),
            last_plant: store.last_timestamp(StreamId::Plants),
        }
    }

    /// The store being written to.
    pub fn store(&self) -> &'a RecordStore {
        self.store
    }

    /// Handles one fast-cycle sample: accumulates the light readings and
    /// stores the PIR sample if it changed anything.
    ///
    /// Returns whether a record was written.
    ///
    /// # Errors
    ///
    /// Returns an [`InputError`] for a malformed PIR sample or a timestamp
    /// regression, and a storage error if the PIR stream cannot be written.
    /// The recorder stays usable after either.
    pub fn on_fast(&mut self, raw_pir: &[u8], light: &[u16; LIGHT_CHANNELS], timestamp: u32) -> Result<bool> {
        self.slow.accumulate_light(light);
        let frame = reject(self.pir.process(raw_pir, timestamp), StreamId::Pir, timestamp)?;
        self.append(StreamId::Pir, frame.as_ref().map(|f| f.as_bytes()), timestamp)
    }

    /// Handles one slow-cycle bitstream, storing it with the mean of the
    /// light readings gathered since the previous one.
    ///
    /// Returns whether a record was written.
    ///
    /// # Errors
    ///
    /// See [`Recorder::on_fast`].
    pub fn on_slow(&mut self, raw: &[u8], timestamp: u32) -> Result<bool> {
        let frame = reject(self.slow.process(raw, timestamp), StreamId::Atmospheric, timestamp)?;
        self.append(StreamId::Atmospheric, frame.as_ref().map(|f| f.as_bytes()), timestamp)
    }

    /// Stores a raw plant sample behind its own timestamp package.
    ///
    /// # Errors
    ///
    /// See [`Recorder::on_fast`].
    pub fn on_plants(&mut self, raw: &[u8], timestamp: u32) -> Result<bool> {
        let frame = reject(self.plant_frame(raw, timestamp), StreamId::Plants, timestamp)?;
        self.last_plant = Some(timestamp);
        self.append(StreamId::Plants, Some(frame.as_bytes()), timestamp)
    }

    fn plant_frame(&self, raw: &[u8], timestamp: u32) -> std::result::Result<PlantFrame, InputError> {
        let raw: [u8; PLANT_RAW_LEN] = raw.try_into().map_err(|_| InputError::WrongLength {
            kind: "plant",
            expected: PLANT_RAW_LEN,
            actual: raw.len(),
        })?;
        if let Some(last) = self.last_plant
            && timestamp < last
        {
            return Err(InputError::TimestampRegression { timestamp, last });
        }

        let mut frame = PlantFrame::new();
        frame.push(&TimestampPackage::new(timestamp).to_bytes());
        frame.push(
            &PlantRecord {
                time_low: time_low(timestamp),
                raw,
            }
            .to_bytes(),
        );
        Ok(frame)
    }

    fn append(&self, stream: StreamId, bytes: Option<&[u8]>, timestamp: u32) -> Result<bool> {
        match bytes {
            Some(bytes) => {
                self.store.write_record(stream, bytes, timestamp)?;
                trace!(stream = %stream, timestamp, bytes = bytes.len(), "stored record");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Flushes every stream of the store.
    ///
    /// # Errors
    ///
    /// Returns the first storage error; the other streams are still flushed.
    pub fn flush(&self) -> Result<()> {
        self.store.flush_all()
    }
}

/// Logs and converts an encoding failure. Only the offending sample is lost.
fn reject<T>(result: std::result::Result<T, InputError>, stream: StreamId, timestamp: u32) -> Result<T> {
    result.map_err(|e| {
        warn!(stream = %stream, timestamp, error = %e, "dropped sample");
        e.into()
    })
}
