//! Environmental readings: temperature, humidity, CO2 and light.
//!
//! The node sends a 70-bit bitstream in 9 bytes every slow cycle:
//!
//! ```text
//! [T bed:9][T bathroom:9][T door:9][H bed:10][H bathroom:10][H door:10][CO2:13][pad:2]
//! ```
//!
//! - temperature: −10.0..40.0 °C as 0..500 (0.1 °C steps); 501 means below
//!   range, 502 above range
//! - humidity: 0.0..100.0 % as 0..1000
//! - CO2: 0..6000 ppm as is
//!
//! Light readings arrive on the fast cycle. A [`LightAggregator`] averages
//! them until the next slow sample, when the means are stored alongside it:
//!
//! ```text
//! Slow record (17 bytes)
//! +----------+----------------+-------------------------+
//! | time_low | bitstream (9)  | light means 3 × u16 LE  |
//! +----------+----------------+-------------------------+
//! ```
//!
//! `time_low` leads the record, as in the PIR stream, so the look-ahead in
//! [`crate::timestamp`] compares two halves of one bitstream rather than
//! fields of neighbouring records.

use crate::bits::{BitReader, BitWriter};
use crate::channel::{LightSensor, Room};
use crate::error::InputError;
use crate::package::{Frame, RecordShape, TIMESTAMP_PACKAGE_LEN, time_low};
use crate::timestamp::TimestampEncoder;

/// Length of the raw slow bitstream in bytes.
pub const SLOW_RAW_LEN: usize = 9;

/// Number of light channels averaged into each slow record.
pub const LIGHT_CHANNELS: usize = LightSensor::ALL.len();

/// Length of a stored slow record in bytes.
pub const SLOW_RECORD_LEN: usize = SLOW_RAW_LEN + LIGHT_CHANNELS * 2 + 2;

const TEMPERATURE_BITS: u8 = 9;
const HUMIDITY_BITS: u8 = 10;
const CO2_BITS: u8 = 13;

/// Raw temperature meaning "below −10.0 °C".
pub const TEMPERATURE_BELOW_RANGE: u16 = 501;
/// Raw temperature meaning "above 40.0 °C".
pub const TEMPERATURE_ABOVE_RANGE: u16 = 502;
/// Largest raw humidity value (100.0 %).
pub const HUMIDITY_MAX: u16 = 1000;
/// Largest raw CO2 value in ppm.
pub const CO2_MAX: u16 = 6000;

/// Converts a raw temperature to °C. The range sentinels clamp to the
/// edges of the measurable range.
pub fn celsius(raw: u16) -> f64 {
    match raw {
        TEMPERATURE_BELOW_RANGE => -10.0,
        TEMPERATURE_ABOVE_RANGE => 40.0,
        _ => f64::from(raw) / 10.0 - 10.0,
    }
}

/// Converts °C to the raw temperature encoding, using the sentinels for
/// values outside −10.0..=40.0.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // bounded to 0..=500 above
pub fn encode_celsius(celsius: f64) -> u16 {
    if celsius < -10.0 {
        TEMPERATURE_BELOW_RANGE
    } else if celsius > 40.0 {
        TEMPERATURE_ABOVE_RANGE
    } else {
        ((celsius + 10.0) * 10.0).round() as u16
    }
}

/// Converts a raw humidity value to percent.
pub fn humidity_percent(raw: u16) -> f64 {
    f64::from(raw) / 10.0
}

/// One decoded environmental sample, in raw integer units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlowReading {
    /// Raw temperature per [`Room`].
    pub temperature: [u16; 3],
    /// Raw humidity per [`Room`].
    pub humidity: [u16; 3],
    /// CO2 in ppm.
    pub co2: u16,
}

impl SlowReading {
    /// Parses and validates a raw bitstream handed over by the transport.
    ///
    /// # Errors
    ///
    /// Returns [`InputError::WrongLength`] if `raw` is not 9 bytes and
    /// [`InputError::FieldOutOfRange`] if a field exceeds its encoding.
    pub fn decode(raw: &[u8]) -> Result<Self, InputError> {
        let raw: &[u8; SLOW_RAW_LEN] = raw.try_into().map_err(|_| InputError::WrongLength {
            kind: "slow",
            expected: SLOW_RAW_LEN,
            actual: raw.len(),
        })?;
        let reading = Self::unpack(raw);
        reading.validate()?;
        Ok(reading)
    }

    /// Unpacks a bitstream without range checks. Used on stored records.
    pub fn unpack(raw: &[u8; SLOW_RAW_LEN]) -> Self {
        let mut r = BitReader::new(raw);
        let mut reading = Self::default();
        for t in &mut reading.temperature {
            *t = r.read(TEMPERATURE_BITS);
        }
        for h in &mut reading.humidity {
            *h = r.read(HUMIDITY_BITS);
        }
        reading.co2 = r.read(CO2_BITS);
        reading
    }

    /// Packs the reading into the 9-byte bitstream.
    ///
    /// # Errors
    ///
    /// Returns [`InputError::FieldOutOfRange`] if a field exceeds its encoding.
    pub fn encode(&self) -> Result<[u8; SLOW_RAW_LEN], InputError> {
        self.validate()?;
        let mut raw = [0u8; SLOW_RAW_LEN];
        let mut w = BitWriter::new(&mut raw);
        for &t in &self.temperature {
            w.write(t, TEMPERATURE_BITS);
        }
        for &h in &self.humidity {
            w.write(h, HUMIDITY_BITS);
        }
        w.write(self.co2, CO2_BITS);
        Ok(raw)
    }

    fn validate(&self) -> Result<(), InputError> {
        let check = |field, value, max| {
            if value > max {
                Err(InputError::FieldOutOfRange { field, value, max })
            } else {
                Ok(())
            }
        };
        for &t in &self.temperature {
            check("temperature", t, TEMPERATURE_ABOVE_RANGE)?;
        }
        for &h in &self.humidity {
            check("humidity", h, HUMIDITY_MAX)?;
        }
        check("co2", self.co2, CO2_MAX)
    }

    /// Temperature of `room` in °C.
    pub fn temperature_celsius(&self, room: Room) -> f64 {
        celsius(self.temperature[room.index()])
    }

    /// Humidity of `room` in %.
    pub fn humidity_percent(&self, room: Room) -> f64 {
        humidity_percent(self.humidity[room.index()])
    }
}

/// Running mean of fast-cycle light samples between two slow samples.
#[derive(Debug, Clone, Default)]
pub struct LightAggregator {
    sum: [u64; LIGHT_CHANNELS],
    count: u32,
}

impl LightAggregator {
    /// Creates an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one light sample per channel.
    pub fn accumulate(&mut self, readings: &[u16; LIGHT_CHANNELS]) {
        for (sum, &value) in self.sum.iter_mut().zip(readings) {
            *sum += u64::from(value);
        }
        self.count = self.count.saturating_add(1);
    }

    /// Number of samples since the last drain.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Returns the per-channel mean and resets sum and count. An empty
    /// aggregator drains to zeros.
    #[allow(clippy::cast_possible_truncation)] // a mean of u16 samples fits in u16
    pub fn drain_mean(&mut self) -> [u16; LIGHT_CHANNELS] {
        let mut mean = [0u16; LIGHT_CHANNELS];
        if self.count > 0 {
            for (m, sum) in mean.iter_mut().zip(self.sum) {
                *m = (sum / u64::from(self.count)) as u16;
            }
        }
        *self = Self::default();
        mean
    }
}

/// A stored environmental record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlowRecord {
    /// The bitstream exactly as received.
    pub raw: [u8; SLOW_RAW_LEN],
    /// Mean light level per [`LightSensor`].
    pub light: [u16; LIGHT_CHANNELS],
    /// Lower 16 bits of the unix time.
    pub time_low: u16,
}

impl SlowRecord {
    /// Shape of a slow record inside the atmospheric stream.
    pub const SHAPE: RecordShape = RecordShape {
        len: SLOW_RECORD_LEN,
        time_low_offset: 0,
        plausible: Self::is_plausible,
    };

    const RAW_AT: usize = 2;
    const LIGHT_AT: usize = Self::RAW_AT + SLOW_RAW_LEN;

    /// Serializes the record.
    pub fn to_bytes(&self) -> [u8; SLOW_RECORD_LEN] {
        let mut out = [0u8; SLOW_RECORD_LEN];
        out[..Self::RAW_AT].copy_from_slice(&self.time_low.to_le_bytes());
        out[Self::RAW_AT..Self::LIGHT_AT].copy_from_slice(&self.raw);
        for (i, value) in self.light.iter().enumerate() {
            let at = Self::LIGHT_AT + i * 2;
            out[at..at + 2].copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    /// Parses a record. Returns `None` if `bytes` is not exactly one record.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != SLOW_RECORD_LEN {
            return None;
        }
        let mut raw = [0u8; SLOW_RAW_LEN];
        raw.copy_from_slice(&bytes[Self::RAW_AT..Self::LIGHT_AT]);
        let mut light = [0u16; LIGHT_CHANNELS];
        for (i, value) in light.iter_mut().enumerate() {
            let at = Self::LIGHT_AT + i * 2;
            *value = u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        }
        Some(Self {
            raw,
            light,
            time_low: Self::SHAPE.time_low(bytes),
        })
    }

    /// Decodes the bitstream.
    pub fn reading(&self) -> SlowReading {
        SlowReading::unpack(&self.raw)
    }

    /// Whether `bytes` is a record whose bitstream holds in-range fields.
    pub fn is_plausible(bytes: &[u8]) -> bool {
        Self::from_bytes(bytes).is_some_and(|record| record.reading().validate().is_ok())
    }
}

/// An encoded slow write: optional timestamp package plus record.
pub type SlowFrame = Frame<{ TIMESTAMP_PACKAGE_LEN + SLOW_RECORD_LEN }>;

/// Turns slow bitstreams into deduplicated slow records.
///
/// Owns the [`LightAggregator`]; the fast path feeds it through
/// [`SlowEncoder::accumulate_light`].
#[derive(Debug, Clone)]
pub struct SlowEncoder {
    timestamps: TimestampEncoder,
    light: LightAggregator,
    prev_raw: Option<[u8; SLOW_RAW_LEN]>,
}

impl SlowEncoder {
    /// Creates an encoder re-emitting full timestamps every `refresh_secs`.
    pub fn new(refresh_secs: u32) -> Self {
        Self {
            timestamps: TimestampEncoder::new(refresh_secs),
            light: LightAggregator::new(),
            prev_raw: None,
        }
    }

    /// Creates an encoder that continues a stream whose newest record has
    /// timestamp `last_record`.
    pub fn resume(refresh_secs: u32, last_record: Option<u32>) -> Self {
        Self {
            timestamps: TimestampEncoder::resume(refresh_secs, last_record),
            ..Self::new(refresh_secs)
        }
    }

    /// Feeds one fast-cycle light sample into the running mean.
    pub fn accumulate_light(&mut self, readings: &[u16; LIGHT_CHANNELS]) {
        self.light.accumulate(readings);
    }

    /// The light aggregator.
    pub fn light(&self) -> &LightAggregator {
        &self.light
    }

    /// Encodes a slow sample. Returns `None` when the bitstream equals the
    /// previous one. The light mean is drained either way.
    ///
    /// # Errors
    ///
    /// Returns [`InputError`] for a malformed bitstream or a timestamp
    /// earlier than the last stored record. Nothing is drained or stored
    /// on error.
    pub fn process(&mut self, raw: &[u8], timestamp: u32) -> Result<Option<SlowFrame>, InputError> {
        SlowReading::decode(raw)?;
        self.timestamps.check_order(timestamp)?;
        let mut bitstream = [0u8; SLOW_RAW_LEN];
        bitstream.copy_from_slice(raw);

        let light = self.light.drain_mean();

        if self.prev_raw == Some(bitstream) {
            return Ok(None);
        }

        let record = SlowRecord {
            raw: bitstream,
            light,
            time_low: time_low(timestamp),
        }
        .to_bytes();
        let mut frame = SlowFrame::new();
        if let Some(package) = self.timestamps.stamp(timestamp, &record) {
            frame.push(&package.to_bytes());
        }
        frame.push(&record);

        self.prev_raw = Some(bitstream);
        Ok(Some(frame))
    }
}
