//! Motion (PIR) sensor encoding.
//!
//! A raw fast-cycle PIR sample is two bytes:
//!
//! - byte 0: motion bitmask, one bit per channel
//! - byte 1: fault bitmask; the node sets a bit when that channel's reading
//!   is unreliable
//!
//! A channel is *confirmed on* when it shows motion in two consecutive
//! samples with no fault in either, and *confirmed off* when it shows no
//! motion in both. Anything else is left unconfirmed, which keeps single
//! noisy samples out of the log.

use crate::channel::MOTION_CHANNELS;
use crate::error::InputError;
use crate::package::{Frame, NORMAL_PACKAGE_LEN, NormalPackage, TIMESTAMP_PACKAGE_LEN, time_low};
use crate::timestamp::TimestampEncoder;

/// Length of a raw PIR sample in bytes.
pub const PIR_RAW_LEN: usize = 2;

/// An encoded PIR write: optional timestamp package plus normal package.
pub type PirFrame = Frame<{ TIMESTAMP_PACKAGE_LEN + NORMAL_PACKAGE_LEN }>;

/// Computes `(confirmed_ones, confirmed_zeros)` from two consecutive samples.
#[inline]
pub fn confirm(prev: [u8; PIR_RAW_LEN], cur: [u8; PIR_RAW_LEN]) -> (u8, u8) {
    let reliable = !(prev[1] | cur[1]);
    let ones = prev[0] & cur[0] & reliable;
    let zeros = !prev[0] & !cur[0] & reliable;
    (ones, zeros)
}

/// Turns raw PIR samples into deduplicated normal packages.
#[derive(Debug, Clone)]
pub struct PirEncoder {
    timestamps: TimestampEncoder,
    prev_raw: Option<[u8; PIR_RAW_LEN]>,
    last_stored: Option<(u8, u8)>,
}

impl PirEncoder {
    /// Creates an encoder re-emitting full timestamps every `refresh_secs`.
    pub fn new(refresh_secs: u32) -> Self {
        Self {
            timestamps: TimestampEncoder::new(refresh_secs),
            prev_raw: None,
            last_stored: None,
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

    /// Encodes a raw sample.
    ///
    /// Returns `None` when the sample equals the previous one, or when its
    /// confirmed bitmasks equal the last stored package. The first sample
    /// of a stream confirms nothing and is always stored.
    ///
    /// # Errors
    ///
    /// Returns [`InputError::WrongLength`] if `raw` is not two bytes and
    /// [`InputError::TimestampRegression`] if `timestamp` is earlier than
    /// the last stored package.
    pub fn process(&mut self, raw: &[u8], timestamp: u32) -> Result<Option<PirFrame>, InputError> {
        let raw: [u8; PIR_RAW_LEN] = raw.try_into().map_err(|_| InputError::WrongLength {
            kind: "pir",
            expected: PIR_RAW_LEN,
            actual: raw.len(),
        })?;

        if self.prev_raw == Some(raw) {
            return Ok(None);
        }

        let (confirmed_ones, confirmed_zeros) = match self.prev_raw {
            Some(prev) => confirm(prev, raw),
            None => (0, 0),
        };

        if self.last_stored == Some((confirmed_ones, confirmed_zeros)) {
            self.prev_raw = Some(raw);
            return Ok(None);
        }
        self.timestamps.check_order(timestamp)?;

        let record = NormalPackage {
            time_low: time_low(timestamp),
            confirmed_ones,
            confirmed_zeros,
        }
        .to_bytes();
        let mut frame = PirFrame::new();
        if let Some(package) = self.timestamps.stamp(timestamp, &record) {
            frame.push(&package.to_bytes());
        }
        frame.push(&record);

        self.prev_raw = Some(raw);
        self.last_stored = Some((confirmed_ones, confirmed_zeros));
        Ok(Some(frame))
    }
}

/// Replays normal packages into per-channel states for plotting.
///
/// Confirmed channels take 1.0 (on) or 0.0 (off); unconfirmed channels
/// keep their last confirmed state, starting at 0.0.
#[derive(Debug, Clone, Default)]
pub struct MotionState {
    state: [f64; MOTION_CHANNELS as usize],
}

impl MotionState {
    /// Creates a state with every channel off.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a package and returns the updated states.
    pub fn apply(&mut self, package: &NormalPackage) -> &[f64; MOTION_CHANNELS as usize] {
        for (bit, state) in self.state.iter_mut().enumerate() {
            let mask = 1u8 << bit;
            if package.confirmed_ones & mask != 0 {
                *state = 1.0;
            } else if package.confirmed_zeros & mask != 0 {
                *state = 0.0;
            }
        }
        &self.state
    }
}
