//! On-disk package layouts.
//!
//! Every stream is a header-less sequence of records, each optionally
//! preceded by a timestamp package. All multi-byte fields are little-endian.
//!
//! ```text
//! Timestamp package (4 bytes)     Normal PIR package (4 bytes)
//! +-----------+----------+        +----------+------+-------+
//! | time_high | time_low |        | time_low | ones | zeros |
//! |    u16    |   u16    |        |   u16    |  u8  |  u8   |
//! +-----------+----------+        +----------+------+-------+
//! ```
//!
//! The timestamp package puts `time_low` last so that it lines up with the
//! `time_low` of the record that follows it; the decoder relies on that to
//! tell the two apart (see [`crate::timestamp`]).

/// Size of a timestamp package in bytes.
pub const TIMESTAMP_PACKAGE_LEN: usize = 4;

/// Size of a normal PIR package in bytes.
pub const NORMAL_PACKAGE_LEN: usize = 4;

/// Returns the upper 16 bits of a unix timestamp.
#[inline]
#[allow(clippy::cast_possible_truncation)] // shifted down to 16 bits
pub const fn time_high(timestamp: u32) -> u16 {
    (timestamp >> 16) as u16
}

/// Returns the lower 16 bits of a unix timestamp.
#[inline]
#[allow(clippy::cast_possible_truncation)] // intentional truncation to the low half
pub const fn time_low(timestamp: u32) -> u16 {
    timestamp as u16
}

/// Rebuilds a unix timestamp from its two halves.
#[inline]
pub const fn join_time(high: u16, low: u16) -> u32 {
    ((high as u32) << 16) | low as u32
}

/// Describes a fixed-width record kind stored in a stream.
///
/// The scanner needs to know how long a record is, where its `time_low`
/// field sits and which byte patterns no encoder ever writes.
#[derive(Debug, Clone, Copy)]
pub struct RecordShape {
    /// Record width in bytes, excluding any leading timestamp package.
    pub len: usize,
    /// Byte offset of the little-endian `time_low` field inside the record.
    pub time_low_offset: usize,
    /// Returns `false` for record bytes that cannot have been encoded.
    pub plausible: fn(&[u8]) -> bool,
}

impl RecordShape {
    /// Reads the `time_low` field of a record. `record` must hold at least
    /// `time_low_offset + 2` bytes.
    #[inline]
    pub fn time_low(&self, record: &[u8]) -> u16 {
        let at = self.time_low_offset;
        u16::from_le_bytes([record[at], record[at + 1]])
    }
}

/// A full timestamp split into halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampPackage {
    /// Upper 16 bits of the unix time.
    pub high: u16,
    /// Lower 16 bits of the unix time.
    pub low: u16,
}

impl TimestampPackage {
    /// Splits a unix timestamp.
    pub const fn new(timestamp: u32) -> Self {
        Self {
            high: time_high(timestamp),
            low: time_low(timestamp),
        }
    }

    /// Serializes the package.
    pub fn to_bytes(self) -> [u8; TIMESTAMP_PACKAGE_LEN] {
        let [h0, h1] = self.high.to_le_bytes();
        let [l0, l1] = self.low.to_le_bytes();
        [h0, h1, l0, l1]
    }

    /// Parses a package from its four bytes.
    pub fn from_bytes(bytes: [u8; TIMESTAMP_PACKAGE_LEN]) -> Self {
        Self {
            high: u16::from_le_bytes([bytes[0], bytes[1]]),
            low: u16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }

    /// The joined unix timestamp.
    pub const fn timestamp(self) -> u32 {
        join_time(self.high, self.low)
    }
}

/// A PIR state change: which channels are confirmed on and which are
/// confirmed off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalPackage {
    /// Lower 16 bits of the unix time.
    pub time_low: u16,
    /// Channels confirmed on by two consecutive samples.
    pub confirmed_ones: u8,
    /// Channels confirmed off by two consecutive samples.
    pub confirmed_zeros: u8,
}

impl NormalPackage {
    /// Shape of a normal package inside the PIR stream.
    pub const SHAPE: RecordShape = RecordShape {
        len: NORMAL_PACKAGE_LEN,
        time_low_offset: 0,
        plausible: Self::is_plausible,
    };

    /// A channel is never confirmed on and off at once.
    pub fn is_plausible(bytes: &[u8]) -> bool {
        matches!(bytes, [_, _, ones, zeros] if ones & zeros == 0)
    }

    /// Serializes the package.
    pub fn to_bytes(self) -> [u8; NORMAL_PACKAGE_LEN] {
        let [l0, l1] = self.time_low.to_le_bytes();
        [l0, l1, self.confirmed_ones, self.confirmed_zeros]
    }

    /// Parses a package from its four bytes.
    pub fn from_bytes(bytes: [u8; NORMAL_PACKAGE_LEN]) -> Self {
        Self {
            time_low: u16::from_le_bytes([bytes[0], bytes[1]]),
            confirmed_ones: bytes[2],
            confirmed_zeros: bytes[3],
        }
    }
}

/// Size of a raw plant sample: one soil humidity byte per plant sensor.
pub const PLANT_RAW_LEN: usize = 3;

/// Size of a stored plant record.
pub const PLANT_RECORD_LEN: usize = PLANT_RAW_LEN + 2;

/// A raw plant sample behind the low half of its timestamp.
///
/// Plant records are stored as received. Every one is preceded by a
/// timestamp package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlantRecord {
    /// Lower 16 bits of the unix time.
    pub time_low: u16,
    /// Raw sensor bytes.
    pub raw: [u8; PLANT_RAW_LEN],
}

impl PlantRecord {
    /// Shape of a plant record inside the plant stream.
    pub const SHAPE: RecordShape = RecordShape {
        len: PLANT_RECORD_LEN,
        time_low_offset: 0,
        plausible: Self::is_plausible,
    };

    /// Plant bytes are stored as received, so any value is possible.
    pub fn is_plausible(bytes: &[u8]) -> bool {
        bytes.len() == PLANT_RECORD_LEN
    }

    /// Serializes the record.
    pub fn to_bytes(self) -> [u8; PLANT_RECORD_LEN] {
        let [l0, l1] = self.time_low.to_le_bytes();
        let [a, b, c] = self.raw;
        [l0, l1, a, b, c]
    }

    /// Parses a record from its bytes.
    pub fn from_bytes(bytes: [u8; PLANT_RECORD_LEN]) -> Self {
        Self {
            time_low: u16::from_le_bytes([bytes[0], bytes[1]]),
            raw: [bytes[2], bytes[3], bytes[4]],
        }
    }
}

/// Fixed-capacity byte buffer holding one encoded write: an optional
/// timestamp package followed by a record.
///
/// Encoders hand these to the store so that the pair is appended in one
/// call and never split by a cache flush. Lives on the stack.
#[derive(Debug, Clone, Copy)]
pub struct Frame<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> Frame<N> {
    pub(crate) const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
        }
    }

    /// Appends bytes. Callers size `N` for the largest write they produce.
    pub(crate) fn push(&mut self, bytes: &[u8]) {
        let end = self.len + bytes.len();
        self.buf[self.len..end].copy_from_slice(bytes);
        self.len = end;
    }

    /// The encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Whether a timestamp package leads the frame.
    pub fn has_timestamp(&self, record_len: usize) -> bool {
        self.len == record_len + TIMESTAMP_PACKAGE_LEN
    }
}

impl<const N: usize> AsRef<[u8]> for Frame<N> {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}
