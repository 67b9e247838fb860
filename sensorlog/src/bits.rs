//! MSB-first bit packing over byte slices.
//!
//! Used for the environmental bitstream, whose fields are 9, 10 and 13 bits
//! wide and packed back to back without padding.

/// Bit-level writer into a caller-owned buffer.
#[derive(Debug)]
pub struct BitWriter<'a> {
    buf: &'a mut [u8],
    bit_pos: usize,
}

impl<'a> BitWriter<'a> {
    /// Starts writing at the first bit of `buf`. The buffer is not cleared.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, bit_pos: 0 }
    }

    /// Writes the lowest `width` bits of `value`, most significant first.
    /// Bits past the end of the buffer are dropped.
    pub fn write(&mut self, value: u16, width: u8) {
        for i in (0..width).rev() {
            let bit = (value >> i) & 1 == 1;
            let byte = self.bit_pos / 8;
            if byte < self.buf.len() {
                let mask = 1u8 << (7 - self.bit_pos % 8);
                if bit {
                    self.buf[byte] |= mask;
                } else {
                    self.buf[byte] &= !mask;
                }
            }
            self.bit_pos += 1;
        }
    }

    /// Number of bits written so far.
    pub fn position(&self) -> usize {
        self.bit_pos
    }
}

/// Bit-level reader over a byte slice.
#[derive(Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    /// Starts reading at the first bit of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, bit_pos: 0 }
    }

    /// Reads `width` bits (at most 16) as an unsigned value. Bits past the
    /// end of the data read as zero.
    pub fn read(&mut self, width: u8) -> u16 {
        let mut value = 0u16;
        for _ in 0..width {
            let byte = self.bit_pos / 8;
            let bit = self
                .data
                .get(byte)
                .is_some_and(|b| (b >> (7 - self.bit_pos % 8)) & 1 == 1);
            value = (value << 1) | u16::from(bit);
            self.bit_pos += 1;
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_straddle_bytes() {
        let mut buf = [0u8; 4];
        let mut w = BitWriter::new(&mut buf);
        w.write(0b1_0000_0001, 9);
        w.write(0b11_1111_1111, 10);
        w.write(0b101, 3);
        assert_eq!(w.position(), 22);
        assert_eq!(buf, [0b1000_0000, 0b1111_1111, 0b1111_0100, 0]);

        let mut r = BitReader::new(&buf);
        assert_eq!(r.read(9), 0b1_0000_0001);
        assert_eq!(r.read(10), 0b11_1111_1111);
        assert_eq!(r.read(3), 0b101);
    }

    #[test]
    fn test_overwrite_clears_bits() {
        let mut buf = [0xFFu8; 1];
        BitWriter::new(&mut buf).write(0, 4);
        assert_eq!(buf, [0x0F]);
    }

    #[test]
    fn test_read_past_end_is_zero() {
        let data = [0xFFu8];
        let mut r = BitReader::new(&data);
        assert_eq!(r.read(8), 0xFF);
        assert_eq!(r.read(4), 0);
    }
}
