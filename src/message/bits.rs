//! Bit-granular reader and writer used by the packet codec.
//!
//! Bits are packed big-endian within each byte: the first bit written lands in
//! the most significant position of the current byte.

use log::warn;

use super::packet::MalformedMessage;

#[derive(Debug, Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    current: u8,
    used: u32,
}

impl BitWriter {
    pub fn new() -> BitWriter {
        BitWriter::default()
    }

    pub fn with_capacity(capacity: usize) -> BitWriter {
        BitWriter {
            bytes: Vec::with_capacity(capacity),
            current: 0,
            used: 0,
        }
    }

    /// Writes the low `n` bits of `value`. Values wider than `n` bits are
    /// truncated to their low bits and logged.
    pub fn write_bits(&mut self, value: u32, n: u32) {
        assert!(n <= 32, "cannot write more than 32 bits at once");

        let mut value = value;
        if n < 32 && value >> n != 0 {
            warn!("value {} does not fit in {} bits, truncating", value, n);
            value &= (1 << n) - 1;
        }

        if self.used == 0 && n % 8 == 0 {
            let bytes = value.to_be_bytes();
            self.bytes.extend_from_slice(&bytes[(4 - n / 8) as usize..]);
            return;
        }

        for i in (0..n).rev() {
            let bit = ((value >> i) & 1) as u8;
            self.current |= bit << (7 - self.used);
            self.used += 1;
            if self.used == 8 {
                self.bytes.push(self.current);
                self.current = 0;
                self.used = 0;
            }
        }
    }

    pub fn write_byte(&mut self, byte: u8) {
        self.write_bits(byte as u32, 8);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.used == 0 {
            self.bytes.extend_from_slice(bytes);
        } else {
            for byte in bytes {
                self.write_byte(*byte);
            }
        }
    }

    /// Number of complete bytes written so far.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty() && self.used == 0
    }

    /// Finishes the stream. A partially filled byte is padded with zero bits.
    pub fn into_bytes(mut self) -> Vec<u8> {
        if self.used > 0 {
            self.bytes.push(self.current);
        }
        self.bytes
    }
}

#[derive(Debug)]
pub struct BitReader<'a> {
    buf: &'a [u8],
    pos: usize,
    bit: u32,
}

impl<'a> BitReader<'a> {
    pub fn new(buf: &'a [u8]) -> BitReader<'a> {
        BitReader {
            buf,
            pos: 0,
            bit: 0,
        }
    }

    pub fn read_bits(&mut self, n: u32) -> Result<u32, MalformedMessage> {
        assert!(n <= 32, "cannot read more than 32 bits at once");

        if self.remaining_bits() < n as usize {
            return Err(MalformedMessage::Truncated);
        }

        let mut value: u32 = 0;
        for _ in 0..n {
            let bit = (self.buf[self.pos] >> (7 - self.bit)) & 1;
            value = value << 1 | bit as u32;
            self.bit += 1;
            if self.bit == 8 {
                self.bit = 0;
                self.pos += 1;
            }
        }
        Ok(value)
    }

    pub fn read_byte(&mut self) -> Result<u8, MalformedMessage> {
        if self.bit == 0 {
            let byte = *self.buf.get(self.pos).ok_or(MalformedMessage::Truncated)?;
            self.pos += 1;
            return Ok(byte);
        }
        self.read_bits(8).map(|b| b as u8)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, MalformedMessage> {
        if self.remaining_bits() < len * 8 {
            return Err(MalformedMessage::Truncated);
        }
        if self.bit == 0 {
            let bytes = self.buf[self.pos..self.pos + len].to_vec();
            self.pos += len;
            return Ok(bytes);
        }
        (0..len).map(|_| self.read_byte()).collect()
    }

    /// Looks at the next whole byte without consuming it.
    pub fn peek_byte(&self) -> Option<u8> {
        if self.bit != 0 {
            return None;
        }
        self.buf.get(self.pos).copied()
    }

    pub fn read_remaining(&mut self) -> Vec<u8> {
        let len = self.remaining_bits() / 8;
        self.read_bytes(len).unwrap_or_default()
    }

    pub fn has_remaining(&self) -> bool {
        self.remaining_bits() > 0
    }

    fn remaining_bits(&self) -> usize {
        (self.buf.len() - self.pos.min(self.buf.len())) * 8 - self.bit as usize
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_write_read_32_bits() {
        for value in [0x0000_0000u32, 0xFFFF_FFFF, 0x1234_5678, 0x8000_0001] {
            let mut writer = BitWriter::new();
            writer.write_bits(value, 32);
            let bytes = writer.into_bytes();
            assert_eq!(bytes.len(), 4);

            let mut reader = BitReader::new(&bytes);
            assert_eq!(reader.read_bits(32).unwrap(), value);
            assert!(!reader.has_remaining());
        }
    }

    #[test]
    fn test_sub_byte_fields_match_reference_vector() {
        // version=1, type=CON, option count=1, code=1, message id=0x1234
        let mut writer = BitWriter::new();
        writer.write_bits(1, 2);
        writer.write_bits(0, 2);
        writer.write_bits(1, 4);
        writer.write_bits(1, 8);
        writer.write_bits(0x1234, 16);
        assert_eq!(writer.into_bytes(), vec![0x41, 0x01, 0x12, 0x34]);
    }

    #[test]
    fn test_unaligned_round_trip() {
        let mut writer = BitWriter::new();
        writer.write_bits(0b101, 3);
        writer.write_bytes(&[0xAB, 0xCD]);
        writer.write_bits(0b11111, 5);
        let bytes = writer.into_bytes();
        assert_eq!(bytes.len(), 3);

        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read_bits(3).unwrap(), 0b101);
        assert_eq!(reader.read_bytes(2).unwrap(), vec![0xAB, 0xCD]);
        assert_eq!(reader.read_bits(5).unwrap(), 0b11111);
    }

    #[test]
    fn test_oversized_value_is_truncated() {
        let mut writer = BitWriter::new();
        writer.write_bits(0x1F, 4);
        writer.write_bits(0, 4);
        assert_eq!(writer.into_bytes(), vec![0xF0]);
    }

    #[test]
    fn test_partial_byte_is_zero_padded() {
        let mut writer = BitWriter::new();
        writer.write_bits(0b11, 2);
        assert_eq!(writer.into_bytes(), vec![0xC0]);
    }

    #[test]
    fn test_read_past_end() {
        let mut reader = BitReader::new(&[0xFF]);
        assert_eq!(reader.read_bits(4).unwrap(), 0xF);
        assert_eq!(reader.read_bits(8), Err(MalformedMessage::Truncated));
        assert_eq!(reader.read_bytes(1), Err(MalformedMessage::Truncated));
    }
}
