//! Bit reader for compressed data streams.
//!
//! Bits are consumed MSB first from a refillable 32 KiB window over the
//! packed input. Reads past the buffered data yield zero bits; the decode
//! loop notices the overrun at the next token boundary.

use super::io::ByteSource;
use std::io;

/// Bytes of packed input held at once.
pub const INPUT_BUF_SIZE: usize = 0x8000;

/// Slack kept between the read border and the end of buffered data.
const BORDER_SLACK: usize = 30;

/// Bit reader over a refillable input buffer.
pub struct BitReader {
    buf: Box<[u8]>,
    /// Byte position of the next unread bit.
    pos: usize,
    /// Bit offset inside `buf[pos]`, 0..8.
    bit: u32,
    /// Number of valid bytes in `buf`.
    top: usize,
    /// Position past which the decoder must call [`BitReader::refill`].
    border: usize,
    /// Source returned end of input.
    eof: bool,
    /// Exclusive end of the current RAR 5 block in buffer coordinates, with
    /// the number of valid bits in its last byte.
    block_end: Option<(usize, u32)>,
}

impl BitReader {
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; INPUT_BUF_SIZE].into_boxed_slice(),
            pos: 0,
            bit: 0,
            top: 0,
            border: 0,
            eof: false,
            block_end: None,
        }
    }

    /// Reader over an in-memory buffer. No further input will arrive.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut reader = Self::new();
        if data.len() > reader.buf.len() {
            reader.buf = data.to_vec().into_boxed_slice();
        } else {
            reader.buf[..data.len()].copy_from_slice(data);
        }
        reader.top = data.len();
        reader.eof = true;
        reader.update_border();
        reader
    }

    /// Drop all buffered input and start over for a new, unrelated stream.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.bit = 0;
        self.top = 0;
        self.border = 0;
        self.eof = false;
        self.block_end = None;
    }

    #[inline(always)]
    fn byte(&self, index: usize) -> u32 {
        if index < self.top {
            self.buf[index] as u32
        } else {
            0
        }
    }

    /// Next 16 bits, left-aligned, without consuming them.
    #[inline]
    pub fn getbits(&self) -> u32 {
        let p = self.pos;
        let v = (self.byte(p) << 16) | (self.byte(p + 1) << 8) | self.byte(p + 2);
        (v >> (8 - self.bit)) & 0xffff
    }

    /// Next 32 bits, left-aligned, without consuming them.
    #[inline]
    pub fn getbits32(&self) -> u32 {
        let p = self.pos;
        let v = (self.byte(p) << 24) | (self.byte(p + 1) << 16) | (self.byte(p + 2) << 8) | self.byte(p + 3);
        let v = v << self.bit;
        if self.bit == 0 {
            v
        } else {
            v | (self.byte(p + 4) >> (8 - self.bit))
        }
    }

    /// Consume `n` bits.
    #[inline]
    pub fn addbits(&mut self, n: u32) {
        let total = self.bit + n;
        self.pos += (total >> 3) as usize;
        self.bit = total & 7;
    }

    /// Read and consume up to 16 bits.
    #[inline]
    pub fn read_bits(&mut self, n: u32) -> u32 {
        debug_assert!(n <= 16);
        if n == 0 {
            return 0;
        }
        let v = self.getbits() >> (16 - n);
        self.addbits(n);
        v
    }

    /// Read and consume one byte at the current bit offset.
    #[inline]
    pub fn read_byte(&mut self) -> u8 {
        self.read_bits(8) as u8
    }

    /// Skip to the next byte boundary.
    #[inline]
    pub fn align(&mut self) {
        if self.bit != 0 {
            self.pos += 1;
            self.bit = 0;
        }
    }

    #[inline]
    pub fn byte_pos(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn bit_offset(&self) -> u32 {
        self.bit
    }

    /// Buffered bytes not yet consumed.
    pub fn available(&self) -> usize {
        self.top.saturating_sub(self.pos)
    }

    /// The source has reported end of input.
    pub fn is_exhausted(&self) -> bool {
        self.eof
    }

    /// More bits were consumed than the input ever held.
    pub fn overrun(&self) -> bool {
        self.pos > self.top || (self.pos == self.top && self.bit > 0)
    }

    /// Decoding has reached the read border and should refill first.
    #[inline]
    pub fn needs_refill(&self) -> bool {
        self.pos >= self.border
    }

    fn update_border(&mut self) {
        self.border = self.top.saturating_sub(BORDER_SLACK);
        if let Some((end, _)) = self.block_end {
            self.border = self.border.min(end.saturating_sub(1));
        }
    }

    /// Mark the end of a RAR 5 block `size` bytes past the current byte
    /// position, whose last byte carries `bit_size` valid bits.
    pub fn set_block_end(&mut self, size: usize, bit_size: u32) {
        self.block_end = Some((self.pos + size, bit_size));
        self.update_border();
    }

    pub fn clear_block_end(&mut self) {
        self.block_end = None;
        self.update_border();
    }

    /// All bits of the current RAR 5 block have been consumed.
    pub fn block_overread(&self) -> bool {
        match self.block_end {
            Some((end, bit_size)) => {
                self.pos >= end || (self.pos + 1 == end && self.bit >= bit_size)
            }
            None => false,
        }
    }

    /// Pull more input from `source`.
    ///
    /// Once more than half the buffer is consumed the unread tail is moved
    /// to the front. Returns `false` when the consumed position is already
    /// past the end of everything the source delivered.
    pub async fn refill<S: ByteSource + ?Sized>(&mut self, source: &mut S) -> io::Result<bool> {
        if self.pos > self.top {
            return Ok(false);
        }
        if self.eof {
            self.update_border();
            return Ok(true);
        }
        if self.pos > INPUT_BUF_SIZE / 2 {
            let shift = self.pos;
            self.buf.copy_within(shift..self.top, 0);
            self.top -= shift;
            self.pos = 0;
            if let Some((end, bits)) = self.block_end {
                self.block_end = Some((end.saturating_sub(shift), bits));
            }
        }
        while self.top < self.buf.len() {
            let n = source.read_into(&mut self.buf[self.top..]).await?;
            if n == 0 {
                self.eof = true;
                break;
            }
            self.top += n;
        }
        self.update_border();
        Ok(true)
    }

    /// Make sure at least `bytes` unread bytes are buffered, unless the
    /// source runs dry first.
    pub async fn ensure<S: ByteSource + ?Sized>(&mut self, source: &mut S, bytes: usize) -> io::Result<()> {
        if self.available() < bytes && !self.eof {
            self.refill(source).await?;
        }
        Ok(())
    }
}

impl Default for BitReader {
    fn default() -> Self {
        Self::new()
    }
}

/// MSB-first bit packer used to build test streams.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct BitWriter {
    bytes: Vec<u8>,
    acc: u64,
    used: u32,
}

#[cfg(test)]
impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, value: u32, bits: u32) {
        for i in (0..bits).rev() {
            self.acc = (self.acc << 1) | ((value >> i) & 1) as u64;
            self.used += 1;
            if self.used == 8 {
                self.bytes.push(self.acc as u8);
                self.acc = 0;
                self.used = 0;
            }
        }
    }

    pub fn align(&mut self) {
        if self.used > 0 {
            self.put(0, 8 - self.used);
        }
    }

    pub fn bit_len(&self) -> usize {
        self.bytes.len() * 8 + self.used as usize
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.align();
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompress::io::{block_on, ReadSource};

    #[test]
    fn test_getbits_is_left_aligned() {
        let reader = BitReader::from_bytes(&[0b1011_0100, 0b1100_1010, 0xff]);
        assert_eq!(reader.getbits(), 0b1011_0100_1100_1010);
    }

    #[test]
    fn test_read_bits_across_bytes() {
        let mut reader = BitReader::from_bytes(&[0b1011_0100, 0b1100_1010]);
        assert_eq!(reader.read_bits(4), 0b1011);
        assert_eq!(reader.read_bits(8), 0b0100_1100);
        assert_eq!(reader.read_bits(4), 0b1010);
        assert!(!reader.overrun());
        reader.addbits(1);
        assert!(reader.overrun());
    }

    #[test]
    fn test_getbits32_with_offset() {
        let mut reader = BitReader::from_bytes(&[0x12, 0x34, 0x56, 0x78, 0x9a]);
        reader.addbits(4);
        assert_eq!(reader.getbits32(), 0x2345_6789);
    }

    #[test]
    fn test_reads_past_end_are_zero() {
        let mut reader = BitReader::from_bytes(&[0xff]);
        reader.addbits(8);
        assert_eq!(reader.getbits(), 0);
        assert_eq!(reader.getbits32(), 0);
    }

    #[test]
    fn test_align() {
        let mut reader = BitReader::from_bytes(&[0xff, 0x81]);
        reader.addbits(3);
        reader.align();
        assert_eq!(reader.read_byte(), 0x81);
    }

    #[test]
    fn test_writer_round_trip() {
        let mut w = BitWriter::new();
        w.put(0b101, 3);
        w.put(0x1234, 16);
        w.put(1, 1);
        assert_eq!(w.bit_len(), 20);
        let bytes = w.finish();
        let mut reader = BitReader::from_bytes(&bytes);
        assert_eq!(reader.read_bits(3), 0b101);
        assert_eq!(reader.read_bits(16), 0x1234);
        assert_eq!(reader.read_bits(1), 1);
    }

    #[test]
    fn test_refill_moves_tail() {
        let data: Vec<u8> = (0..INPUT_BUF_SIZE * 2).map(|i| (i % 251) as u8).collect();
        let mut src = ReadSource::new(&data[..]);
        let mut reader = BitReader::new();
        assert!(block_on(reader.refill(&mut src)).unwrap());
        assert_eq!(reader.available(), INPUT_BUF_SIZE);

        let skip = INPUT_BUF_SIZE / 2 + 100;
        for _ in 0..skip {
            reader.addbits(8);
        }
        assert!(block_on(reader.refill(&mut src)).unwrap());
        assert_eq!(reader.byte_pos(), 0);
        assert_eq!(reader.read_byte(), (skip % 251) as u8);
    }

    #[test]
    fn test_block_end() {
        let mut reader = BitReader::from_bytes(&[0; 8]);
        reader.set_block_end(2, 3);
        reader.addbits(8);
        assert!(!reader.block_overread());
        reader.addbits(2);
        assert!(!reader.block_overread());
        reader.addbits(1);
        assert!(reader.block_overread());
    }
}
