//! Canonical Huffman decoding for RAR.
//!
//! Code lengths go up to 15 bits. Short codes resolve through a quick lookup
//! table; longer ones scan the per-length upper limits.

use super::{format::MetaLayout, BitReader, DecompressError, Result};

/// Maximum code length in bits.
pub const MAX_CODE_LENGTH: usize = 15;

/// Quick table width for the large literal/length alphabets.
const QUICK_BITS_MAIN: u32 = 10;
/// Quick table width for everything else.
const QUICK_BITS_OTHER: u32 = 7;
const QUICK_SIZE: usize = 1 << QUICK_BITS_MAIN;

/// Buffered input a table read may need without refilling.
pub const TABLE_LOOKAHEAD: usize = 0x1000;

/// Main alphabet sizes that get the wide quick table.
const MAIN_ALPHABETS: [usize; 3] = [298, 299, 306];

/// Decode table rebuilt in place for every new block.
#[derive(Clone)]
pub struct DecodeTable {
    max_symbols: usize,
    /// Left-aligned upper code limit for each bit length.
    decode_len: [u32; 16],
    /// First position in `decode_num` for each bit length.
    decode_pos: [u32; 16],
    quick_bits: u32,
    quick_len: Box<[u8; QUICK_SIZE]>,
    quick_num: Box<[u16; QUICK_SIZE]>,
    /// Symbols sorted by code.
    decode_num: Vec<u16>,
}

impl DecodeTable {
    pub fn new() -> Self {
        Self {
            max_symbols: 0,
            decode_len: [0; 16],
            decode_pos: [0; 16],
            quick_bits: QUICK_BITS_OTHER,
            quick_len: Box::new([0; QUICK_SIZE]),
            quick_num: Box::new([0; QUICK_SIZE]),
            decode_num: Vec::new(),
        }
    }

    /// Table built from `lengths`, one entry per symbol.
    pub fn from_lengths(lengths: &[u8]) -> Self {
        let mut table = Self::new();
        table.build(lengths);
        table
    }

    pub fn max_symbols(&self) -> usize {
        self.max_symbols
    }

    /// Rebuild from code lengths. Length 0 marks an unused symbol; only the
    /// low four bits of each length count.
    pub fn build(&mut self, lengths: &[u8]) {
        let size = lengths.len();
        self.max_symbols = size;

        let mut length_count = [0u32; 16];
        for &len in lengths {
            length_count[(len & 0xf) as usize] += 1;
        }
        length_count[0] = 0;

        self.decode_num.clear();
        self.decode_num.resize(size, 0);
        self.decode_pos[0] = 0;
        self.decode_len[0] = 0;

        let mut upper_limit = 0u32;
        for i in 1..16 {
            upper_limit += length_count[i];
            self.decode_len[i] = upper_limit << (16 - i);
            upper_limit *= 2;
            self.decode_pos[i] = self.decode_pos[i - 1] + length_count[i - 1];
        }

        let mut next_pos = self.decode_pos;
        for (symbol, &len) in lengths.iter().enumerate() {
            let len = (len & 0xf) as usize;
            if len != 0 {
                let pos = next_pos[len] as usize;
                if let Some(slot) = self.decode_num.get_mut(pos) {
                    *slot = symbol as u16;
                }
                next_pos[len] += 1;
            }
        }

        self.quick_bits = if MAIN_ALPHABETS.contains(&size) {
            QUICK_BITS_MAIN
        } else {
            QUICK_BITS_OTHER
        };

        let mut cur_len = 1usize;
        for code in 0..(1usize << self.quick_bits) {
            let bit_field = (code as u32) << (16 - self.quick_bits);
            while cur_len < 16 && bit_field >= self.decode_len[cur_len] {
                cur_len += 1;
            }
            self.quick_len[code] = cur_len as u8;

            let dist = (bit_field - self.decode_len[cur_len - 1]) >> (16 - cur_len);
            self.quick_num[code] = if cur_len < 16 {
                let pos = (self.decode_pos[cur_len] + dist) as usize;
                if pos < size {
                    self.decode_num[pos]
                } else {
                    0
                }
            } else {
                0
            };
        }
    }

    /// Decode one symbol. Out-of-range codes decode to symbol 0.
    #[inline]
    pub fn decode(&self, reader: &mut BitReader) -> u16 {
        let bit_field = reader.getbits() & 0xfffe;
        if bit_field < self.decode_len[self.quick_bits as usize] {
            let code = (bit_field >> (16 - self.quick_bits)) as usize;
            reader.addbits(self.quick_len[code] as u32);
            return self.quick_num[code];
        }

        let mut bits = MAX_CODE_LENGTH;
        for i in (self.quick_bits as usize + 1)..MAX_CODE_LENGTH {
            if bit_field < self.decode_len[i] {
                bits = i;
                break;
            }
        }
        reader.addbits(bits as u32);

        let dist = bit_field.wrapping_sub(self.decode_len[bits - 1]) >> (16 - bits);
        let pos = self.decode_pos[bits].wrapping_add(dist) as usize;
        if pos >= self.max_symbols {
            0
        } else {
            self.decode_num[pos]
        }
    }
}

impl Default for DecodeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Read the meta table and then `out.len()` code lengths through it.
///
/// With `previous`, each plain length is added modulo 16 to the length at
/// the same index of the previous block's table.
pub fn read_code_lengths(
    reader: &mut BitReader,
    layout: MetaLayout,
    out: &mut [u8],
    previous: Option<&[u8]>,
) -> Result<()> {
    let meta_size = layout.meta_symbols();
    let mut meta = [0u8; 20];
    let mut i = 0;
    while i < meta_size {
        let len = reader.read_bits(4) as u8;
        if len == 15 && layout != MetaLayout::Rar20 {
            let zeros = reader.read_bits(4) as usize;
            if zeros == 0 {
                meta[i] = 15;
                i += 1;
            } else {
                let end = (i + zeros + 2).min(meta_size);
                meta[i..end].fill(0);
                i = end;
            }
        } else {
            meta[i] = len;
            i += 1;
        }
    }
    let meta_table = DecodeTable::from_lengths(&meta[..meta_size]);

    let size = out.len();
    let mut i = 0;
    while i < size {
        let number = meta_table.decode(reader);
        if number < 16 {
            let base = previous.and_then(|p| p.get(i)).copied().unwrap_or(0);
            out[i] = (number as u8).wrapping_add(base) & 0xf;
            i += 1;
            continue;
        }

        let (repeat_previous, count) = match (layout, number) {
            (MetaLayout::Rar20, 16) => (true, reader.read_bits(2) as usize + 3),
            (MetaLayout::Rar20, 17) => (false, reader.read_bits(3) as usize + 3),
            (MetaLayout::Rar20, _) => (false, reader.read_bits(7) as usize + 11),
            (_, 16) => (true, reader.read_bits(3) as usize + 3),
            (_, 17) => (true, reader.read_bits(7) as usize + 11),
            (_, 18) => (false, reader.read_bits(3) as usize + 3),
            _ => (false, reader.read_bits(7) as usize + 11),
        };
        let end = (i + count).min(size);
        if repeat_previous {
            if i == 0 {
                return Err(DecompressError::InvalidHuffmanTable);
            }
            let value = out[i - 1];
            out[i..end].fill(value);
        } else {
            out[i..end].fill(0);
        }
        i = end;
    }
    Ok(())
}

/// Canonical code for every symbol, as (code, length). Used to emit test
/// streams that the decoder must read back.
#[cfg(test)]
pub(crate) fn canonical_codes(lengths: &[u8]) -> Vec<(u32, u32)> {
    let mut count = [0u32; 16];
    for &l in lengths {
        count[(l & 0xf) as usize] += 1;
    }
    count[0] = 0;
    let mut next = [0u32; 16];
    let mut code = 0u32;
    for len in 1..16 {
        code = (code + count[len - 1]) << 1;
        next[len] = code;
    }
    lengths
        .iter()
        .map(|&l| {
            let l = (l & 0xf) as usize;
            if l == 0 {
                (0, 0)
            } else {
                let c = next[l];
                next[l] += 1;
                (c, l as u32)
            }
        })
        .collect()
}
