//! Adaptive coding tables of the RAR 1.5 format.
//!
//! RAR 1.5 predates canonical Huffman tables. Symbols are coded by their
//! place in frequency-sorted character sets, with the place itself coded
//! by one of a few fixed prefix tables chosen from running averages.

use super::BitReader;

/// Fixed prefix code: `dec` holds left-aligned code limits, `pos` the
/// first value per code length.
pub struct NumTable {
    start: u32,
    dec: &'static [u32],
    pos: &'static [u32],
}

pub const L1: NumTable = NumTable {
    start: 2,
    dec: &[0x8000, 0xa000, 0xc000, 0xd000, 0xe000, 0xea00, 0xee00, 0xf000, 0xf200, 0xf200, 0xffff],
    pos: &[0, 0, 0, 2, 3, 5, 7, 11, 16, 20, 24, 32, 32],
};

pub const L2: NumTable = NumTable {
    start: 3,
    dec: &[0xa000, 0xc000, 0xd000, 0xe000, 0xea00, 0xee00, 0xf000, 0xf200, 0xf240, 0xffff],
    pos: &[0, 0, 0, 0, 5, 7, 9, 13, 18, 22, 26, 34, 36],
};

pub const HF0: NumTable = NumTable {
    start: 4,
    dec: &[0x8000, 0xc000, 0xe000, 0xf200, 0xf200, 0xf200, 0xf200, 0xf200, 0xffff],
    pos: &[0, 0, 0, 0, 0, 8, 16, 24, 33, 33, 33, 33, 33],
};

pub const HF1: NumTable = NumTable {
    start: 5,
    dec: &[0x2000, 0xc000, 0xe000, 0xf000, 0xf200, 0xf200, 0xf7e0, 0xffff],
    pos: &[0, 0, 0, 0, 0, 0, 4, 44, 60, 76, 80, 80, 127],
};

pub const HF2: NumTable = NumTable {
    start: 5,
    dec: &[0x1000, 0x2400, 0x8000, 0xc000, 0xfa00, 0xffff, 0xffff, 0xffff],
    pos: &[0, 0, 0, 0, 0, 0, 2, 7, 53, 117, 233, 0, 0],
};

pub const HF3: NumTable = NumTable {
    start: 6,
    dec: &[0x800, 0x2400, 0xee00, 0xfe80, 0xffff, 0xffff, 0xffff],
    pos: &[0, 0, 0, 0, 0, 0, 0, 2, 16, 218, 251, 0, 0],
};

pub const HF4: NumTable = NumTable {
    start: 8,
    dec: &[0xff00, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff],
    pos: &[0, 0, 0, 0, 0, 0, 0, 0, 0, 255, 0, 0, 0],
};

/// Decode one value with a fixed prefix table.
pub fn decode_num(reader: &mut BitReader, table: &NumTable) -> u32 {
    let num = reader.getbits() & 0xfff0;
    let mut bits = table.start;
    let mut i = 0;
    while table.dec[i] <= num {
        bits += 1;
        i += 1;
    }
    reader.addbits(bits);
    let base = if i > 0 { table.dec[i - 1] } else { 0 };
    ((num - base) >> (16 - bits)) + table.pos[bits as usize]
}

/// Frequency-sorted character set.
///
/// Each entry holds a value in the high byte and a use counter in the low
/// byte. `place` maps a counter to the next slot an entry moves to.
#[derive(Clone)]
pub struct CharSet {
    pub set: [u32; 256],
    place: [u8; 256],
}

impl CharSet {
    pub fn new(init: impl Fn(u32) -> u32) -> Self {
        Self {
            set: std::array::from_fn(|i| init(i as u32)),
            place: [0; 256],
        }
    }

    /// Reset every counter and spread entries over eight groups.
    pub fn correct(&mut self) {
        for (i, entry) in self.set.iter_mut().enumerate() {
            *entry = (*entry & !0xff) | (7 - (i / 32) as u32);
        }
        self.place = [0; 256];
        for i in 0..7 {
            self.place[i] = ((7 - i) * 32) as u8;
        }
    }

    /// Bump the entry at `index` and move it to its next place. `overflow`
    /// decides from the bumped entry whether the set must be corrected
    /// first. Returns the entry's value before the bump.
    pub fn update(&mut self, index: usize, overflow: fn(u32) -> bool) -> u32 {
        let index = index & 0xff;
        loop {
            let current = self.set[index];
            let counter = (current & 0xff) as usize;
            let new_place = self.place[counter] as usize;
            self.place[counter] = self.place[counter].wrapping_add(1);
            let bumped = current + 1;
            if overflow(bumped) {
                self.correct();
                continue;
            }
            self.set[index] = self.set[new_place];
            self.set[new_place] = bumped;
            return current;
        }
    }
}

/// Counter wrapped past a byte.
pub fn counter_wrapped(entry: u32) -> bool {
    entry & 0xff == 0
}

/// Literal set counters saturate early.
pub fn counter_saturated(entry: u32) -> bool {
    entry & 0xff > 0xa1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompress::bit_reader::BitWriter;

    #[test]
    fn test_decode_num_shortest_codes() {
        // 0b0 followed by padding: first L1 bucket, two bits.
        let mut reader = BitReader::from_bytes(&[0x00, 0x00]);
        assert_eq!(decode_num(&mut reader, &L1), 0);
        assert_eq!(reader.bit_offset(), 2);

        let mut reader = BitReader::from_bytes(&[0x40, 0x00]);
        assert_eq!(decode_num(&mut reader, &L1), 1);
    }

    #[test]
    fn test_decode_num_longer_code() {
        // 0x8000 lands in the second L1 bucket: three bits, value 2.
        let mut w = BitWriter::new();
        w.put(0b100, 3);
        w.put(0, 13);
        let data = w.finish();
        let mut reader = BitReader::from_bytes(&data);
        assert_eq!(decode_num(&mut reader, &L1), 2);
        assert_eq!(reader.bit_offset(), 3);
    }

    #[test]
    fn test_hf4_is_mostly_eight_bits() {
        let mut reader = BitReader::from_bytes(&[0x37, 0x00]);
        assert_eq!(decode_num(&mut reader, &HF4), 0x37);
        assert_eq!(reader.byte_pos(), 1);
    }

    #[test]
    fn test_correct_groups() {
        let mut set = CharSet::new(|i| i << 8);
        set.correct();
        assert_eq!(set.set[0] & 0xff, 7);
        assert_eq!(set.set[255] & 0xff, 0);
        assert_eq!(set.set[40], (40 << 8) | 6);
    }

    #[test]
    fn test_update_moves_entry() {
        let mut set = CharSet::new(|i| i << 8);
        // All counters are zero, so place[0] starts at slot 0.
        let old = set.update(5, counter_saturated);
        assert_eq!(old, 5 << 8);
        assert_eq!(set.set[0], (5 << 8) | 1);
        assert_eq!(set.set[5], 0);
    }
}
