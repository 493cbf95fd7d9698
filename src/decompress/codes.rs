//! Length and distance slots shared by the 2.x and 3.x formats.
//!
//! A decoded slot selects a base value and a count of extra bits read
//! straight from the input.

use super::BitReader;

pub const LENGTH_BASE: [u32; 28] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8, 10, 12, 14, 16, 20, 24, 28, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160,
    192, 224,
];
pub const LENGTH_BITS: [u8; 28] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5,
];

pub const SHORT_DIST_BASE: [u32; 8] = [0, 4, 8, 16, 32, 64, 128, 192];
pub const SHORT_DIST_BITS: [u8; 8] = [2, 2, 3, 4, 5, 6, 6, 6];

pub const DIST_SLOTS: usize = 60;

/// Slots per extra-bit count, starting at zero extra bits.
const DIST_BIT_COUNTS: [usize; 19] = [4, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 14, 0, 12];

const fn dist_table() -> ([u32; DIST_SLOTS], [u8; DIST_SLOTS]) {
    let mut base = [0u32; DIST_SLOTS];
    let mut bits = [0u8; DIST_SLOTS];
    let mut dist = 0u32;
    let mut slot = 0;
    let mut bit_length = 0;
    while bit_length < DIST_BIT_COUNTS.len() {
        let mut j = 0;
        while j < DIST_BIT_COUNTS[bit_length] {
            base[slot] = dist;
            bits[slot] = bit_length as u8;
            dist += 1 << bit_length;
            slot += 1;
            j += 1;
        }
        bit_length += 1;
    }
    (base, bits)
}

const DIST_TABLE: ([u32; DIST_SLOTS], [u8; DIST_SLOTS]) = dist_table();
pub const DIST_BASE: [u32; DIST_SLOTS] = DIST_TABLE.0;
pub const DIST_BITS: [u8; DIST_SLOTS] = DIST_TABLE.1;

/// `base` plus `bits` extra bits from the input.
#[inline]
pub fn with_extra(reader: &mut BitReader, base: u32, bits: u8) -> u32 {
    base + reader.read_bits(bits as u32)
}
