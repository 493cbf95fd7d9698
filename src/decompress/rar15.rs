//! RAR 1.5 decoder.
//!
//! A flag byte, itself adaptively coded, chooses between literals and two
//! match encodings. The balance counters `nhfb` and `nlzb` track which of
//! the two has been paying off and swap the meaning of the flag bits.

use super::adaptive::{
    counter_saturated, counter_wrapped, decode_num, CharSet, NumTable, HF0, HF1, HF2, HF3, HF4, L1, L2,
};
use super::session::{Core, Step};

const SHORT_LEN1: [u32; 16] = [1, 3, 4, 4, 5, 6, 7, 8, 8, 4, 4, 5, 6, 6, 4, 0];
const SHORT_XOR1: [u32; 15] = [
    0, 0xa0, 0xd0, 0xe0, 0xf0, 0xf8, 0xfc, 0xfe, 0xff, 0xc0, 0x80, 0x90, 0x98, 0x9c, 0xb0,
];
const SHORT_LEN2: [u32; 16] = [2, 3, 3, 3, 4, 4, 5, 6, 6, 4, 4, 5, 6, 6, 4, 0];
const SHORT_XOR2: [u32; 15] = [
    0, 0x40, 0x60, 0xa0, 0xd0, 0xe0, 0xf0, 0xf8, 0xfc, 0xc0, 0x80, 0x90, 0x98, 0x9c, 0xb0,
];

pub struct Rar15State {
    ch_set: CharSet,
    ch_set_a: [u32; 256],
    ch_set_b: CharSet,
    ch_set_c: CharSet,
    avr_plc: u32,
    avr_plc_b: u32,
    avr_ln1: u32,
    avr_ln2: u32,
    avr_ln3: u32,
    num_huf: u32,
    nhfb: u32,
    nlzb: u32,
    max_dist3: u32,
    buf60: u32,
    flag_buf: u32,
    flags_cnt: i32,
    st_mode: bool,
    l_count: u32,
    /// First flag byte of the member has been read.
    primed: bool,
}

impl Rar15State {
    pub fn new() -> Self {
        let mut state = Self {
            ch_set: CharSet::new(|i| i << 8),
            ch_set_a: std::array::from_fn(|i| i as u32),
            ch_set_b: CharSet::new(|i| i << 8),
            ch_set_c: CharSet::new(|i| (i.wrapping_neg() & 0xff) << 8),
            avr_plc: 0x3500,
            avr_plc_b: 0,
            avr_ln1: 0,
            avr_ln2: 0,
            avr_ln3: 0,
            num_huf: 0,
            nhfb: 0x80,
            nlzb: 0x80,
            max_dist3: 0x2001,
            buf60: 0,
            flag_buf: 0,
            flags_cnt: 0,
            st_mode: false,
            l_count: 0,
            primed: false,
        };
        state.ch_set_b.correct();
        state
    }

    /// Prepare for a member. Solid members keep the tables and averages.
    pub fn init(&mut self, solid: bool) {
        if !solid {
            *self = Self::new();
        }
        self.flag_buf = 0;
        self.flags_cnt = 0;
        self.st_mode = false;
        self.l_count = 0;
        self.primed = false;
    }

    pub fn decode_token(&mut self, core: &mut Core) -> Step {
        if !self.primed {
            self.primed = true;
            self.get_flags_buf(core);
            self.flags_cnt = 8;
        }
        if self.st_mode {
            self.huff_decode(core);
            return Step::Continue;
        }

        self.next_flag(core);
        if self.flag_buf & 0x80 != 0 {
            self.flag_buf <<= 1;
            if self.nlzb > self.nhfb {
                self.long_lz(core);
            } else {
                self.huff_decode(core);
            }
        } else {
            self.flag_buf <<= 1;
            self.next_flag(core);
            if self.flag_buf & 0x80 != 0 {
                self.flag_buf <<= 1;
                if self.nlzb > self.nhfb {
                    self.huff_decode(core);
                } else {
                    self.long_lz(core);
                }
            } else {
                self.flag_buf <<= 1;
                self.short_lz(core);
            }
        }
        Step::Continue
    }

    fn next_flag(&mut self, core: &mut Core) {
        self.flags_cnt -= 1;
        if self.flags_cnt < 0 {
            self.get_flags_buf(core);
            self.flags_cnt = 7;
        }
    }

    fn get_flags_buf(&mut self, core: &mut Core) {
        let place = decode_num(&mut core.input, &HF2) as usize;
        if place >= self.ch_set_c.set.len() {
            return;
        }
        let flags = self.ch_set_c.update(place, counter_wrapped);
        self.flag_buf = flags >> 8;
    }

    fn short_lz(&mut self, core: &mut Core) {
        self.num_huf = 0;
        let mut bit_field = core.input.getbits();
        if self.l_count == 2 {
            core.input.addbits(1);
            if bit_field >= 0x8000 {
                let (dist, len) = (core.history.last_dist as u32, core.history.last_length as u32);
                core.copy_match(len as usize, dist as usize);
                return;
            }
            bit_field <<= 1;
            self.l_count = 0;
        }
        let bit_field = (bit_field >> 8) & 0xff;

        let buf60 = self.buf60;
        let (lens, xors, wide_slot) = if self.avr_ln1 < 37 {
            (&SHORT_LEN1, &SHORT_XOR1, 1)
        } else {
            (&SHORT_LEN2, &SHORT_XOR2, 3)
        };
        let code_len = |i: usize| if i == wide_slot { buf60 + 3 } else { lens[i] };
        let length = (0..xors.len())
            .find(|&i| (bit_field ^ xors[i]) & !(0xff >> code_len(i)) & 0xff == 0)
            .unwrap_or(xors.len() - 1);
        core.input.addbits(code_len(length));
        let mut length = length as u32;

        if length >= 9 {
            if length == 9 {
                self.l_count += 1;
                let (dist, len) = (core.history.last_dist as u32, core.history.last_length as u32);
                core.copy_match(len as usize, dist as usize);
                return;
            }
            if length == 14 {
                self.l_count = 0;
                let length = decode_num(&mut core.input, &L2) + 5;
                let distance = (core.input.getbits() >> 1) | 0x8000;
                core.input.addbits(15);
                remember(core, distance, length, false);
                core.copy_match(length as usize, distance as usize);
                return;
            }

            self.l_count = 0;
            let save_length = length;
            let distance = core.history.ring_back((length - 9) as usize) as u32;
            length = decode_num(&mut core.input, &L1) + 2;
            if length == 0x101 && save_length == 10 {
                self.buf60 ^= 1;
                return;
            }
            if distance > 256 {
                length += 1;
            }
            if distance >= self.max_dist3 {
                length += 1;
            }
            remember(core, distance, length, true);
            core.copy_match(length as usize, distance as usize);
            return;
        }

        self.l_count = 0;
        self.avr_ln1 += length;
        self.avr_ln1 -= self.avr_ln1 >> 4;

        let place = (decode_num(&mut core.input, &HF2) & 0xff) as usize;
        let mut distance = self.ch_set_a[place];
        if place > 0 {
            self.ch_set_a[place] = self.ch_set_a[place - 1];
            self.ch_set_a[place - 1] = distance;
        }
        length += 2;
        distance += 1;
        remember(core, distance, length, true);
        core.copy_match(length as usize, distance as usize);
    }

    fn long_lz(&mut self, core: &mut Core) {
        self.num_huf = 0;
        self.nlzb += 16;
        if self.nlzb > 0xff {
            self.nlzb = 0x90;
            self.nhfb >>= 1;
        }
        let old_avr2 = self.avr_ln2;

        let bit_field = core.input.getbits();
        let mut length = if self.avr_ln2 >= 122 {
            decode_num(&mut core.input, &L2)
        } else if self.avr_ln2 >= 64 {
            decode_num(&mut core.input, &L1)
        } else if bit_field < 0x100 {
            core.input.addbits(16);
            bit_field
        } else {
            let zeros = (bit_field << 16).leading_zeros();
            core.input.addbits(zeros + 1);
            zeros
        };

        self.avr_ln2 += length;
        self.avr_ln2 -= self.avr_ln2 >> 5;

        let table: &NumTable = if self.avr_plc_b > 0x28ff {
            &HF2
        } else if self.avr_plc_b > 0x6ff {
            &HF1
        } else {
            &HF0
        };
        let place = decode_num(&mut core.input, table);
        self.avr_plc_b += place;
        self.avr_plc_b -= self.avr_plc_b >> 8;

        let entry = self.ch_set_b.update(place as usize, counter_wrapped);
        let distance = ((entry & 0xff00) | (core.input.getbits() >> 8)) >> 1;
        core.input.addbits(7);

        let old_avr3 = self.avr_ln3;
        if length != 1 && length != 4 {
            if length == 0 && distance <= self.max_dist3 {
                self.avr_ln3 += 1;
                self.avr_ln3 -= self.avr_ln3 >> 8;
            } else if self.avr_ln3 > 0 {
                self.avr_ln3 -= 1;
            }
        }
        length += 3;
        if distance >= self.max_dist3 {
            length += 1;
        }
        if distance <= 256 {
            length += 8;
        }
        self.max_dist3 = if old_avr3 > 0xb0 || (self.avr_plc >= 0x2a00 && old_avr2 < 0x40) {
            0x7f00
        } else {
            0x2001
        };
        remember(core, distance, length, true);
        core.copy_match(length as usize, distance as usize);
    }

    fn huff_decode(&mut self, core: &mut Core) {
        let bit_field = core.input.getbits();
        let table: &NumTable = match self.avr_plc {
            0x7600.. => &HF4,
            0x5e00.. => &HF3,
            0x3600.. => &HF2,
            0x0e00.. => &HF1,
            _ => &HF0,
        };
        let mut place = decode_num(&mut core.input, table) & 0xff;

        if self.st_mode {
            if place == 0 && bit_field > 0xfff {
                place = 0x100;
            }
            if place == 0 {
                let bit_field = core.input.getbits();
                core.input.addbits(1);
                if bit_field & 0x8000 != 0 {
                    self.num_huf = 0;
                    self.st_mode = false;
                    return;
                }
                let length = if bit_field & 0x4000 != 0 { 4 } else { 3 };
                core.input.addbits(1);
                let distance = decode_num(&mut core.input, &HF2);
                let distance = (distance << 5) | (core.input.getbits() >> 11);
                core.input.addbits(5);
                core.copy_match(length as usize, distance as usize);
                return;
            }
            place -= 1;
        } else {
            if self.num_huf >= 16 && self.flags_cnt == 0 {
                self.st_mode = true;
            }
            self.num_huf += 1;
        }

        self.avr_plc += place;
        self.avr_plc -= self.avr_plc >> 8;
        self.nhfb += 16;
        if self.nhfb > 0xff {
            self.nhfb = 0x90;
            self.nlzb >>= 1;
        }

        let entry = self.ch_set.update(place as usize, counter_saturated);
        core.put_literal((entry >> 8) as u8);
    }
}

/// Record a match; RAR 1.5 keeps most distances in the ring.
fn remember(core: &mut Core, distance: u32, length: u32, into_ring: bool) {
    if into_ring {
        core.history.push_ring(distance as usize);
    }
    core.history.remember(length as usize, distance as usize);
}

impl Default for Rar15State {
    fn default() -> Self {
        Self::new()
    }
}
