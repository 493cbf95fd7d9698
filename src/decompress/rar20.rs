//! RAR 2.x decoder.
//!
//! LZ blocks use three canonical tables. Multimedia blocks instead code each
//! byte as the error of a per-channel linear predictor, with one table per
//! channel.

use log::trace;

use super::codes::{
    with_extra, DIST_BASE, DIST_BITS, LENGTH_BASE, LENGTH_BITS, SHORT_DIST_BASE, SHORT_DIST_BITS,
};
use super::format::MetaLayout;
use super::huffman::{read_code_lengths, DecodeTable, TABLE_LOOKAHEAD};
use super::io::ByteSource;
use super::session::{Core, Step};
use super::Result;

const MAIN_SYMBOLS: usize = 298;
const DIST_SYMBOLS: usize = 48;
const REP_SYMBOLS: usize = 28;
const AUDIO_SYMBOLS: usize = 257;
const MAX_CHANNELS: usize = 4;

const AUDIO_BLOCK_END: u16 = 256;
const LZ_BLOCK_END: u16 = 269;

/// Adaptive predictor of one audio channel.
#[derive(Debug, Clone, Copy, Default)]
struct AudioPredictor {
    /// Weights of the four past deltas and the cross-channel delta.
    k: [i32; 5],
    d: [i32; 4],
    last_delta: i32,
    /// Accumulated error of each candidate weight change.
    dif: [u32; 11],
    byte_count: u32,
    last_char: i32,
}

impl AudioPredictor {
    fn decode(&mut self, delta: u32, channel_delta: &mut i32) -> u8 {
        self.byte_count = self.byte_count.wrapping_add(1);
        self.d[3] = self.d[2];
        self.d[2] = self.d[1];
        self.d[1] = self.last_delta - self.d[0];
        self.d[0] = self.last_delta;

        let k = self.k;
        let d = self.d;
        let prediction = 8 * self.last_char
            + k[0] * d[0]
            + k[1] * d[1]
            + k[2] * d[2]
            + k[3] * d[3]
            + k[4] * *channel_delta;
        let prediction = (prediction >> 3) & 0xff;
        let ch = prediction - delta as i32;

        let err = ((delta as u8 as i8) as i32) << 3;
        let cd = *channel_delta;
        let candidates = [
            err,
            err - d[0],
            err + d[0],
            err - d[1],
            err + d[1],
            err - d[2],
            err + d[2],
            err - d[3],
            err + d[3],
            err - cd,
            err + cd,
        ];
        for (acc, value) in self.dif.iter_mut().zip(candidates) {
            *acc = acc.wrapping_add(value.unsigned_abs());
        }

        self.last_delta = ch.wrapping_sub(self.last_char) as i8 as i32;
        *channel_delta = self.last_delta;
        self.last_char = ch;

        if self.byte_count & 0x1f == 0 {
            self.adapt();
        }
        ch as u8
    }

    /// Nudge the weight whose change would have cost least.
    fn adapt(&mut self) {
        let mut best = 0;
        for i in 1..self.dif.len() {
            if self.dif[i] < self.dif[best] {
                best = i;
            }
        }
        self.dif = [0; 11];
        if best == 0 {
            return;
        }
        let weight = &mut self.k[(best - 1) / 2];
        if best % 2 == 1 {
            if *weight >= -16 {
                *weight -= 1;
            }
        } else if *weight < 16 {
            *weight += 1;
        }
    }
}

pub struct Rar20State {
    main: DecodeTable,
    dist: DecodeTable,
    rep: DecodeTable,
    audio_tables: [DecodeTable; MAX_CHANNELS],
    /// Lengths of the previous block; new lengths are coded against them.
    old_table: [u8; AUDIO_SYMBOLS * MAX_CHANNELS],
    audio_block: bool,
    channels: usize,
    cur_channel: usize,
    channel_delta: i32,
    predictors: [AudioPredictor; MAX_CHANNELS],
    tables_read: bool,
}

impl Rar20State {
    pub fn new() -> Self {
        Self {
            main: DecodeTable::new(),
            dist: DecodeTable::new(),
            rep: DecodeTable::new(),
            audio_tables: std::array::from_fn(|_| DecodeTable::new()),
            old_table: [0; AUDIO_SYMBOLS * MAX_CHANNELS],
            audio_block: false,
            channels: 1,
            cur_channel: 0,
            channel_delta: 0,
            predictors: [AudioPredictor::default(); MAX_CHANNELS],
            tables_read: false,
        }
    }

    /// Prepare for a member. Solid members continue with the last tables.
    pub fn init(&mut self, solid: bool) {
        if !solid {
            *self = Self::new();
        }
    }

    pub async fn decode_token<S: ByteSource + ?Sized>(
        &mut self,
        core: &mut Core,
        src: &mut S,
    ) -> Result<Step> {
        if !self.tables_read {
            self.read_tables(core, src).await?;
            return Ok(Step::Continue);
        }

        if self.audio_block {
            let number = self.audio_tables[self.cur_channel].decode(&mut core.input);
            if number == AUDIO_BLOCK_END {
                self.read_tables(core, src).await?;
                return Ok(Step::Continue);
            }
            let byte = self.predictors[self.cur_channel].decode(number as u32, &mut self.channel_delta);
            core.put_literal(byte);
            self.cur_channel += 1;
            if self.cur_channel == self.channels {
                self.cur_channel = 0;
            }
            return Ok(Step::Continue);
        }

        let number = self.main.decode(&mut core.input);
        match number {
            0..=255 => core.put_literal(number as u8),
            LZ_BLOCK_END => self.read_tables(core, src).await?,
            256 => {
                let (length, distance) = (core.history.last_length, core.history.last_dist);
                copy_string(core, length, distance);
            }
            257..=260 => {
                let distance = core.history.ring_back((number - 256) as usize);
                let slot = self.rep.decode(&mut core.input) as usize;
                let mut length = with_extra(&mut core.input, LENGTH_BASE[slot] + 2, LENGTH_BITS[slot]) as usize;
                if distance >= 0x101 {
                    length += 1;
                    if distance >= 0x2000 {
                        length += 1;
                        if distance >= 0x40000 {
                            length += 1;
                        }
                    }
                }
                copy_string(core, length, distance);
            }
            261..=268 => {
                let slot = (number - 261) as usize;
                let distance = with_extra(&mut core.input, SHORT_DIST_BASE[slot] + 1, SHORT_DIST_BITS[slot]);
                copy_string(core, 2, distance as usize);
            }
            _ => {
                let slot = (number - 270) as usize;
                let mut length = with_extra(&mut core.input, LENGTH_BASE[slot] + 3, LENGTH_BITS[slot]) as usize;
                let dist_slot = self.dist.decode(&mut core.input) as usize;
                let distance =
                    with_extra(&mut core.input, DIST_BASE[dist_slot] + 1, DIST_BITS[dist_slot]) as usize;
                if distance >= 0x2000 {
                    length += 1;
                    if distance >= 0x40000 {
                        length += 1;
                    }
                }
                copy_string(core, length, distance);
            }
        }
        Ok(Step::Continue)
    }

    async fn read_tables<S: ByteSource + ?Sized>(&mut self, core: &mut Core, src: &mut S) -> Result<()> {
        core.input.ensure(src, TABLE_LOOKAHEAD).await?;
        let input = &mut core.input;

        let bit_field = input.getbits();
        self.audio_block = bit_field & 0x8000 != 0;
        if bit_field & 0x4000 == 0 {
            self.old_table.fill(0);
        }
        input.addbits(2);

        let table_size = if self.audio_block {
            self.channels = ((bit_field >> 12) & 3) as usize + 1;
            if self.cur_channel >= self.channels {
                self.cur_channel = 0;
            }
            input.addbits(2);
            AUDIO_SYMBOLS * self.channels
        } else {
            MAIN_SYMBOLS + DIST_SYMBOLS + REP_SYMBOLS
        };

        let mut lengths = [0u8; AUDIO_SYMBOLS * MAX_CHANNELS];
        let lengths = &mut lengths[..table_size];
        read_code_lengths(input, MetaLayout::Rar20, lengths, Some(&self.old_table[..table_size]))?;
        self.tables_read = true;
        if input.overrun() {
            return Ok(());
        }

        if self.audio_block {
            for (table, chunk) in self.audio_tables.iter_mut().zip(lengths.chunks(AUDIO_SYMBOLS)) {
                table.build(chunk);
            }
        } else {
            let (main, rest) = lengths.split_at(MAIN_SYMBOLS);
            let (dist, rep) = rest.split_at(DIST_SYMBOLS);
            self.main.build(main);
            self.dist.build(dist);
            self.rep.build(rep);
        }
        self.old_table[..table_size].copy_from_slice(lengths);
        trace!(
            "2.x tables: {}",
            if self.audio_block { "audio" } else { "lz" }
        );
        Ok(())
    }

    /// Pick up a table switch that trails the last token of a member, so a
    /// following solid member starts with the right tables.
    pub async fn read_last_tables<S: ByteSource + ?Sized>(
        &mut self,
        core: &mut Core,
        src: &mut S,
    ) -> Result<()> {
        if core.input.available() < 5 {
            return Ok(());
        }
        let switch = if self.audio_block {
            self.audio_tables[self.cur_channel].decode(&mut core.input) == AUDIO_BLOCK_END
        } else {
            self.main.decode(&mut core.input) == LZ_BLOCK_END
        };
        if switch {
            self.read_tables(core, src).await?;
        }
        Ok(())
    }
}

impl Default for Rar20State {
    fn default() -> Self {
        Self::new()
    }
}

fn copy_string(core: &mut Core, length: usize, distance: usize) {
    core.history.push_ring(distance);
    core.history.remember(length, distance);
    core.copy_match(length, distance);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predictor_tracks_constant_signal() {
        let mut p = AudioPredictor::default();
        let mut cd = 0;
        // The first byte is the negated delta.
        assert_eq!(p.decode(246, &mut cd), 10);
        // A flat signal then costs nothing.
        for _ in 0..40 {
            assert_eq!(p.decode(0, &mut cd), 10);
        }
        assert_eq!(cd, 0);
    }

    #[test]
    fn test_predictor_adapts_every_32_bytes() {
        let mut p = AudioPredictor::default();
        let mut cd = 0;
        for i in 0..31u32 {
            p.decode(i * 7 & 0xff, &mut cd);
        }
        assert!(p.dif.iter().any(|&d| d != 0));
        p.decode(3, &mut cd);
        assert_eq!(p.dif, [0; 11]);
        assert!(p.k.iter().all(|&k| (-17..=16).contains(&k)));
    }

    #[test]
    fn test_weight_adjustment_direction() {
        let mut p = AudioPredictor::default();
        p.dif = [9, 9, 9, 1, 9, 9, 9, 9, 9, 9, 9];
        p.adapt();
        assert_eq!(p.k, [0, -1, 0, 0, 0]);
        p.dif = [9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 1];
        p.adapt();
        assert_eq!(p.k, [0, -1, 0, 0, 1]);
    }

    #[test]
    fn test_non_solid_init_resets() {
        let mut state = Rar20State::new();
        state.tables_read = true;
        state.channel_delta = 5;
        state.init(true);
        assert!(state.tables_read);
        state.init(false);
        assert!(!state.tables_read);
        assert_eq!(state.channels, 1);
    }
}
