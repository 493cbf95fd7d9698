//! RAR 3.x/4.x decoder.
//!
//! Blocks are either LZ, coded with four canonical tables, or PPMd. LZ
//! blocks can declare VM filters inline (symbol 257); PPMd blocks reach the
//! same declarations and a couple of match forms through an escape byte.

use log::{debug, trace, warn};

use super::codes::{
    with_extra, DIST_BASE, DIST_BITS, DIST_SLOTS, LENGTH_BASE, LENGTH_BITS, SHORT_DIST_BASE,
    SHORT_DIST_BITS,
};
use super::format::MetaLayout;
use super::huffman::{read_code_lengths, DecodeTable, TABLE_LOOKAHEAD};
use super::io::ByteSource;
use super::ppm::{self, PpmInput, PpmReset};
use super::session::{Core, Step};
use super::vm::VmFilters;
use super::{DecompressError, Result};

const MAIN_SYMBOLS: usize = 299;
const LOW_DIST_SYMBOLS: usize = 17;
const REP_SYMBOLS: usize = 28;
const TABLE_SIZE: usize = MAIN_SYMBOLS + DIST_SLOTS + LOW_DIST_SYMBOLS + REP_SYMBOLS;

/// Low-distance symbol that repeats the previous low bits.
const LOW_DIST_REPEAT: u16 = 16;
const LOW_DIST_REP_COUNT: u32 = 16;

/// Input a single PPMd symbol may consume.
const PPM_LOOKAHEAD: usize = 64;

const DEFAULT_ESC_CHAR: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Lz,
    Ppm,
}

pub struct Rar29State {
    main: DecodeTable,
    dist: DecodeTable,
    low_dist: DecodeTable,
    rep: DecodeTable,
    old_table: [u8; TABLE_SIZE],
    block: BlockKind,
    /// LZ tables survive into the next solid member.
    tables_read: bool,
    /// Tables must be read before the first token of this member.
    needs_tables: bool,
    esc_char: u8,
    prev_low_dist: u32,
    low_dist_rep_count: u32,
    pub filters: VmFilters,
}

impl Rar29State {
    pub fn new(max_filters: usize) -> Self {
        Self {
            main: DecodeTable::new(),
            dist: DecodeTable::new(),
            low_dist: DecodeTable::new(),
            rep: DecodeTable::new(),
            old_table: [0; TABLE_SIZE],
            block: BlockKind::Lz,
            tables_read: false,
            needs_tables: true,
            esc_char: DEFAULT_ESC_CHAR,
            prev_low_dist: 0,
            low_dist_rep_count: 0,
            filters: VmFilters::new(max_filters),
        }
    }

    /// Prepare for a member. Scheduled filter runs never carry over; the
    /// programs themselves do in solid mode.
    pub fn init(&mut self, solid: bool) {
        if !solid {
            self.tables_read = false;
            self.old_table.fill(0);
            self.esc_char = DEFAULT_ESC_CHAR;
            self.block = BlockKind::Lz;
            self.filters.reset();
        }
        self.filters.queue.clear();
        self.needs_tables = !solid || !self.tables_read;
    }

    pub async fn decode_token<S: ByteSource + ?Sized>(
        &mut self,
        core: &mut Core,
        src: &mut S,
    ) -> Result<Step> {
        if self.needs_tables {
            self.needs_tables = false;
            self.read_tables(core, src).await?;
            return Ok(Step::Continue);
        }
        match self.block {
            BlockKind::Lz => self.decode_lz(core, src).await,
            BlockKind::Ppm => self.decode_ppm(core, src).await,
        }
    }

    async fn decode_lz<S: ByteSource + ?Sized>(&mut self, core: &mut Core, src: &mut S) -> Result<Step> {
        let number = self.main.decode(&mut core.input);
        match number {
            0..=255 => core.put_literal(number as u8),
            256 => return self.read_end_of_block(core, src).await,
            257 => self.read_vm_code(core, src, false).await?,
            258 => {
                let (length, distance) = (core.history.last_length, core.history.old_dist[0]);
                if length != 0 {
                    core.copy_match(length, distance);
                }
            }
            259..=262 => {
                let distance = core.history.promote((number - 259) as usize);
                let slot = self.rep.decode(&mut core.input) as usize;
                let length = with_extra(&mut core.input, LENGTH_BASE[slot] + 2, LENGTH_BITS[slot]) as usize;
                core.history.remember(length, distance);
                core.copy_match(length, distance);
            }
            263..=270 => {
                let slot = (number - 263) as usize;
                let distance =
                    with_extra(&mut core.input, SHORT_DIST_BASE[slot] + 1, SHORT_DIST_BITS[slot]) as usize;
                core.history.insert(distance);
                core.history.remember(2, distance);
                core.copy_match(2, distance);
            }
            _ => {
                let slot = (number - 271) as usize;
                let mut length = with_extra(&mut core.input, LENGTH_BASE[slot] + 3, LENGTH_BITS[slot]) as usize;
                let distance = self.long_distance(core) as usize;
                if distance >= 0x2000 {
                    length += 1;
                    if distance >= 0x40000 {
                        length += 1;
                    }
                }
                core.history.insert(distance);
                core.history.remember(length, distance);
                core.copy_match(length, distance);
            }
        }
        Ok(Step::Continue)
    }

    /// Distance of a long match. Above slot 9 the low four bits come from
    /// their own table, which can repeat the previous value.
    fn long_distance(&mut self, core: &mut Core) -> u32 {
        let input = &mut core.input;
        let slot = self.dist.decode(input) as usize;
        let bits = DIST_BITS[slot] as u32;
        let mut distance = DIST_BASE[slot] + 1;
        if bits == 0 {
            return distance;
        }
        if slot <= 9 {
            return distance + input.read_bits(bits);
        }

        if bits > 4 {
            distance += (input.getbits() >> (20 - bits)) << 4;
            input.addbits(bits - 4);
        }
        if self.low_dist_rep_count > 0 {
            self.low_dist_rep_count -= 1;
            distance += self.prev_low_dist;
        } else {
            let low = self.low_dist.decode(input);
            if low == LOW_DIST_REPEAT {
                self.low_dist_rep_count = LOW_DIST_REP_COUNT - 1;
                distance += self.prev_low_dist;
            } else {
                distance += low as u32;
                self.prev_low_dist = low as u32;
            }
        }
        distance
    }

    /// Symbol 256: either new tables or the end of the member.
    async fn read_end_of_block<S: ByteSource + ?Sized>(
        &mut self,
        core: &mut Core,
        src: &mut S,
    ) -> Result<Step> {
        let bit_field = core.input.getbits();
        let (new_table, new_file) = if bit_field & 0x8000 != 0 {
            core.input.addbits(1);
            (true, false)
        } else {
            core.input.addbits(2);
            (bit_field & 0x4000 != 0, true)
        };
        self.tables_read = !new_table;
        if new_file {
            trace!("end of member, new tables next: {}", new_table);
            return Ok(Step::End);
        }
        self.read_tables(core, src).await?;
        Ok(Step::Continue)
    }

    async fn read_tables<S: ByteSource + ?Sized>(&mut self, core: &mut Core, src: &mut S) -> Result<()> {
        core.input.ensure(src, TABLE_LOOKAHEAD).await?;
        core.input.align();
        let bit_field = core.input.getbits();
        if bit_field & 0x8000 != 0 {
            self.block = BlockKind::Ppm;
            return self.begin_ppm(core);
        }

        self.block = BlockKind::Lz;
        self.prev_low_dist = 0;
        self.low_dist_rep_count = 0;
        if bit_field & 0x4000 == 0 {
            self.old_table.fill(0);
        }
        core.input.addbits(2);

        let mut lengths = [0u8; TABLE_SIZE];
        read_code_lengths(&mut core.input, MetaLayout::Rar29, &mut lengths, Some(&self.old_table))?;
        self.tables_read = true;
        if core.input.overrun() {
            return Ok(());
        }

        let (main, rest) = lengths.split_at(MAIN_SYMBOLS);
        let (dist, rest) = rest.split_at(DIST_SLOTS);
        let (low_dist, rep) = rest.split_at(LOW_DIST_SYMBOLS);
        self.main.build(main);
        self.dist.build(dist);
        self.low_dist.build(low_dist);
        self.rep.build(rep);
        self.old_table = lengths;
        trace!("3.x LZ tables read");
        Ok(())
    }

    /// Parse a PPMd block header and hand the rest to the model.
    fn begin_ppm(&mut self, core: &mut Core) -> Result<()> {
        if core.ppm.is_none() {
            warn!("PPMd block without a model");
            return Err(DecompressError::PpmUnavailable);
        }
        let flags = core.input.read_byte();
        let reset = if flags & 0x20 != 0 {
            let memory_mb = core.input.read_byte() as u32 + 1;
            Some(PpmReset {
                max_order: ppm::max_order(flags),
                memory_mb,
            })
        } else {
            None
        };
        if flags & 0x40 != 0 {
            self.esc_char = core.input.read_byte();
        }
        debug!("PPMd block: flags {:#04x}, escape {}, reset {:?}", flags, self.esc_char, reset);
        if reset.is_some_and(|r| r.max_order == 1) {
            warn!("PPMd block with model order 1");
            return Err(DecompressError::PpmCorrupt);
        }

        let Some(model) = core.ppm.as_mut() else {
            return Err(DecompressError::PpmUnavailable);
        };
        if !model.begin_block(reset, &mut PpmInput::new(&mut core.input)) {
            warn!("PPMd model refused block");
            return Err(DecompressError::PpmCorrupt);
        }
        Ok(())
    }

    async fn decode_ppm<S: ByteSource + ?Sized>(&mut self, core: &mut Core, src: &mut S) -> Result<Step> {
        let ch = ppm_symbol(core, src).await?;
        if ch != self.esc_char {
            core.put_literal(ch);
            return Ok(Step::Continue);
        }
        match ppm_symbol(core, src).await? {
            0 => self.read_tables(core, src).await?,
            2 => return Ok(Step::End),
            3 => self.read_vm_code(core, src, true).await?,
            4 => {
                let mut distance = 0usize;
                for _ in 0..3 {
                    distance = (distance << 8) | ppm_symbol(core, src).await? as usize;
                }
                let length = ppm_symbol(core, src).await? as usize;
                core.copy_match(length + 32, distance + 2);
            }
            5 => {
                let length = ppm_symbol(core, src).await? as usize;
                core.copy_match(length + 4, 1);
            }
            _ => core.put_literal(self.esc_char),
        }
        Ok(Step::Continue)
    }

    /// Read a filter declaration from the LZ bit stream or the PPMd model.
    async fn read_vm_code<S: ByteSource + ?Sized>(
        &mut self,
        core: &mut Core,
        src: &mut S,
        via_ppm: bool,
    ) -> Result<()> {
        let first_byte = code_byte(core, src, via_ppm).await?;
        let length = match (first_byte & 7) + 1 {
            7 => code_byte(core, src, via_ppm).await? as usize + 7,
            8 => {
                let high = code_byte(core, src, via_ppm).await? as usize;
                (high << 8) | code_byte(core, src, via_ppm).await? as usize
            }
            n => n as usize,
        };
        if length == 0 {
            return Err(DecompressError::InvalidFilter("empty filter declaration"));
        }

        let mut code = Vec::with_capacity(length);
        for _ in 0..length {
            code.push(code_byte(core, src, via_ppm).await?);
        }
        if core.input.overrun() {
            return Ok(());
        }
        trace!("filter declaration {:#04x}, {} bytes", first_byte, length);
        let window = &core.window;
        self.filters
            .add_code(first_byte, &code, window.unp_ptr, window.wr_ptr, window.mask())
    }
}

/// Next PPMd symbol; the model's failure is the stream's failure.
async fn ppm_symbol<S: ByteSource + ?Sized>(core: &mut Core, src: &mut S) -> Result<u8> {
    core.input.ensure(src, PPM_LOOKAHEAD).await?;
    let model = core.ppm.as_mut().ok_or(DecompressError::PpmUnavailable)?;
    model.decode_symbol(&mut PpmInput::new(&mut core.input)).ok_or_else(|| {
        warn!("PPMd model reported corrupt data");
        DecompressError::PpmCorrupt
    })
}

async fn code_byte<S: ByteSource + ?Sized>(core: &mut Core, src: &mut S, via_ppm: bool) -> Result<u8> {
    if via_ppm {
        return ppm_symbol(core, src).await;
    }
    if core.input.needs_refill() {
        core.input.refill(src).await?;
    }
    Ok(core.input.read_byte())
}
