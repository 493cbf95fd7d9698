//! RAR 5.x decoder.
//!
//! The packed stream is a run of blocks, each with its own header and
//! optionally new tables. Filters are declared inline by type code and
//! applied from the window when their block is flushed.

mod block;

use log::{debug, trace, warn};

use self::block::{BlockHeader, BlockTables};
use super::filter::{FilterKind, PendingFilter, MAX_FILTER_BLOCK, MAX_PENDING_FILTERS};
use super::huffman::TABLE_LOOKAHEAD;
use super::io::ByteSource;
use super::session::{Core, Step};
use super::{BitReader, DecompressError, Result};

const FILTER_DELTA: u32 = 0;

/// A filter read while the queue was full, waiting for the flush the
/// session performs on [`Step::Flush`].
struct HeldFilter {
    kind: FilterKind,
    offset: usize,
    length: usize,
}

pub struct Rar5State {
    tables: BlockTables,
    header: BlockHeader,
    tables_read: bool,
    /// First block header of the member has been read.
    started: bool,
    pub filters: Vec<PendingFilter>,
    held: Option<HeldFilter>,
}

impl Rar5State {
    pub fn new() -> Self {
        Self {
            tables: BlockTables::default(),
            header: BlockHeader::default(),
            tables_read: false,
            started: false,
            filters: Vec::new(),
            held: None,
        }
    }

    /// Prepare for a member. Filters never carry over; tables do in solid
    /// mode.
    pub fn init(&mut self, solid: bool) {
        if !solid {
            self.tables_read = false;
        }
        self.started = false;
        self.header = BlockHeader::default();
        self.filters.clear();
        self.held = None;
    }

    pub async fn decode_token<S: ByteSource + ?Sized>(
        &mut self,
        core: &mut Core,
        src: &mut S,
    ) -> Result<Step> {
        if !self.started {
            self.started = true;
            self.read_block(core, src).await?;
            if !self.tables_read {
                return Err(DecompressError::InvalidHuffmanTable);
            }
        }
        if let Some(held) = self.held.take() {
            if self.filters.len() >= MAX_PENDING_FILTERS {
                warn!("dropping {} pending filters", self.filters.len());
                self.filters.clear();
            }
            self.push_filter(core, held);
        }
        while core.input.block_overread() {
            if self.header.last_in_file {
                core.input.clear_block_end();
                return Ok(Step::End);
            }
            self.read_block(core, src).await?;
        }

        let input = &mut core.input;
        let main_slot = self.tables.main.decode(input);
        match main_slot {
            0..=255 => core.put_literal(main_slot as u8),
            256 => return self.read_filter(core),
            257 => {
                let (length, distance) = (core.history.last_length, core.history.old_dist[0]);
                if length != 0 {
                    core.copy_match(length, distance);
                }
            }
            258..=261 => {
                let distance = core.history.promote((main_slot - 258) as usize);
                let slot = self.tables.rep.decode(input) as u32;
                let length = slot_to_length(input, slot);
                core.history.remember(length, distance);
                core.copy_match(length, distance);
            }
            _ => {
                let mut length = slot_to_length(input, (main_slot - 262) as u32);
                let distance = self.distance(input);
                if distance > 0x100 {
                    length += 1;
                    if distance > 0x2000 {
                        length += 1;
                        if distance > 0x40000 {
                            length += 1;
                        }
                    }
                }
                core.history.insert(distance);
                core.history.remember(length, distance);
                core.copy_match(length, distance);
            }
        }
        Ok(Step::Continue)
    }

    fn distance(&self, input: &mut BitReader) -> usize {
        let slot = self.tables.dist.decode(input) as u64;
        let mut distance = 1u64;
        if slot < 4 {
            return (distance + slot) as usize;
        }
        let bits = (slot / 2 - 1) as u32;
        distance += (2 | (slot & 1)) << bits;
        if bits >= 4 {
            if bits > 4 {
                distance += ((input.getbits32() >> (36 - bits)) as u64) << 4;
                input.addbits(bits - 4);
            }
            distance += self.tables.low_dist.decode(input) as u64;
        } else {
            distance += input.read_bits(bits) as u64;
        }
        distance as usize
    }

    /// Next block header and, when present, its tables.
    async fn read_block<S: ByteSource + ?Sized>(&mut self, core: &mut Core, src: &mut S) -> Result<()> {
        core.input.clear_block_end();
        core.input.ensure(src, TABLE_LOOKAHEAD).await?;
        self.header = BlockHeader::read(&mut core.input)?;
        core.input.set_block_end(self.header.size, self.header.bit_size);
        trace!(
            "block: {} bytes, last bits {}, tables {}, last {}",
            self.header.size,
            self.header.bit_size,
            self.header.table_present,
            self.header.last_in_file
        );
        if self.header.table_present {
            self.tables.read(&mut core.input)?;
            self.tables_read = true;
        }
        Ok(())
    }

    /// Symbol 256: a filter over a block starting ahead of the decode
    /// pointer.
    fn read_filter(&mut self, core: &mut Core) -> Result<Step> {
        let input = &mut core.input;
        let offset = read_filter_data(input) as usize;
        let mut length = read_filter_data(input) as usize;
        if length > MAX_FILTER_BLOCK {
            warn!("filter block of {} bytes skipped", length);
            length = 0;
        }
        let code = input.read_bits(3);
        let channels = if code == FILTER_DELTA {
            input.read_bits(5) as usize + 1
        } else {
            0
        };
        let kind = FilterKind::from_rar5(code, channels).ok_or(DecompressError::InvalidFilter("unknown filter type"))?;
        debug!("filter {:?} at +{}, {} bytes", kind, offset, length);

        let held = HeldFilter { kind, offset, length };
        if self.filters.len() >= MAX_PENDING_FILTERS {
            self.held = Some(held);
            return Ok(Step::Flush);
        }
        self.push_filter(core, held);
        Ok(Step::Continue)
    }

    fn push_filter(&mut self, core: &Core, held: HeldFilter) {
        let window = &core.window;
        self.filters.push(PendingFilter::new(
            held.kind,
            held.offset,
            held.length,
            window.unp_ptr,
            window.wr_ptr,
            window.mask(),
        ));
    }
}

impl Default for Rar5State {
    fn default() -> Self {
        Self::new()
    }
}

/// Match length for a length slot: four lengths per extra bit count.
fn slot_to_length(input: &mut BitReader, slot: u32) -> usize {
    if slot < 8 {
        return 2 + slot as usize;
    }
    let bits = slot / 4 - 1;
    let base = (4 | (slot & 3)) << bits;
    (2 + base + input.read_bits(bits)) as usize
}

/// Filter start or length: a 2-bit byte count, then that many bytes, low
/// byte first.
fn read_filter_data(input: &mut BitReader) -> u32 {
    let byte_count = input.read_bits(2) + 1;
    (0..byte_count).fold(0, |data, i| data | (input.read_byte() as u32) << (i * 8))
}

#[cfg(test)]
pub(crate) use block::tests::put_header;
