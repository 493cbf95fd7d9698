//! RAR 5 block headers and code tables.
//!
//! Each block opens on a byte boundary with a flags byte, a checksum byte
//! and a 1 to 3 byte little-endian size. Tables follow when the header says
//! so; otherwise the block reuses the previous ones.

use log::debug;

use crate::decompress::format::MetaLayout;
use crate::decompress::huffman::{read_code_lengths, DecodeTable};
use crate::decompress::{BitReader, DecompressError, Result};

pub const MAIN_SYMBOLS: usize = 306;
pub const DIST_SYMBOLS: usize = 64;
pub const LOW_DIST_SYMBOLS: usize = 16;
pub const REP_SYMBOLS: usize = 44;
const TABLE_SIZE: usize = MAIN_SYMBOLS + DIST_SYMBOLS + LOW_DIST_SYMBOLS + REP_SYMBOLS;

const CHECKSUM_SEED: u8 = 0x5a;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHeader {
    /// Payload bytes after the header.
    pub size: usize,
    /// Valid bits in the payload's last byte, 1..=8.
    pub bit_size: u32,
    pub last_in_file: bool,
    pub table_present: bool,
}

impl BlockHeader {
    /// Parse a header at the next byte boundary.
    pub fn read(input: &mut BitReader) -> Result<Self> {
        input.align();
        let flags = input.read_byte();
        let byte_count = ((flags >> 3) & 3) as usize + 1;
        if byte_count == 4 {
            return Err(DecompressError::InvalidBlockHeader);
        }
        let stored = input.read_byte();
        let mut size = 0usize;
        for i in 0..byte_count {
            size |= (input.read_byte() as usize) << (i * 8);
        }

        let computed = CHECKSUM_SEED ^ flags ^ size as u8 ^ (size >> 8) as u8 ^ (size >> 16) as u8;
        if computed != stored {
            return Err(DecompressError::BlockChecksum { stored, computed });
        }
        Ok(Self {
            size,
            bit_size: (flags & 7) as u32 + 1,
            last_in_file: flags & 0x40 != 0,
            table_present: flags & 0x80 != 0,
        })
    }
}

/// The four tables of a RAR 5 block.
#[derive(Default)]
pub struct BlockTables {
    pub main: DecodeTable,
    pub dist: DecodeTable,
    pub low_dist: DecodeTable,
    pub rep: DecodeTable,
}

impl BlockTables {
    /// Read and build all four tables. Lengths stand alone, with no
    /// reference to the previous block. Tables cut short by the end of
    /// input are left unbuilt for the caller to report.
    pub fn read(&mut self, input: &mut BitReader) -> Result<()> {
        let mut lengths = [0u8; TABLE_SIZE];
        read_code_lengths(input, MetaLayout::Rar50, &mut lengths, None)?;
        if input.overrun() {
            return Ok(());
        }
        let (main, rest) = lengths.split_at(MAIN_SYMBOLS);
        let (dist, rest) = rest.split_at(DIST_SYMBOLS);
        let (low_dist, rep) = rest.split_at(LOW_DIST_SYMBOLS);
        self.main.build(main);
        self.dist.build(dist);
        self.low_dist.build(low_dist);
        self.rep.build(rep);
        debug!("5.x tables read");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::decompress::bit_reader::BitWriter;

    /// Emit an aligned block header for `size` payload bytes.
    pub(crate) fn put_header(w: &mut BitWriter, size: usize, bit_size: u32, last: bool, table: bool) {
        let byte_count = match size {
            0..=0xff => 1,
            0x100..=0xffff => 2,
            _ => 3,
        };
        let mut flags = ((byte_count - 1) << 3) as u8 | (bit_size - 1) as u8;
        if last {
            flags |= 0x40;
        }
        if table {
            flags |= 0x80;
        }
        let checksum = CHECKSUM_SEED ^ flags ^ size as u8 ^ (size >> 8) as u8 ^ (size >> 16) as u8;
        w.align();
        w.put(flags as u32, 8);
        w.put(checksum as u32, 8);
        for i in 0..byte_count {
            w.put(((size >> (i * 8)) & 0xff) as u32, 8);
        }
    }

    #[test]
    fn test_header_fields() {
        let mut w = BitWriter::new();
        put_header(&mut w, 0x1234, 5, true, true);
        let data = w.finish();
        let mut input = BitReader::from_bytes(&data);
        let header = BlockHeader::read(&mut input).unwrap();
        assert_eq!(
            header,
            BlockHeader {
                size: 0x1234,
                bit_size: 5,
                last_in_file: true,
                table_present: true,
            }
        );
        assert_eq!(input.byte_pos(), 4);
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut w = BitWriter::new();
        put_header(&mut w, 10, 8, false, true);
        let mut data = w.finish();
        data[1] ^= 0x01;
        let mut input = BitReader::from_bytes(&data);
        assert!(matches!(
            BlockHeader::read(&mut input),
            Err(DecompressError::BlockChecksum { .. })
        ));
    }

    #[test]
    fn test_four_size_bytes_rejected() {
        let mut input = BitReader::from_bytes(&[0x18, 0, 0, 0, 0, 0]);
        assert!(matches!(
            BlockHeader::read(&mut input),
            Err(DecompressError::InvalidBlockHeader)
        ));
    }

    #[test]
    fn test_truncated_tables() {
        // Meta lengths start, then the input ends.
        let mut input = BitReader::from_bytes(&[0x44]);
        let mut tables = BlockTables::default();
        tables.read(&mut input).unwrap();
        assert!(input.overrun());
        assert_eq!(tables.main.max_symbols(), 0);
    }
}
