//! Seam to an external PPMd (variant H) model.
//!
//! RAR 3.x can switch any block to PPMd. The engine parses the block header
//! and the escape codes itself; the model only turns input bytes into
//! symbols. Sessions without a model fail with
//! [`DecompressError::PpmUnavailable`](super::DecompressError::PpmUnavailable)
//! on the first PPMd block.

use super::BitReader;

/// Parameters of a model restart announced in a PPMd block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PpmReset {
    /// Model order, 2..=64.
    pub max_order: u32,
    /// Sub-allocator size in MiB.
    pub memory_mb: u32,
}

/// Byte-level view of the packed input handed to the model.
///
/// Reading past the buffered input yields zeros; the engine detects the
/// overrun after the symbol is returned.
pub struct PpmInput<'a> {
    reader: &'a mut BitReader,
}

impl<'a> PpmInput<'a> {
    pub(crate) fn new(reader: &'a mut BitReader) -> Self {
        Self { reader }
    }

    /// Next input byte.
    #[inline]
    pub fn next_byte(&mut self) -> u8 {
        self.reader.read_byte()
    }
}

/// A PPMd model consumed as a symbol source.
pub trait PpmSource: Send {
    /// Start a PPMd block. `reset` carries new model parameters when the
    /// block restarts the model; otherwise the model continues with its
    /// current statistics. Implementations initialise their range decoder
    /// from `input` here. Returns `false` when the model cannot continue.
    fn begin_block(&mut self, reset: Option<PpmReset>, input: &mut PpmInput<'_>) -> bool;

    /// Decode one symbol, or `None` when the data is corrupt.
    fn decode_symbol(&mut self, input: &mut PpmInput<'_>) -> Option<u8>;
}

/// Model order from the low five bits of the PPMd flags byte.
pub(crate) fn max_order(flags: u8) -> u32 {
    let order = (flags & 0x1f) as u32 + 1;
    if order > 16 {
        16 + (order - 16) * 3
    } else {
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_order() {
        assert_eq!(max_order(0x00), 1);
        assert_eq!(max_order(0x05), 6);
        assert_eq!(max_order(0x0f), 16);
        assert_eq!(max_order(0x10), 19);
        assert_eq!(max_order(0x1f), 64);
    }

    #[test]
    fn test_input_reads_bytes() {
        let mut reader = BitReader::from_bytes(&[1, 2]);
        let mut input = PpmInput::new(&mut reader);
        assert_eq!(input.next_byte(), 1);
        assert_eq!(input.next_byte(), 2);
        assert_eq!(input.next_byte(), 0);
        assert!(reader.overrun());
    }
}
