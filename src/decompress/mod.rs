//! RAR decompression engine.
//!
//! Decodes the packed payload of archive members written with the RAR 1.5,
//! 2.x, 3.x/4.x and 5.x algorithms. Container parsing is the caller's job:
//! hand the session a [`MemberInfo`] and a byte source positioned at the
//! member's packed data.
//!
//! ## Formats
//!
//! | Version code | [`FormatVersion`] | Algorithms |
//! |--------------|-------------------|------------|
//! | 15 | `V15` | Adaptive Huffman + LZ |
//! | 20, 26 | `V20` | Canonical Huffman + LZ, multimedia audio |
//! | 29 | `V29` | Canonical Huffman + LZ, PPMd blocks, VM filters |
//! | 50, 70 | `V50` | Canonical Huffman + LZ, built-in filters |
//!
//! ## Filter Support
//!
//! | Filter | 2.9 | 5.0 | Description |
//! |--------|-----|-----|-------------|
//! | Delta | ✅ | ✅ | Byte delta encoding (audio, images) |
//! | E8/E8E9 | ✅ | ✅ | x86 CALL/JMP address preprocessing |
//! | ARM | — | ✅ | ARM BL instruction preprocessing |
//! | Itanium | ✅ | — | IA-64 branch preprocessing |
//! | Audio | ✅ | — | Multi-channel audio predictor |
//! | RGB | ✅ | — | Predictive colour filter |
//! | Bytecode | ✅ | — | Arbitrary programs run on the RAR VM |
//!
//! ## Example
//!
//! ```rust
//! use rar_decode::{decompress, FormatVersion};
//!
//! // An empty member decodes to nothing.
//! let out = decompress(FormatVersion::V50, &[], 0, 0x20000).unwrap();
//! assert!(out.is_empty());
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Packed bytes (ByteSource)
//!       ↓
//! ┌─────────────┐
//! │ BitReader   │ ← Refillable big-endian bit buffer
//! └─────────────┘
//!       ↓
//! ┌─────────────┐
//! │ Huffman     │ ← Canonical tables (adaptive for 1.5)
//! └─────────────┘
//!       ↓
//! ┌─────────────┐
//! │ Window      │ ← Literals and back-references
//! └─────────────┘
//!       ↓
//! ┌─────────────┐
//! │ Filters     │ ← Applied while flushing (built-in or VM)
//! └─────────────┘
//!       ↓
//! Unpacked bytes (ByteSink)
//! ```

mod adaptive;
mod bit_reader;
mod codes;
mod filter;
mod format;
mod history;
mod huffman;
pub mod io;
mod output;
mod ppm;
mod rar15;
mod rar20;
mod rar29;
mod rar5;
mod session;
mod vm;
mod window;

#[cfg(test)]
mod tests;

pub use bit_reader::BitReader;
pub use format::{FilterFlavor, FormatConfig, FormatVersion, MetaLayout};
pub use huffman::DecodeTable;
pub use io::{ByteSink, ByteSource, ReadSource, WriteSink};
pub use ppm::{PpmInput, PpmReset, PpmSource};
pub use session::{
    decompress, DecodeSession, DecodeStatus, DecoderOptions, MemberInfo, PauseHandle,
};
pub use window::Window;

#[cfg(feature = "async")]
pub use io::{TokioSink, TokioSource};

use std::io as std_io;
use thiserror::Error;

/// Decompression errors.
#[derive(Debug, Error)]
pub enum DecompressError {
    /// The input ended before the member's declared size was produced.
    #[error("incomplete compressed data: {written} of {expected} bytes produced")]
    IncompleteData { written: u64, expected: u64 },
    #[error("invalid Huffman table")]
    InvalidHuffmanTable,
    #[error("block header checksum mismatch: stored {stored:#04x}, computed {computed:#04x}")]
    BlockChecksum { stored: u8, computed: u8 },
    #[error("invalid block header")]
    InvalidBlockHeader,
    #[error("invalid filter: {0}")]
    InvalidFilter(&'static str),
    #[error("too many pending filters")]
    FilterOverflow,
    #[error("unsupported compression version: {0}")]
    UnsupportedVersion(u8),
    /// A PPMd block was found but the session has no PPMd model attached.
    #[error("PPMd block encountered without a PPMd model")]
    PpmUnavailable,
    #[error("corrupt PPMd data")]
    PpmCorrupt,
    #[error("no member is active; call begin_member first")]
    NoActiveMember,
    #[error("invalid dictionary size: {0}")]
    InvalidWindowSize(u64),
    #[error("I/O error: {0}")]
    Io(#[from] std_io::Error),
}

pub type Result<T> = std::result::Result<T, DecompressError>;
