//! Streaming RAR decompression engine.
//!
//! Decodes RAR 1.5, 2.x, 3.x/4.x and 5.x packed data one archive member at a
//! time. Decoding is resumable: a [`DecodeSession`] can stop at any flush
//! point and pick up again later, and solid members share one window.
//!
//! ## Features
//! - `async` - tokio `AsyncRead`/`AsyncWrite` adapters and an async driver

mod crc32;
pub mod decompress;

pub use decompress::{
    decompress, ByteSink, ByteSource, DecodeSession, DecodeStatus, DecoderOptions,
    DecompressError, FormatVersion, MemberInfo, PauseHandle, PpmInput, PpmReset, PpmSource,
};
