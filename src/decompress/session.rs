//! Resumable decode sessions.
//!
//! A [`DecodeSession`] owns everything that outlives one call: the window,
//! the bit reader, the match history and the per-format state. Each call to
//! [`DecodeSession::decode_until_flush_or_pause`] runs the shared decode
//! loop until the member is done or a flush happens while paused.
//!
//! ```rust
//! use rar_decode::{DecodeSession, DecodeStatus, FormatVersion, MemberInfo};
//!
//! let mut session = DecodeSession::new();
//! session
//!     .begin_member(MemberInfo::new(FormatVersion::V29, 0, 0x40000))
//!     .unwrap();
//! let mut out: Vec<u8> = Vec::new();
//! let status = session
//!     .decode_until_flush_or_pause(&mut &b""[..], &mut out)
//!     .unwrap();
//! assert_eq!(status, DecodeStatus::Finished { written: 0 });
//! ```

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};

use super::format::FormatConfig;
use super::history::MatchHistory;
use super::io::{block_on, ByteSink, ByteSource, ReadSource, WriteSink};
use super::output::{self, Progress};
use super::ppm::PpmSource;
use super::rar15::Rar15State;
use super::rar20::Rar20State;
use super::rar29::Rar29State;
use super::rar5::Rar5State;
use super::{BitReader, DecompressError, FormatVersion, Result, Window};

/// Smallest window any member gets.
pub const MIN_WINDOW_SIZE: u64 = 0x40000;

/// Largest window a member may declare.
pub const MAX_WINDOW_SIZE: u64 = 64 << 30;

/// Engine limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderOptions {
    /// Members declaring a larger window are rejected.
    pub max_window_size: u64,
    /// Windows above this size are allocated in shards.
    pub contiguous_window_limit: usize,
    pub shard_size: usize,
    /// Filter slots and queued runs allowed for RAR 3.x members.
    pub max_vm_filters: usize,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            max_window_size: 4 << 30,
            contiguous_window_limit: 1 << 30,
            shard_size: 64 << 20,
            max_vm_filters: 8192,
        }
    }
}

impl DecoderOptions {
    pub fn with_max_window_size(mut self, size: u64) -> Self {
        self.max_window_size = size;
        self
    }

    pub fn with_contiguous_window_limit(mut self, limit: usize) -> Self {
        self.contiguous_window_limit = limit;
        self
    }

    pub fn with_shard_size(mut self, size: usize) -> Self {
        self.shard_size = size;
        self
    }

    pub fn with_max_vm_filters(mut self, count: usize) -> Self {
        self.max_vm_filters = count;
        self
    }
}

/// What the container says about one packed member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberInfo {
    pub version: FormatVersion,
    pub unpacked_size: u64,
    /// Dictionary size in bytes; rounded up to a power of two.
    pub window_size: u64,
    /// Continue from the previous member's window and tables.
    pub solid: bool,
}

impl MemberInfo {
    pub fn new(version: FormatVersion, unpacked_size: u64, window_size: u64) -> Self {
        Self {
            version,
            unpacked_size,
            window_size,
            solid: false,
        }
    }

    pub fn with_solid(mut self, solid: bool) -> Self {
        self.solid = solid;
        self
    }
}

/// Outcome of one decode call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// Stopped at a flush because the session was paused.
    Paused { written: u64 },
    /// The member is complete.
    Finished { written: u64 },
}

/// Shared pause flag. Clones control the same session.
#[derive(Debug, Clone, Default)]
pub struct PauseHandle(Arc<AtomicBool>);

impl PauseHandle {
    /// Stop at the next flush.
    pub fn pause(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// What a token decoder asks of the loop.
pub(crate) enum Step {
    Continue,
    /// End of the member's packed stream.
    End,
    /// Flush before the next token.
    Flush,
}

/// Decoder state every format works on.
pub(crate) struct Core {
    pub window: Window,
    pub input: BitReader,
    pub history: MatchHistory,
    pub progress: Progress,
    /// Bytes decoded into the window for the current member.
    pub produced: u64,
    pub ppm: Option<Box<dyn PpmSource>>,
}

impl Core {
    pub fn new(window: Window, input: BitReader) -> Self {
        Self {
            window,
            input,
            history: MatchHistory::new(),
            progress: Progress::default(),
            produced: 0,
            ppm: None,
        }
    }

    #[inline]
    pub fn put_literal(&mut self, byte: u8) {
        self.window.put(byte);
        self.produced += 1;
    }

    #[inline]
    pub fn copy_match(&mut self, length: usize, distance: usize) {
        self.window.copy_match(length, distance);
        self.produced += length as u64;
    }
}

enum FormatState {
    V15(Box<Rar15State>),
    V20(Box<Rar20State>),
    V29(Box<Rar29State>),
    V50(Box<Rar5State>),
}

impl FormatState {
    fn new(version: FormatVersion, options: &DecoderOptions) -> Self {
        match version {
            FormatVersion::V15 => Self::V15(Box::default()),
            FormatVersion::V20 => Self::V20(Box::default()),
            FormatVersion::V29 => Self::V29(Box::new(Rar29State::new(options.max_vm_filters))),
            FormatVersion::V50 => Self::V50(Box::default()),
        }
    }

    fn version(&self) -> FormatVersion {
        match self {
            Self::V15(_) => FormatVersion::V15,
            Self::V20(_) => FormatVersion::V20,
            Self::V29(_) => FormatVersion::V29,
            Self::V50(_) => FormatVersion::V50,
        }
    }

    fn init(&mut self, solid: bool) {
        match self {
            Self::V15(state) => state.init(solid),
            Self::V20(state) => state.init(solid),
            Self::V29(state) => state.init(solid),
            Self::V50(state) => state.init(solid),
        }
    }

    async fn decode_token<S: ByteSource + ?Sized>(&mut self, core: &mut Core, src: &mut S) -> Result<Step> {
        match self {
            Self::V15(state) => Ok(state.decode_token(core)),
            Self::V20(state) => state.decode_token(core, src).await,
            Self::V29(state) => state.decode_token(core, src).await,
            Self::V50(state) => state.decode_token(core, src).await,
        }
    }
}

/// Scratch memory reused across flushes.
#[derive(Default)]
struct FlushBuffers {
    vm: Vec<u8>,
    builtin: [Vec<u8>; 2],
}

/// Resumable decoder for a sequence of archive members.
pub struct DecodeSession {
    options: DecoderOptions,
    core: Core,
    format: Option<FormatState>,
    member: Option<MemberInfo>,
    pause: PauseHandle,
    buffers: FlushBuffers,
}

impl DecodeSession {
    pub fn new() -> Self {
        Self::with_options(DecoderOptions::default())
    }

    pub fn with_options(options: DecoderOptions) -> Self {
        Self {
            options,
            core: Core::new(Window::new(1), BitReader::new()),
            format: None,
            member: None,
            pause: PauseHandle::default(),
            buffers: FlushBuffers::default(),
        }
    }

    /// Attach the PPMd model RAR 3.x members may switch to.
    pub fn with_ppm(mut self, model: Box<dyn PpmSource>) -> Self {
        self.core.ppm = Some(model);
        self
    }

    pub fn options(&self) -> &DecoderOptions {
        &self.options
    }

    /// Start a member. The source handed to the decode calls must deliver
    /// exactly this member's packed bytes.
    ///
    /// A solid member keeps the window, match history and tables of the
    /// previous member of the same format; a larger window is grown in
    /// place.
    pub fn begin_member(&mut self, info: MemberInfo) -> Result<()> {
        let limit = self.options.max_window_size.min(MAX_WINDOW_SIZE);
        if info.window_size == 0 || info.window_size > limit {
            return Err(DecompressError::InvalidWindowSize(info.window_size));
        }
        let size = usize::try_from(info.window_size.max(MIN_WINDOW_SIZE).next_power_of_two())
            .map_err(|_| DecompressError::InvalidWindowSize(info.window_size))?;

        let same_format = self.format.as_ref().is_some_and(|f| f.version() == info.version);
        let solid = info.solid && same_format;
        if info.solid && !solid {
            warn!("solid {:?} member without a matching predecessor, starting fresh", info.version);
        }

        let options = self.options;
        let core = &mut self.core;
        if solid {
            core.window.grow(size, options.contiguous_window_limit, options.shard_size);
            core.window.wr_ptr = core.window.unp_ptr;
        } else {
            if core.window.size() == size {
                core.window.clear();
            } else {
                core.window = Window::with_limit(size, options.contiguous_window_limit, options.shard_size);
            }
            core.history.reset();
        }

        let config = info.version.config();
        core.window.write_border = core.window.wr_ptr;
        if config.max_write > 0 {
            if solid {
                output::update_write_border(&mut core.window, config.max_write);
            } else {
                core.window.write_border = size.min(config.max_write) & core.window.mask();
            }
        }

        core.input.reset();
        core.progress = Progress::new(info.unpacked_size);
        core.produced = 0;

        if !same_format {
            self.format = Some(FormatState::new(info.version, &options));
        }
        if let Some(format) = self.format.as_mut() {
            format.init(solid);
        }
        self.member = Some(info);
        debug!(
            "member start: {:?}, {} bytes, window {:#x}{}{}",
            info.version,
            info.unpacked_size,
            size,
            if solid { ", solid" } else { "" },
            if core.window.is_sharded() { ", sharded" } else { "" }
        );
        Ok(())
    }

    /// Decode from a blocking reader into a blocking writer until the
    /// member finishes, or until a flush happens while paused.
    pub fn decode_until_flush_or_pause<R: Read + ?Sized, W: Write + ?Sized>(
        &mut self,
        src: &mut R,
        sink: &mut W,
    ) -> Result<DecodeStatus> {
        let mut src = ReadSource::new(src);
        let mut sink = WriteSink::new(sink);
        block_on(self.run(&mut src, &mut sink))
    }

    /// Async form of [`DecodeSession::decode_until_flush_or_pause`].
    #[cfg(feature = "async")]
    pub async fn decode_until_flush_or_pause_async<S: ByteSource + ?Sized, K: ByteSink + ?Sized>(
        &mut self,
        src: &mut S,
        sink: &mut K,
    ) -> Result<DecodeStatus> {
        self.run(src, sink).await
    }

    /// Decode a whole member, ignoring pauses.
    pub fn decode_member<R: Read + ?Sized, W: Write + ?Sized>(
        &mut self,
        info: MemberInfo,
        src: &mut R,
        sink: &mut W,
    ) -> Result<u64> {
        self.begin_member(info)?;
        let mut src = ReadSource::new(src);
        let mut sink = WriteSink::new(sink);
        loop {
            if let DecodeStatus::Finished { written } = block_on(self.run(&mut src, &mut sink))? {
                return Ok(written);
            }
        }
    }

    pub fn pause_handle(&self) -> PauseHandle {
        self.pause.clone()
    }

    pub fn resume(&self) {
        self.pause.resume();
    }

    /// Bytes handed to the sink for the current or last member.
    pub fn written(&self) -> u64 {
        self.core.progress.written.min(self.core.progress.dest)
    }

    pub fn is_member_active(&self) -> bool {
        self.member.is_some()
    }

    /// The decode loop shared by every format and both drivers.
    pub(crate) async fn run<S: ByteSource + ?Sized, K: ByteSink + ?Sized>(
        &mut self,
        src: &mut S,
        sink: &mut K,
    ) -> Result<DecodeStatus> {
        let Self {
            core,
            format,
            member,
            pause,
            buffers,
            ..
        } = self;
        let (Some(info), Some(format)) = (*member, format.as_mut()) else {
            return Err(DecompressError::NoActiveMember);
        };
        let config = info.version.config();
        let dest = info.unpacked_size;
        if dest == 0 {
            *member = None;
            return Ok(DecodeStatus::Finished { written: 0 });
        }

        // Window position and count to roll back to if a token overruns
        // the input.
        let mut safe = (core.window.unp_ptr, core.produced);
        loop {
            if core.input.needs_refill() {
                core.input.refill(src).await?;
            }
            if core.input.overrun() {
                (core.window.unp_ptr, core.produced) = safe;
                break;
            }

            let window = &core.window;
            if window.room_before_border() < config.flush_slack && window.write_border != window.unp_ptr {
                flush(core, format, buffers, config, sink).await?;
                if core.progress.written > dest {
                    break;
                }
                if pause.is_paused() {
                    trace!("paused at {} bytes", core.progress.written);
                    return Ok(DecodeStatus::Paused {
                        written: core.progress.written,
                    });
                }
            }

            if config.ends_by_size && core.produced >= dest {
                if let FormatState::V20(state) = format {
                    state.read_last_tables(core, src).await?;
                }
                break;
            }

            safe = (core.window.unp_ptr, core.produced);
            match format.decode_token(core, src).await? {
                Step::Continue => {}
                Step::Flush => flush(core, format, buffers, config, sink).await?,
                Step::End => {
                    if core.input.overrun() {
                        (core.window.unp_ptr, core.produced) = safe;
                    }
                    break;
                }
            }
        }

        flush(core, format, buffers, config, sink).await?;
        *member = None;
        let written = core.progress.written;
        if !core.progress.is_complete() {
            warn!("member ended after {} of {} bytes", written, dest);
            return Err(DecompressError::IncompleteData {
                written,
                expected: dest,
            });
        }
        debug!("member finished: {} bytes", dest);
        Ok(DecodeStatus::Finished { written: dest })
    }
}

impl Default for DecodeSession {
    fn default() -> Self {
        Self::new()
    }
}

async fn flush<K: ByteSink + ?Sized>(
    core: &mut Core,
    format: &mut FormatState,
    buffers: &mut FlushBuffers,
    config: &FormatConfig,
    sink: &mut K,
) -> io::Result<()> {
    let window = &mut core.window;
    let progress = &mut core.progress;
    match format {
        FormatState::V29(state) => output::flush_vm(window, &mut state.filters, &mut buffers.vm, sink, progress).await,
        FormatState::V50(state) => {
            output::flush_builtin(
                window,
                &mut state.filters,
                &mut buffers.builtin,
                config.max_write,
                sink,
                progress,
            )
            .await
        }
        FormatState::V15(_) | FormatState::V20(_) => output::flush_plain(window, sink, progress).await,
    }
}

/// Decode one non-solid member held in memory.
///
/// ```rust
/// use rar_decode::{decompress, DecompressError, FormatVersion};
///
/// // A stream that ends before producing anything.
/// let err = decompress(FormatVersion::V20, &[], 16, 0x10000).unwrap_err();
/// assert!(matches!(err, DecompressError::IncompleteData { written: 0, expected: 16 }));
/// ```
pub fn decompress(version: FormatVersion, input: &[u8], unpacked_size: u64, window_size: u64) -> Result<Vec<u8>> {
    let mut session = DecodeSession::new();
    session.begin_member(MemberInfo::new(version, unpacked_size, window_size))?;
    let mut src = input;
    let mut out = Vec::with_capacity(unpacked_size.min(1 << 24) as usize);
    loop {
        if let DecodeStatus::Finished { .. } = block_on(session.run(&mut src, &mut out))? {
            return Ok(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_builder() {
        let options = DecoderOptions::default()
            .with_max_window_size(1 << 20)
            .with_contiguous_window_limit(1 << 18)
            .with_shard_size(1 << 16)
            .with_max_vm_filters(4);
        assert_eq!(options.max_window_size, 1 << 20);
        assert_eq!(options.contiguous_window_limit, 1 << 18);
        assert_eq!(options.shard_size, 1 << 16);
        assert_eq!(options.max_vm_filters, 4);
        assert_eq!(DecoderOptions::default().max_vm_filters, 8192);
    }

    #[test]
    fn test_window_size_limits() {
        let mut session = DecodeSession::new();
        assert!(matches!(
            session.begin_member(MemberInfo::new(FormatVersion::V50, 1, 0)),
            Err(DecompressError::InvalidWindowSize(0))
        ));
        assert!(matches!(
            session.begin_member(MemberInfo::new(FormatVersion::V50, 1, 8 << 30)),
            Err(DecompressError::InvalidWindowSize(_))
        ));
        assert!(!session.is_member_active());

        session
            .begin_member(MemberInfo::new(FormatVersion::V50, 1, 1000))
            .unwrap();
        assert!(session.is_member_active());
        assert_eq!(session.core.window.size(), MIN_WINDOW_SIZE as usize);
    }

    #[test]
    fn test_large_window_is_sharded() {
        let options = DecoderOptions::default()
            .with_contiguous_window_limit(0x40000)
            .with_shard_size(0x10000);
        let mut session = DecodeSession::with_options(options);
        session
            .begin_member(MemberInfo::new(FormatVersion::V29, 1, 0x80000))
            .unwrap();
        assert!(session.core.window.is_sharded());
        assert_eq!(session.core.window.size(), 0x80000);
    }

    #[test]
    fn test_decode_without_member() {
        let mut session = DecodeSession::new();
        let mut out: Vec<u8> = Vec::new();
        assert!(matches!(
            session.decode_until_flush_or_pause(&mut &b""[..], &mut out),
            Err(DecompressError::NoActiveMember)
        ));
    }

    #[test]
    fn test_empty_member_finishes_at_once() {
        let mut session = DecodeSession::new();
        let written = session
            .decode_member(
                MemberInfo::new(FormatVersion::V50, 0, 0x40000),
                &mut &b""[..],
                &mut Vec::<u8>::new(),
            )
            .unwrap();
        assert_eq!(written, 0);
        assert!(!session.is_member_active());
    }

    #[test]
    fn test_solid_without_predecessor_starts_fresh() {
        let mut session = DecodeSession::new();
        session
            .begin_member(MemberInfo::new(FormatVersion::V20, 4, 0x40000).with_solid(true))
            .unwrap();
        assert_eq!(session.core.window.unp_ptr, 0);
        assert!(matches!(session.format, Some(FormatState::V20(_))));
    }

    #[test]
    fn test_write_border_for_new_rar5_member() {
        let mut session = DecodeSession::new();
        session
            .begin_member(MemberInfo::new(FormatVersion::V50, 10, 1 << 24))
            .unwrap();
        assert_eq!(session.core.window.write_border, 0x400000);
        session
            .begin_member(MemberInfo::new(FormatVersion::V29, 10, 1 << 24))
            .unwrap();
        assert_eq!(session.core.window.write_border, 0);
    }

    #[test]
    fn test_pause_handle_is_shared() {
        let session = DecodeSession::new();
        let handle = session.pause_handle();
        handle.pause();
        assert!(session.pause.is_paused());
        session.resume();
        assert!(!handle.is_paused());
    }
}
