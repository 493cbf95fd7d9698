//! Moving decoded bytes from the window to the sink.
//!
//! Unfiltered spans are written straight out of the window. Filtered
//! blocks are copied out, transformed and written in their place; the
//! window keeps the raw bytes for later matches.

use std::io;

use log::trace;

use super::filter::{apply_builtin, FilterKind, PendingFilter};
use super::io::ByteSink;
use super::vm::{VmFilters, VM_MEMSIZE};
use super::Window;

/// Bytes written for the current member against its declared size.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Bytes the decoder has emitted, including any clamped overshoot.
    pub written: u64,
    /// Declared unpacked size.
    pub dest: u64,
}

impl Progress {
    pub fn new(dest: u64) -> Self {
        Self { written: 0, dest }
    }

    /// Forward `data`, clamped to the declared size. The counter advances
    /// by the full length so overshoot stays visible.
    pub async fn emit<K: ByteSink + ?Sized>(&mut self, sink: &mut K, data: &[u8]) -> io::Result<()> {
        let room = self.dest.saturating_sub(self.written);
        let n = (data.len() as u64).min(room) as usize;
        if n > 0 {
            sink.write_all_bytes(&data[..n]).await?;
        }
        self.written += data.len() as u64;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.written >= self.dest
    }
}

/// Write the window span `start..end`, following the wrap.
async fn write_area<K: ByteSink + ?Sized>(
    window: &Window,
    start: usize,
    end: usize,
    sink: &mut K,
    progress: &mut Progress,
) -> io::Result<()> {
    let mut remaining = end.wrapping_sub(start) & window.mask();
    let mut pos = start;
    while remaining > 0 {
        let chunk = window.chunk_at(pos, remaining);
        progress.emit(sink, chunk).await?;
        pos = (pos + chunk.len()) & window.mask();
        remaining -= chunk.len();
    }
    Ok(())
}

/// Flush everything between `wr_ptr` and `unp_ptr`.
pub async fn flush_plain<K: ByteSink + ?Sized>(
    window: &mut Window,
    sink: &mut K,
    progress: &mut Progress,
) -> io::Result<()> {
    trace!("flush {} bytes", window.pending());
    write_area(window, window.wr_ptr, window.unp_ptr, sink, progress).await?;
    window.wr_ptr = window.unp_ptr;
    window.write_border = window.wr_ptr;
    Ok(())
}

/// Flush with RAR 3.x VM filters.
///
/// Filters deferred to the next window pass are released unconditionally.
/// Filters declared on the same block whose length matches the previous
/// output run on that output in turn.
pub async fn flush_vm<K: ByteSink + ?Sized>(
    window: &mut Window,
    filters: &mut VmFilters,
    scratch: &mut Vec<u8>,
    sink: &mut K,
    progress: &mut Progress,
) -> io::Result<()> {
    let mask = window.mask();
    let mut wr_ptr = window.wr_ptr;
    let mut write_size = window.unp_ptr.wrapping_sub(wr_ptr) & mask;
    trace!("flush {} bytes, {} VM filters queued", write_size, filters.queue.len());

    let mut i = 0;
    while i < filters.queue.len() {
        let filter = &mut filters.queue[i];
        if filter.next_window {
            filter.next_window = false;
            i += 1;
            continue;
        }
        let block_start = filter.block_start;
        let block_length = filter.block_length;
        if block_start.wrapping_sub(wr_ptr) & mask >= write_size {
            i += 1;
            continue;
        }
        if wr_ptr != block_start {
            write_area(window, wr_ptr, block_start, sink, progress).await?;
            wr_ptr = block_start;
            write_size = window.unp_ptr.wrapping_sub(wr_ptr) & mask;
        }
        if block_length > write_size {
            for pending in &mut filters.queue[i..] {
                pending.next_window = false;
            }
            window.wr_ptr = wr_ptr;
            window.write_border = wr_ptr;
            return Ok(());
        }

        let block_end = (block_start + block_length) & mask;
        scratch.resize(block_length.min(VM_MEMSIZE), 0);
        window.read_into(block_start, scratch);
        filters.load(scratch);

        let PendingFilter { kind, .. } = filters.queue.remove(i);
        let (mut pos, mut size) = match kind {
            FilterKind::Bytecode(invocation) => filters.execute(&invocation, progress.written),
            _ => (0, scratch.len()),
        };
        while let Some(next) = filters.queue.get(i) {
            if next.block_start != block_start || next.block_length != size || next.next_window {
                break;
            }
            let PendingFilter { kind, .. } = filters.queue.remove(i);
            if let FilterKind::Bytecode(invocation) = kind {
                filters.reload(pos, size);
                (pos, size) = filters.execute(&invocation, progress.written);
            }
        }
        progress.emit(sink, filters.output(pos, size)).await?;
        wr_ptr = block_end;
        write_size = window.unp_ptr.wrapping_sub(wr_ptr) & mask;
    }

    write_area(window, wr_ptr, window.unp_ptr, sink, progress).await?;
    window.wr_ptr = window.unp_ptr;
    window.write_border = window.wr_ptr;
    Ok(())
}

/// Flush with RAR 5 built-in filters, then move the write border.
///
/// A deferred filter is released only once the flushed span reaches its
/// start. The border sits `max_write` ahead of the decode pointer unless
/// unflushed data lies closer.
pub async fn flush_builtin<K: ByteSink + ?Sized>(
    window: &mut Window,
    queue: &mut Vec<PendingFilter>,
    scratch: &mut [Vec<u8>; 2],
    max_write: usize,
    sink: &mut K,
    progress: &mut Progress,
) -> io::Result<()> {
    let mask = window.mask();
    let full_write_size = window.unp_ptr.wrapping_sub(window.wr_ptr) & mask;
    let mut written_border = window.wr_ptr;
    let mut write_size_left = full_write_size;
    let mut all_processed = true;
    trace!("flush {} bytes, {} filters queued", full_write_size, queue.len());

    let mut i = 0;
    while i < queue.len() {
        let filter = &mut queue[i];
        if filter.next_window {
            if filter.block_start.wrapping_sub(window.wr_ptr) & mask <= full_write_size {
                filter.next_window = false;
            }
            i += 1;
            continue;
        }
        let block_start = filter.block_start;
        let block_length = filter.block_length;
        if block_start.wrapping_sub(written_border) & mask >= write_size_left {
            i += 1;
            continue;
        }
        if written_border != block_start {
            write_area(window, written_border, block_start, sink, progress).await?;
            written_border = block_start;
            write_size_left = window.unp_ptr.wrapping_sub(written_border) & mask;
        }
        if block_length > write_size_left {
            for pending in &mut queue[i..] {
                pending.next_window = false;
            }
            all_processed = false;
            break;
        }

        let filter = queue.remove(i);
        if block_length > 0 {
            let [data, spare] = scratch;
            data.resize(block_length, 0);
            window.read_into(block_start, data);
            apply_builtin(&filter.kind, data, spare, progress.written);
            progress.emit(sink, data).await?;
            written_border = (block_start + block_length) & mask;
            write_size_left = window.unp_ptr.wrapping_sub(written_border) & mask;
        }
    }

    if all_processed {
        write_area(window, written_border, window.unp_ptr, sink, progress).await?;
        window.wr_ptr = window.unp_ptr;
    } else {
        window.wr_ptr = written_border;
    }
    update_write_border(window, max_write);
    Ok(())
}

/// Place the border `max_write` ahead of the decode pointer, or at the
/// flushed position if that comes first.
pub fn update_write_border(window: &mut Window, max_write: usize) {
    let mask = window.mask();
    let step = window.size().min(max_write);
    let mut border = (window.unp_ptr + step) & mask;
    if border == window.unp_ptr
        || (window.wr_ptr != window.unp_ptr
            && window.wr_ptr.wrapping_sub(window.unp_ptr) & mask < border.wrapping_sub(window.unp_ptr) & mask)
    {
        border = window.wr_ptr;
    }
    window.write_border = border;
}
