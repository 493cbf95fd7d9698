//! Filter descriptors and the RAR 5 built-in transforms.
//!
//! Filters are declared in the token stream and applied when their block is
//! flushed out of the window. The window itself keeps the unfiltered bytes
//! so later matches still reference them.

use super::vm::VmInvocation;

/// Most filters that may wait in the queue at once.
pub const MAX_PENDING_FILTERS: usize = 8192;

/// Longest block a RAR 5 filter may cover.
pub const MAX_FILTER_BLOCK: usize = 0x400000;

/// Window of the E8/E8E9 address transform.
const E8_FILE_SIZE: u32 = 0x1000000;

/// Transform applied to a filtered block.
#[derive(Debug, Clone)]
pub enum FilterKind {
    Delta { channels: usize },
    E8,
    E8E9,
    Arm,
    /// RAR 3.x program, run on the VM.
    Bytecode(Box<VmInvocation>),
}

impl FilterKind {
    /// Map a RAR 5 filter type code.
    pub fn from_rar5(code: u32, channels: usize) -> Option<Self> {
        match code {
            0 => Some(Self::Delta { channels }),
            1 => Some(Self::E8),
            2 => Some(Self::E8E9),
            3 => Some(Self::Arm),
            _ => None,
        }
    }
}

/// A declared filter waiting for its block to be flushed.
#[derive(Debug, Clone)]
pub struct PendingFilter {
    pub kind: FilterKind,
    /// Window position of the first filtered byte.
    pub block_start: usize,
    pub block_length: usize,
    /// Block starts beyond the current window pass.
    pub next_window: bool,
}

impl PendingFilter {
    /// Filter whose block begins `offset` bytes after the decode pointer.
    pub fn new(
        kind: FilterKind,
        offset: usize,
        block_length: usize,
        unp_ptr: usize,
        wr_ptr: usize,
        mask: usize,
    ) -> Self {
        Self {
            kind,
            block_start: unp_ptr.wrapping_add(offset) & mask,
            block_length,
            next_window: wr_ptr != unp_ptr && (wr_ptr.wrapping_sub(unp_ptr) & mask) <= offset,
        }
    }
}

/// Undo a RAR 5 filter in place. `file_offset` is the member's written
/// byte count at the start of the block.
pub fn apply_builtin(kind: &FilterKind, data: &mut Vec<u8>, scratch: &mut Vec<u8>, file_offset: u64) {
    match *kind {
        FilterKind::Delta { channels } => {
            undo_delta(data, scratch, channels);
            std::mem::swap(data, scratch);
        }
        FilterKind::E8 => undo_e8e9(data, file_offset as u32, false),
        FilterKind::E8E9 => undo_e8e9(data, file_offset as u32, true),
        FilterKind::Arm => undo_arm(data, file_offset as u32),
        FilterKind::Bytecode(_) => {}
    }
}

/// Re-interleave `channels` byte-delta streams stored back to back.
pub fn undo_delta(src: &[u8], dst: &mut Vec<u8>, channels: usize) {
    dst.clear();
    dst.resize(src.len(), 0);
    let mut bytes = src.iter();
    for channel in 0..channels {
        let mut prev = 0u8;
        for pos in (channel..src.len()).step_by(channels.max(1)) {
            let Some(&delta) = bytes.next() else { return };
            prev = prev.wrapping_sub(delta);
            dst[pos] = prev;
        }
    }
}

/// Convert absolute x86 CALL (and JMP) targets back to relative ones.
pub fn undo_e8e9(data: &mut [u8], file_offset: u32, include_e9: bool) {
    if data.len() < 5 {
        return;
    }
    let end = data.len() - 4;
    let mut pos = 0usize;
    while pos < end {
        let found = if include_e9 {
            memchr::memchr2(0xe8, 0xe9, &data[pos..end])
        } else {
            memchr::memchr(0xe8, &data[pos..end])
        };
        let Some(skip) = found else { break };
        let addr_pos = pos + skip + 1;
        let offset = (addr_pos as u32).wrapping_add(file_offset) % E8_FILE_SIZE;
        let field: &mut [u8; 4] = match (&mut data[addr_pos..addr_pos + 4]).try_into() {
            Ok(field) => field,
            Err(_) => break,
        };
        convert_e8_address(field, offset, E8_FILE_SIZE);
        pos = addr_pos + 4;
    }
}

/// Shared address rule of the E8/E8E9 filters.
#[inline]
pub fn convert_e8_address(field: &mut [u8; 4], offset: u32, file_size: u32) {
    let addr = u32::from_le_bytes(*field);
    if addr & 0x8000_0000 != 0 {
        if addr.wrapping_add(offset) & 0x8000_0000 == 0 {
            *field = addr.wrapping_add(file_size).to_le_bytes();
        }
    } else if addr.wrapping_sub(file_size) & 0x8000_0000 != 0 {
        *field = addr.wrapping_sub(offset).to_le_bytes();
    }
}

/// Convert absolute ARM BL targets back to relative ones.
pub fn undo_arm(data: &mut [u8], file_offset: u32) {
    let mut pos = 0usize;
    while pos + 3 < data.len() {
        if data[pos + 3] == 0xeb {
            let offset = u32::from(data[pos]) | u32::from(data[pos + 1]) << 8 | u32::from(data[pos + 2]) << 16;
            let offset = offset.wrapping_sub(file_offset.wrapping_add(pos as u32) / 4);
            data[pos] = offset as u8;
            data[pos + 1] = (offset >> 8) as u8;
            data[pos + 2] = (offset >> 16) as u8;
        }
        pos += 4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_four_channels() {
        // Each channel stores 0 - value deltas; channel c should decode to
        // c, c + 4, c + 8, c + 12 after interleaving.
        let mut packed = Vec::new();
        for channel in 0..4u8 {
            let mut prev = 0u8;
            for i in 0..4u8 {
                let value = channel + 4 * i;
                packed.push(prev.wrapping_sub(value));
                prev = value;
            }
        }
        let mut out = Vec::new();
        undo_delta(&packed, &mut out, 4);
        assert_eq!(out, (0..16).collect::<Vec<u8>>());
    }

    #[test]
    fn test_delta_through_apply() {
        let mut data = vec![0xff, 0xff, 0xff];
        let mut scratch = Vec::new();
        apply_builtin(&FilterKind::Delta { channels: 1 }, &mut data, &mut scratch, 0);
        assert_eq!(data, [1, 2, 3]);
    }

    #[test]
    fn test_e8_relative_address() {
        // Absolute target 0x105 at address field position 1 becomes 0x104.
        let mut data = vec![0xe8, 0x05, 0x01, 0x00, 0x00, 0x90];
        undo_e8e9(&mut data, 0, false);
        assert_eq!(data, [0xe8, 0x04, 0x01, 0x00, 0x00, 0x90]);
    }

    #[test]
    fn test_e9_only_with_e8e9() {
        let mut plain = vec![0xe9, 0x05, 0x01, 0x00, 0x00, 0x90];
        undo_e8e9(&mut plain, 0, false);
        assert_eq!(plain[1], 0x05);
        undo_e8e9(&mut plain, 0, true);
        assert_eq!(plain[1], 0x04);
    }

    #[test]
    fn test_negative_address_wraps_into_file() {
        let mut field = (-2i32 as u32).to_le_bytes();
        convert_e8_address(&mut field, 10, E8_FILE_SIZE);
        assert_eq!(u32::from_le_bytes(field), E8_FILE_SIZE - 2);
    }

    #[test]
    fn test_arm_branch() {
        let mut data = vec![0, 0, 0, 0, 0x10, 0x00, 0x00, 0xeb];
        undo_arm(&mut data, 0);
        assert_eq!(&data[4..], [0x0f, 0x00, 0x00, 0xeb]);
    }

    #[test]
    fn test_next_window_rule() {
        let f = PendingFilter::new(FilterKind::E8, 100, 10, 50, 50, 0xff);
        assert!(!f.next_window);
        assert_eq!(f.block_start, 150);
        let f = PendingFilter::new(FilterKind::E8, 100, 10, 200, 240, 0xff);
        assert!(f.next_window);
        assert_eq!(f.block_start, 44);
    }
}
