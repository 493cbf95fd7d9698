//! Sliding dictionary window.
//!
//! A power-of-two ring that holds the most recent output. Small windows are
//! one flat allocation; windows above the configured contiguous limit are
//! split into equal shards so no single allocation gets that large.

enum Storage {
    Flat(Vec<u8>),
    Sharded { shards: Vec<Box<[u8]>>, shard_bits: u32 },
}

/// Ring buffer with the decoder's write cursors.
pub struct Window {
    storage: Storage,
    size: usize,
    mask: usize,
    /// Next position to decode into.
    pub(crate) unp_ptr: usize,
    /// Everything before this position (back to `unp_ptr`) has been flushed.
    pub(crate) wr_ptr: usize,
    /// Position at which the decode loop must flush.
    pub(crate) write_border: usize,
}

impl Window {
    /// Flat window of `size` bytes, rounded up to a power of two.
    pub fn new(size: usize) -> Self {
        Self::with_limit(size, usize::MAX, 0)
    }

    /// Window that switches to `shard_size` shards above `contiguous_limit`.
    pub fn with_limit(size: usize, contiguous_limit: usize, shard_size: usize) -> Self {
        let size = size.max(1).next_power_of_two();
        Self {
            storage: Self::allocate(size, contiguous_limit, shard_size),
            size,
            mask: size - 1,
            unp_ptr: 0,
            wr_ptr: 0,
            write_border: 0,
        }
    }

    fn allocate(size: usize, contiguous_limit: usize, shard_size: usize) -> Storage {
        if size <= contiguous_limit || shard_size == 0 {
            return Storage::Flat(vec![0; size]);
        }
        let shard = shard_size.next_power_of_two().min(size);
        let shards = (0..size / shard).map(|_| vec![0u8; shard].into_boxed_slice()).collect();
        Storage::Sharded {
            shards,
            shard_bits: shard.trailing_zeros(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn mask(&self) -> usize {
        self.mask
    }

    pub fn is_sharded(&self) -> bool {
        matches!(self.storage, Storage::Sharded { .. })
    }

    #[inline(always)]
    fn get(&self, index: usize) -> u8 {
        let index = index & self.mask;
        match &self.storage {
            Storage::Flat(buf) => buf[index],
            Storage::Sharded { shards, shard_bits } => {
                shards[index >> shard_bits][index & ((1 << shard_bits) - 1)]
            }
        }
    }

    #[inline(always)]
    fn set(&mut self, index: usize, byte: u8) {
        let index = index & self.mask;
        match &mut self.storage {
            Storage::Flat(buf) => buf[index] = byte,
            Storage::Sharded { shards, shard_bits } => {
                let bits = *shard_bits;
                shards[index >> bits][index & ((1 << bits) - 1)] = byte;
            }
        }
    }

    /// Byte at an absolute (masked) window position.
    #[inline]
    pub fn byte_at(&self, index: usize) -> u8 {
        self.get(index)
    }

    /// Byte `distance` positions behind the decode pointer.
    #[inline]
    pub fn back(&self, distance: usize) -> u8 {
        self.get(self.unp_ptr.wrapping_sub(distance))
    }

    /// Append a literal.
    #[inline]
    pub fn put(&mut self, byte: u8) {
        self.set(self.unp_ptr, byte);
        self.unp_ptr = (self.unp_ptr + 1) & self.mask;
    }

    /// Append `length` bytes copied from `distance` bytes back. Overlapping
    /// copies repeat the last `distance` bytes.
    pub fn copy_match(&mut self, length: usize, distance: usize) {
        let dst = self.unp_ptr;
        let src = dst.wrapping_sub(distance) & self.mask;
        let size = self.size;

        if let Storage::Flat(buf) = &mut self.storage {
            if distance != 0 && src + length <= size && dst + length <= size {
                if distance >= length || src > dst {
                    buf.copy_within(src..src + length, dst);
                } else {
                    // Each pass doubles the replicated period.
                    let mut done = 0;
                    while done < length {
                        let n = (distance + done).min(length - done);
                        buf.copy_within(src..src + n, dst + done);
                        done += n;
                    }
                }
                self.unp_ptr = (dst + length) & self.mask;
                return;
            }
        }

        for i in 0..length {
            let byte = self.get(src + i);
            self.set(dst + i, byte);
        }
        self.unp_ptr = (dst + length) & self.mask;
    }

    /// Longest contiguous run of stored bytes starting at `start`, capped at
    /// `len`.
    pub fn chunk_at(&self, start: usize, len: usize) -> &[u8] {
        let start = start & self.mask;
        match &self.storage {
            Storage::Flat(buf) => {
                let end = (start + len).min(self.size);
                &buf[start..end]
            }
            Storage::Sharded { shards, shard_bits } => {
                let shard_mask = (1 << shard_bits) - 1;
                let off = start & shard_mask;
                let shard = &shards[start >> shard_bits];
                let end = (off + len).min(shard.len());
                &shard[off..end]
            }
        }
    }

    /// Copy `out.len()` bytes starting at `start`, following the wrap.
    pub fn read_into(&self, start: usize, out: &mut [u8]) {
        let mut done = 0;
        while done < out.len() {
            let chunk = self.chunk_at(start + done, out.len() - done);
            out[done..done + chunk.len()].copy_from_slice(chunk);
            done += chunk.len();
        }
    }

    /// Zero the contents and rewind every cursor.
    pub fn clear(&mut self) {
        match &mut self.storage {
            Storage::Flat(buf) => buf.fill(0),
            Storage::Sharded { shards, .. } => {
                for shard in shards {
                    shard.fill(0);
                }
            }
        }
        self.unp_ptr = 0;
        self.wr_ptr = 0;
        self.write_border = 0;
    }

    /// Enlarge to `new_size`, keeping every byte at the same distance
    /// behind the decode pointer.
    pub fn grow(&mut self, new_size: usize, contiguous_limit: usize, shard_size: usize) {
        let new_size = new_size.next_power_of_two();
        if new_size <= self.size {
            return;
        }
        let mut grown = Window::with_limit(new_size, contiguous_limit, shard_size);
        grown.unp_ptr = self.unp_ptr;
        for distance in 1..=self.size {
            let byte = self.back(distance);
            grown.set(grown.unp_ptr.wrapping_sub(distance), byte);
        }
        grown.wr_ptr = grown.unp_ptr;
        grown.write_border = grown.unp_ptr;
        *self = grown;
    }

    /// Bytes decoded but not yet flushed.
    #[inline]
    pub fn pending(&self) -> usize {
        self.unp_ptr.wrapping_sub(self.wr_ptr) & self.mask
    }

    /// Free space between the decode pointer and the write border.
    #[inline]
    pub fn room_before_border(&self) -> usize {
        self.write_border.wrapping_sub(self.unp_ptr) & self.mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn recent(w: &Window, len: usize) -> Vec<u8> {
        let mut out = vec![0; len];
        w.read_into(w.unp_ptr.wrapping_sub(len), &mut out);
        out
    }

    #[test]
    fn test_literals_and_match() {
        let mut w = Window::new(256);
        for &b in b"abc" {
            w.put(b);
        }
        w.copy_match(6, 3);
        assert_eq!(recent(&w, 9), b"abcabcabc");
    }

    #[test]
    fn test_run_of_one_byte() {
        let mut w = Window::new(256);
        w.put(b'a');
        w.copy_match(5, 1);
        assert_eq!(recent(&w, 6), b"aaaaaa");
    }

    #[test]
    fn test_copy_across_wrap() {
        let mut w = Window::new(16);
        for i in 0..14u8 {
            w.put(i);
        }
        w.copy_match(6, 4);
        assert_eq!(w.unp_ptr, 4);
        assert_eq!(recent(&w, 10), [10, 11, 12, 13, 10, 11, 12, 13, 10, 11]);
    }

    /// Byte-at-a-time reference for what a match must produce.
    fn naive_copy(buf: &mut [u8], ptr: &mut usize, length: usize, distance: usize) {
        let mask = buf.len() - 1;
        for _ in 0..length {
            buf[*ptr] = buf[ptr.wrapping_sub(distance) & mask];
            *ptr = (*ptr + 1) & mask;
        }
    }

    #[test]
    fn test_fast_and_sharded_match_reference() {
        let mut rng = StdRng::seed_from_u64(42);
        let size = 1 << 12;
        let mut flat = Window::new(size);
        let mut sharded = Window::with_limit(size, 0, 64);
        assert!(sharded.is_sharded());
        let mut reference = vec![0u8; size];
        let mut ptr = 0usize;

        for _ in 0..3000 {
            if rng.random_range(0..3) == 0 {
                let b: u8 = rng.random();
                flat.put(b);
                sharded.put(b);
                reference[ptr] = b;
                ptr = (ptr + 1) & (size - 1);
            } else {
                let length = rng.random_range(2..300);
                let distance = rng.random_range(1..size);
                flat.copy_match(length, distance);
                sharded.copy_match(length, distance);
                naive_copy(&mut reference, &mut ptr, length, distance);
            }
            assert_eq!(flat.unp_ptr, ptr);
        }
        let mut a = vec![0; size];
        let mut b = vec![0; size];
        flat.read_into(0, &mut a);
        sharded.read_into(0, &mut b);
        assert_eq!(a, reference);
        assert_eq!(b, reference);
    }

    #[test]
    fn test_grow_keeps_history() {
        let mut w = Window::new(16);
        for i in 0..20u8 {
            w.put(i);
        }
        w.grow(64, usize::MAX, 0);
        assert_eq!(w.size(), 64);
        for d in 1..=16 {
            assert_eq!(w.back(d), 20 - d as u8);
        }
        w.copy_match(3, 16);
        assert_eq!(recent(&w, 3), [4, 5, 6]);
    }

    #[test]
    fn test_clear_rewinds() {
        let mut w = Window::new(32);
        w.put(9);
        w.clear();
        assert_eq!(w.unp_ptr, 0);
        assert_eq!(w.byte_at(0), 0);
    }
}
