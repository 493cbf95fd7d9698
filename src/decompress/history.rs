//! Recently used match distances.

/// Last four distances plus the previous match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchHistory {
    pub old_dist: [usize; 4],
    /// Ring cursor used by the 1.5 and 2.x formats.
    pub old_dist_ptr: usize,
    pub last_dist: usize,
    pub last_length: usize,
}

impl MatchHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Shift the list down and put `distance` in front.
    #[inline]
    pub fn insert(&mut self, distance: usize) {
        self.old_dist = [distance, self.old_dist[0], self.old_dist[1], self.old_dist[2]];
    }

    /// Overwrite the oldest ring slot.
    #[inline]
    pub fn push_ring(&mut self, distance: usize) {
        self.old_dist[self.old_dist_ptr & 3] = distance;
        self.old_dist_ptr = (self.old_dist_ptr + 1) & 3;
    }

    /// Move entry `index` to the front and return it.
    #[inline]
    pub fn promote(&mut self, index: usize) -> usize {
        let distance = self.old_dist[index];
        self.old_dist.copy_within(0..index, 1);
        self.old_dist[0] = distance;
        distance
    }

    /// Distance `back` steps behind the ring cursor.
    #[inline]
    pub fn ring_back(&self, back: usize) -> usize {
        self.old_dist[self.old_dist_ptr.wrapping_sub(back) & 3]
    }

    #[inline]
    pub fn remember(&mut self, length: usize, distance: usize) {
        self.last_length = length;
        self.last_dist = distance;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_promote() {
        let mut h = MatchHistory::new();
        for d in [1, 2, 3, 4] {
            h.insert(d);
        }
        assert_eq!(h.old_dist, [4, 3, 2, 1]);
        assert_eq!(h.promote(2), 2);
        assert_eq!(h.old_dist, [2, 4, 3, 1]);
        assert_eq!(h.promote(0), 2);
        assert_eq!(h.old_dist, [2, 4, 3, 1]);
    }

    #[test]
    fn test_ring() {
        let mut h = MatchHistory::new();
        for d in [10, 20, 30, 40, 50] {
            h.push_ring(d);
        }
        assert_eq!(h.old_dist, [50, 20, 30, 40]);
        assert_eq!(h.ring_back(1), 50);
        assert_eq!(h.ring_back(4), 20);
    }
}
