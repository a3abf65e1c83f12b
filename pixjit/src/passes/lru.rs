/// Link in the circular recency list
#[derive(Copy, Clone, Default)]
struct Link {
    older: u8,
    newer: u8,
}

/// Recency tracker for a fixed bank of `N` registers
///
/// Registers live in a circular doubly-linked list; `newest` points at the
/// most recently touched register, and its `newer` neighbor (wrapping around)
/// is the least recently used.
///
/// ```text
///   oldest                             newest
///   [ r3 ] <-> [ r0 ] <-> ... <-> [ r7 ] <-> (wraps to r3)
/// ```
pub struct Lru<const N: usize> {
    links: [Link; N],
    newest: u8,
}

impl<const N: usize> Default for Lru<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Lru<N> {
    /// Builds a tracker where register `0` is newest and `N - 1` is oldest
    pub fn new() -> Self {
        assert!(N > 0 && N <= u8::MAX as usize);
        let mut links = [Link::default(); N];
        for (i, link) in links.iter_mut().enumerate() {
            link.older = ((i + 1) % N) as u8;
            link.newer = ((i + N - 1) % N) as u8;
        }
        Self { links, newest: 0 }
    }

    fn unlink(&mut self, i: u8) {
        let Link { older, newer } = self.links[i as usize];
        self.links[older as usize].newer = newer;
        self.links[newer as usize].older = older;
    }

    /// Marks register `i` as the most recently used
    pub fn touch(&mut self, i: u8) {
        if self.newest == i {
            return;
        }
        let oldest = self.links[self.newest as usize].newer;
        if oldest != i {
            // Splice `i` in between the current newest and oldest
            self.unlink(i);
            self.links[i as usize] = Link {
                older: self.newest,
                newer: oldest,
            };
            self.links[self.newest as usize].newer = i;
            self.links[oldest as usize].older = i;
        }
        self.newest = i;
    }

    /// Returns the least recently used register, marking it as newest
    pub fn evict(&mut self) -> u8 {
        let oldest = self.links[self.newest as usize].newer;
        self.newest = oldest;
        oldest
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_evict_cycles() {
        let mut lru: Lru<3> = Lru::new();
        assert_eq!(lru.evict(), 2);
        assert_eq!(lru.evict(), 1);
        assert_eq!(lru.evict(), 0);
        assert_eq!(lru.evict(), 2);
    }

    #[test]
    fn test_touch() {
        let mut lru: Lru<16> = Lru::new();
        lru.touch(4);
        lru.touch(9);
        for _ in 0..14 {
            assert!(!matches!(lru.evict(), 4 | 9));
        }
        assert_eq!(lru.evict(), 4);
        assert_eq!(lru.evict(), 9);

        // Touching the oldest register just rotates the list
        let mut lru: Lru<4> = Lru::new();
        lru.touch(3);
        assert_eq!(lru.evict(), 2);
        assert_eq!(lru.evict(), 1);
        assert_eq!(lru.evict(), 0);
        assert_eq!(lru.evict(), 3);
    }
}
