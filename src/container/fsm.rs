// Free-Space Map: tracks free page ranges within the page region and
// allocates from them.
//
// Two ordered sets index the same free ranges from different angles so both
// allocation and coalescing stay logarithmic instead of the historical
// linear free-list scan:
//
// - `by_offset`: BTreeMap<start_page, length_pages> for finding the range
//   immediately before/after a freed range, which is what coalescing needs.
// - `by_size`: BTreeSet<(length_pages, start_page)> for first/best/worst-fit
//   lookups without scanning every free range.

use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitStrategy {
    First,
    Best,
    Worst,
}

#[derive(Debug, Default)]
pub struct FreeSpaceMap {
    by_offset: BTreeMap<u64, u64>,
    by_size: BTreeSet<(u64, u64)>,
    next_unallocated: u64,
}

impl FreeSpaceMap {
    pub fn new(next_unallocated: u64) -> Self {
        Self {
            by_offset: BTreeMap::new(),
            by_size: BTreeSet::new(),
            next_unallocated,
        }
    }

    fn insert_range(&mut self, start: u64, len: u64) {
        self.by_offset.insert(start, len);
        self.by_size.insert((len, start));
    }

    fn remove_range(&mut self, start: u64, len: u64) {
        self.by_offset.remove(&start);
        self.by_size.remove(&(len, start));
    }

    /// Allocate `count` contiguous pages, extending the container if no free
    /// range satisfies the request.
    pub fn allocate(&mut self, count: u64, strategy: FitStrategy) -> u64 {
        let candidate = match strategy {
            FitStrategy::First => self
                .by_offset
                .iter()
                .find(|&(_, &len)| len >= count)
                .map(|(&start, &len)| (start, len)),
            FitStrategy::Best => self
                .by_size
                .range((count, 0)..)
                .next()
                .map(|&(len, start)| (start, len)),
            FitStrategy::Worst => self.by_size.iter().next_back().and_then(|&(len, start)| {
                if len >= count {
                    Some((start, len))
                } else {
                    None
                }
            }),
        };

        match candidate {
            Some((start, len)) => {
                self.remove_range(start, len);
                if len > count {
                    self.insert_range(start + count, len - count);
                }
                start
            }
            None => {
                let start = self.next_unallocated;
                self.next_unallocated += count;
                start
            }
        }
    }

    /// Free a previously allocated range, coalescing with adjacent free
    /// ranges immediately.
    pub fn free(&mut self, start: u64, len: u64) {
        let mut new_start = start;
        let mut new_len = len;

        // Merge with the range directly preceding us, if adjacent.
        if let Some((&prev_start, &prev_len)) = self.by_offset.range(..start).next_back() {
            if prev_start + prev_len == start {
                self.remove_range(prev_start, prev_len);
                new_start = prev_start;
                new_len += prev_len;
            }
        }

        // Merge with the range directly following us, if adjacent.
        if let Some((&next_start, &next_len)) = self.by_offset.range(new_start + new_len..).next() {
            if new_start + new_len == next_start {
                self.remove_range(next_start, next_len);
                new_len += next_len;
            }
        }

        self.insert_range(new_start, new_len);
    }

    pub fn free_page_count(&self) -> u64 {
        self.by_offset.values().sum()
    }

    pub fn free_range_count(&self) -> usize {
        self.by_offset.len()
    }

    pub fn next_unallocated(&self) -> u64 {
        self.next_unallocated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_extends_when_empty() {
        let mut fsm = FreeSpaceMap::new(0);
        assert_eq!(fsm.allocate(4, FitStrategy::First), 0);
        assert_eq!(fsm.allocate(4, FitStrategy::First), 4);
    }

    #[test]
    fn free_then_reallocate_reuses_range() {
        let mut fsm = FreeSpaceMap::new(0);
        let a = fsm.allocate(10, FitStrategy::First);
        fsm.free(a, 10);
        assert_eq!(fsm.allocate(5, FitStrategy::First), a);
        assert_eq!(fsm.free_page_count(), 5);
    }

    #[test]
    fn coalesces_adjacent_free_ranges() {
        let mut fsm = FreeSpaceMap::new(0);
        let a = fsm.allocate(10, FitStrategy::First);
        let b = fsm.allocate(10, FitStrategy::First);
        let c = fsm.allocate(10, FitStrategy::First);
        fsm.free(a, 10);
        fsm.free(c, 10);
        fsm.free(b, 10); // now a,b,c are all free and adjacent
        assert_eq!(fsm.free_range_count(), 1);
        assert_eq!(fsm.free_page_count(), 30);
    }

    #[test]
    fn best_fit_picks_tightest_range() {
        let mut fsm = FreeSpaceMap::new(0);
        // carve out two separate free ranges of different sizes
        let a = fsm.allocate(100, FitStrategy::First);
        fsm.allocate(1, FitStrategy::First); // spacer so a and b can't coalesce when freed
        let c = fsm.allocate(5, FitStrategy::First);
        fsm.free(a, 100);
        fsm.free(c, 5);
        let picked = fsm.allocate(5, FitStrategy::Best);
        assert_eq!(picked, c);
    }

    #[test]
    fn worst_fit_picks_largest_range() {
        let mut fsm = FreeSpaceMap::new(0);
        let a = fsm.allocate(100, FitStrategy::First);
        fsm.allocate(1, FitStrategy::First);
        let c = fsm.allocate(5, FitStrategy::First);
        fsm.free(a, 100);
        fsm.free(c, 5);
        let picked = fsm.allocate(5, FitStrategy::Worst);
        assert_eq!(picked, a);
    }
}
