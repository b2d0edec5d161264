//! Sets of event indexes stored as disjoint inclusive ranges.
//!
//! Used to track which event indexes of a history are confirmed (or expired)
//! without storing each index. Adjacent and overlapping ranges are always
//! merged, so the stored ranges are disjoint and never touch.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;

/// Ordered set of `u32` indexes, kept as merged inclusive ranges.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct IndexRangeSet {
    /// start -> end (inclusive)
    ranges: BTreeMap<u32, u32>,
}

impl IndexRangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, index: u32) {
        self.insert_range(index..=index);
    }

    /// Add every index in `range`. Empty ranges are ignored.
    pub fn insert_range(&mut self, range: RangeInclusive<u32>) {
        let (mut start, mut end) = (*range.start(), *range.end());
        if start > end {
            return;
        }

        if let Some((&s, &e)) = self.ranges.range(..=start).next_back()
            && e.saturating_add(1) >= start
        {
            start = s;
            end = end.max(e);
            self.ranges.remove(&s);
        }

        let upper = end.saturating_add(1);
        let absorbed: Vec<(u32, u32)> = self
            .ranges
            .range(start..=upper)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in absorbed {
            end = end.max(e);
            self.ranges.remove(&s);
        }

        self.ranges.insert(start, end);
    }

    pub fn remove(&mut self, index: u32) {
        self.remove_range(index..=index);
    }

    /// Remove every index in `range`, splitting stored ranges as needed.
    pub fn remove_range(&mut self, range: RangeInclusive<u32>) {
        let (start, end) = (*range.start(), *range.end());
        if start > end {
            return;
        }

        let overlapping: Vec<(u32, u32)> = self
            .ranges
            .range(..=end)
            .rev()
            .take_while(|&(_, &e)| e >= start)
            .map(|(&s, &e)| (s, e))
            .collect();

        for (s, e) in overlapping {
            self.ranges.remove(&s);
            if s < start {
                self.ranges.insert(s, start - 1);
            }
            if e > end {
                self.ranges.insert(end + 1, e);
            }
        }
    }

    pub fn contains(&self, index: u32) -> bool {
        self.ranges
            .range(..=index)
            .next_back()
            .is_some_and(|(_, &e)| index <= e)
    }

    /// Number of indexes in the set.
    pub fn len(&self) -> u64 {
        self.ranges
            .iter()
            .map(|(&s, &e)| u64::from(e - s) + 1)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn first(&self) -> Option<u32> {
        self.ranges.first_key_value().map(|(&s, _)| s)
    }

    pub fn last(&self) -> Option<u32> {
        self.ranges.last_key_value().map(|(_, &e)| e)
    }

    pub fn ranges(&self) -> impl Iterator<Item = RangeInclusive<u32>> + '_ {
        self.ranges.iter().map(|(&s, &e)| s..=e)
    }

    /// Gaps inside `window`: the sub-ranges not covered by this set.
    pub fn missing(&self, window: RangeInclusive<u32>) -> Vec<RangeInclusive<u32>> {
        let (lo, hi) = (*window.start(), *window.end());
        if lo > hi {
            return Vec::new();
        }

        let head = self
            .ranges
            .range(..lo)
            .next_back()
            .filter(|&(_, &e)| e >= lo);
        let rest = self.ranges.range(lo..=hi);

        let mut gaps = Vec::new();
        // u64 so that a range ending at u32::MAX cannot overflow.
        let mut cursor = u64::from(lo);
        for (&s, &e) in head.into_iter().chain(rest) {
            if u64::from(s) > cursor {
                gaps.push(cursor as u32..=s - 1);
            }
            cursor = cursor.max(u64::from(e) + 1);
        }
        if cursor <= u64::from(hi) {
            gaps.push(cursor as u32..=hi);
        }
        gaps
    }

    pub fn union(&mut self, other: &IndexRangeSet) {
        for range in other.ranges() {
            self.insert_range(range);
        }
    }
}

impl FromIterator<u32> for IndexRangeSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

impl Extend<u32> for IndexRangeSet {
    fn extend<I: IntoIterator<Item = u32>>(&mut self, iter: I) {
        for index in iter {
            self.insert(index);
        }
    }
}

impl std::fmt::Debug for IndexRangeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.ranges()).finish()
    }
}
