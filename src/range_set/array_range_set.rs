use std::ops::Range;

use tinyvec::TinyVec;

/// A set of u64 values kept as a sorted array of disjoint ranges
///
/// Used for packet number ranges pending acknowledgement, which are nearly always contiguous, so
/// the inline representation avoids allocating in the common case.
#[derive(Debug, Default)]
pub(crate) struct ArrayRangeSet(TinyVec<[Range<u64>; INLINE_CAPACITY]>);

const INLINE_CAPACITY: usize = 2;

impl Clone for ArrayRangeSet {
    fn clone(&self) -> Self {
        // Clones are stored in sent packet records and rarely mutated; prefer the inline form
        if self.0.is_inline() || self.0.len() > INLINE_CAPACITY {
            return Self(self.0.clone());
        }
        let mut vec = TinyVec::new();
        vec.extend_from_slice(self.0.as_slice());
        Self(vec)
    }
}

impl ArrayRangeSet {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    pub(crate) fn iter(&self) -> impl DoubleEndedIterator<Item = Range<u64>> + '_ {
        self.0.iter().cloned()
    }

    pub(crate) fn elts(&self) -> impl Iterator<Item = u64> + '_ {
        self.iter().flatten()
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn contains(&self, x: u64) -> bool {
        for range in self.0.iter() {
            if range.start > x {
                return false;
            } else if range.contains(&x) {
                return true;
            }
        }
        false
    }

    pub(crate) fn subtract(&mut self, other: &Self) {
        for range in &other.0 {
            self.remove(range.clone());
        }
    }

    pub(crate) fn insert_one(&mut self, x: u64) -> bool {
        self.insert(x..x + 1)
    }

    pub(crate) fn insert(&mut self, x: Range<u64>) -> bool {
        if x.is_empty() {
            return false;
        }

        let mut changed = false;
        let mut idx = 0;
        while idx != self.0.len() {
            let range = &mut self.0[idx];

            if range.start > x.end {
                self.0.insert(idx, x);
                return true;
            } else if range.start > x.start {
                // Overlaps from the left; earlier ranges were already ruled out
                changed = true;
                range.start = x.start;
            }

            if x.end <= range.end {
                return changed;
            } else if x.start <= range.end {
                range.end = x.end;
                // Absorb any following ranges now covered
                while idx != self.0.len() - 1 {
                    let curr = self.0[idx].clone();
                    let next = self.0[idx + 1].clone();
                    if curr.end < next.start {
                        break;
                    }
                    self.0[idx].end = next.end.max(curr.end);
                    self.0.remove(idx + 1);
                }
                return true;
            }

            idx += 1;
        }

        self.0.push(x);
        true
    }

    pub(crate) fn remove(&mut self, x: Range<u64>) -> bool {
        if x.is_empty() {
            return false;
        }

        let mut changed = false;
        let mut idx = 0;
        while idx != self.0.len() {
            let range = self.0[idx].clone();
            if x.end <= range.start {
                return changed;
            } else if x.start >= range.end {
                idx += 1;
                continue;
            }

            changed = true;
            let left = range.start..x.start;
            let right = x.end..range.end;
            match (left.is_empty(), right.is_empty()) {
                (true, true) => {
                    self.0.remove(idx);
                }
                (true, false) => {
                    self.0[idx] = right;
                    idx += 1;
                }
                (false, true) => {
                    self.0[idx] = left;
                    idx += 1;
                }
                (false, false) => {
                    self.0[idx] = right;
                    self.0.insert(idx, left);
                    idx += 2;
                }
            }
        }
        changed
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn pop_min(&mut self) -> Option<Range<u64>> {
        if self.0.is_empty() {
            return None;
        }
        Some(self.0.remove(0))
    }

    pub(crate) fn min(&self) -> Option<u64> {
        self.0.first().map(|x| x.start)
    }

    pub(crate) fn max(&self) -> Option<u64> {
        self.0.last().map(|x| x.end - 1)
    }
}
