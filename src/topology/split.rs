use serde::{Deserialize, Serialize};
use std::fmt;

pub type LeafId = usize;

const WORD_BITS: usize = 64;

/// A bipartition of the leaf set, stored as the bit-vector of one side.
///
/// Splits produced by [`Split::canonical`] or [`Split::canonical_within`] always
/// describe the side that does not hold the lowest leaf, so a split and its
/// complement compare (and hash) equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Split {
    leaf_count: usize,
    words: Vec<u64>,
}

impl Split {
    pub fn empty(leaf_count: usize) -> Self {
        Self {
            leaf_count,
            words: vec![0; leaf_count.div_ceil(WORD_BITS)],
        }
    }

    pub fn full(leaf_count: usize) -> Self {
        let mut split = Self::empty(leaf_count);
        for w in split.words.iter_mut() {
            *w = u64::MAX;
        }
        split.clear_tail();
        split
    }

    pub fn from_leaves<I: IntoIterator<Item = LeafId>>(leaf_count: usize, leaves: I) -> Self {
        let mut split = Self::empty(leaf_count);
        for leaf in leaves {
            split.insert(leaf);
        }
        split
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    pub fn insert(&mut self, leaf: LeafId) {
        debug_assert!(leaf < self.leaf_count);
        self.words[leaf / WORD_BITS] |= 1u64 << (leaf % WORD_BITS);
    }

    pub fn remove(&mut self, leaf: LeafId) {
        self.words[leaf / WORD_BITS] &= !(1u64 << (leaf % WORD_BITS));
    }

    pub fn contains(&self, leaf: LeafId) -> bool {
        leaf < self.leaf_count && self.words[leaf / WORD_BITS] & (1u64 << (leaf % WORD_BITS)) != 0
    }

    /// Number of leaves on the stored side.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn lowest(&self) -> Option<LeafId> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, &w)| w != 0)
            .map(|(i, w)| i * WORD_BITS + w.trailing_zeros() as usize)
    }

    pub fn leaves(&self) -> impl Iterator<Item = LeafId> + '_ {
        (0..self.leaf_count).filter(move |&l| self.contains(l))
    }

    pub fn union_with(&mut self, other: &Split) {
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a |= b;
        }
    }

    pub fn intersection(&self, other: &Split) -> Split {
        let mut out = self.clone();
        for (a, b) in out.words.iter_mut().zip(&other.words) {
            *a &= b;
        }
        out
    }

    pub fn intersects(&self, other: &Split) -> bool {
        self.words.iter().zip(&other.words).any(|(a, b)| a & b != 0)
    }

    pub fn is_subset_of(&self, other: &Split) -> bool {
        self.words.iter().zip(&other.words).all(|(a, b)| a & !b == 0)
    }

    /// `mask \ self`
    pub fn complement_within(&self, mask: &Split) -> Split {
        let mut out = mask.clone();
        for (a, b) in out.words.iter_mut().zip(&self.words) {
            *a &= !b;
        }
        out
    }

    pub fn invert(&mut self) {
        for w in self.words.iter_mut() {
            *w = !*w;
        }
        self.clear_tail();
    }

    /// Canonical orientation over the full leaf set: the side without leaf 0.
    pub fn canonical(mut self) -> Split {
        if self.contains(0) {
            self.invert();
        }
        self
    }

    /// Restricts the split to `mask` and orients it away from the lowest leaf of `mask`.
    pub fn canonical_within(&self, mask: &Split) -> Split {
        let restricted = self.intersection(mask);
        match mask.lowest() {
            Some(low) if restricted.contains(low) => restricted.complement_within(mask),
            _ => restricted,
        }
    }

    pub fn is_trivial(&self) -> bool {
        let c = self.count();
        c <= 1 || c + 1 >= self.leaf_count
    }

    pub fn is_trivial_within(&self, mask: &Split) -> bool {
        let c = self.intersection(mask).count();
        let total = mask.count();
        c <= 1 || c + 1 >= total
    }

    /// Two bipartitions of `mask` are compatible iff one of the four side
    /// intersections is empty.
    pub fn is_compatible_with(&self, other: &Split, mask: &Split) -> bool {
        let a = self.intersection(mask);
        let b = a.complement_within(mask);
        let c = other.intersection(mask);
        let d = c.complement_within(mask);
        !a.intersects(&c) || !a.intersects(&d) || !b.intersects(&c) || !b.intersects(&d)
    }

    fn clear_tail(&mut self) {
        let tail = self.leaf_count % WORD_BITS;
        if tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for leaf in 0..self.leaf_count {
            f.write_str(if self.contains(leaf) { "*" } else { "." })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complement_is_canonically_equal() {
        let a = Split::from_leaves(6, [1, 2]).canonical();
        let b = Split::from_leaves(6, [0, 3, 4, 5]).canonical();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), ".**...");
    }

    #[test]
    fn tail_bits_stay_clear_on_invert() {
        let mut s = Split::from_leaves(70, [0, 69]);
        s.invert();
        assert_eq!(s.count(), 68);
        assert!(!s.contains(69));
    }

    #[test]
    fn restriction_to_mask_reorients() {
        let mask = Split::from_leaves(8, [2, 3, 5, 7]);
        let s = Split::from_leaves(8, [2, 3, 4]);
        let c = s.canonical_within(&mask);
        assert_eq!(c.leaves().collect::<Vec<_>>(), vec![5, 7]);
    }

    #[test]
    fn incompatible_splits_detected() {
        let mask = Split::full(4);
        let ab = Split::from_leaves(4, [0, 1]);
        let ac = Split::from_leaves(4, [0, 2]);
        assert!(!ab.is_compatible_with(&ac, &mask));
        assert!(ab.is_compatible_with(&ab, &mask));
    }
}
