//! # Bit Masks
//!
//! Dynamically sized bit sets stored as 64-bit group words.
//!
//! ## Purpose
//! A [`BitMask`] is the matching currency of the engine: traitmarks,
//! detailmarks, and filters all cache one, and every chunk-to-filter test is
//! a handful of word-wise `AND`s over them.
//!
//! ## Semantics
//! * Bits past the stored groups read as zero. Setting a bit to `true` grows
//!   the storage; setting a bit to `false` past the end is a no-op.
//! * Equality and hashing use the canonical form, which ignores trailing zero
//!   groups, so masks that differ only in allocated length are equal.
//! * Allocation only happens on growth.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, BitXor, Sub, SubAssign};

use crate::engine::types::GROUP_BITS;

const GOLDEN: u64 = 0x9E37_79B9_7F4A_7C15;

#[inline]
const fn hash_combine(seed: u64, value: u64) -> u64 {
    seed ^ value
        .wrapping_add(GOLDEN)
        .wrapping_add(seed << 6)
        .wrapping_add(seed >> 2)
}

#[inline]
const fn split(index: usize) -> (usize, u64) {
    (index / GROUP_BITS, 1u64 << (index % GROUP_BITS))
}

/// Growable bit set over 64-bit group words.
#[derive(Clone, Default)]
pub struct BitMask {
    groups: Vec<u64>,
}

impl BitMask {
    /// Creates an empty mask.
    #[inline]
    pub const fn new() -> Self {
        Self { groups: Vec::new() }
    }

    /// Creates an empty mask able to hold `bits` bits without reallocating.
    pub fn with_capacity(bits: usize) -> Self {
        Self { groups: Vec::with_capacity(bits.div_ceil(GROUP_BITS)) }
    }

    /// Creates a mask with exactly the given bits set.
    pub fn from_indices(indices: impl IntoIterator<Item = usize>) -> Self {
        let mut mask = Self::new();
        for index in indices {
            mask.set(index, true);
        }
        mask
    }

    /// Stored group words, including any trailing zero groups.
    #[inline]
    pub fn groups(&self) -> &[u64] {
        &self.groups
    }

    /// Number of stored group words.
    #[inline]
    pub fn groups_len(&self) -> usize {
        self.groups.len()
    }

    /// Group word at `index`; absent groups read as zero.
    #[inline]
    pub fn group_at(&self, index: usize) -> u64 {
        self.groups.get(index).copied().unwrap_or(0)
    }

    /// Canonical groups: the stored groups without trailing zeros.
    #[inline]
    pub fn canonical_groups(&self) -> &[u64] {
        let end = self.groups.iter().rposition(|&g| g != 0).map_or(0, |last| last + 1);
        &self.groups[..end]
    }

    /// Reads the bit at `index`.
    #[inline]
    pub fn at(&self, index: usize) -> bool {
        let (group, bit) = split(index);
        self.group_at(group) & bit != 0
    }

    /// Writes the bit at `index`, growing only when setting a bit past the end.
    #[inline]
    pub fn set(&mut self, index: usize, state: bool) {
        let (group, bit) = split(index);
        if state {
            if group >= self.groups.len() {
                self.groups.resize(group + 1, 0);
            }
            self.groups[group] |= bit;
        } else if let Some(word) = self.groups.get_mut(group) {
            *word &= !bit;
        }
    }

    /// Clears the bit at `index`.
    #[inline]
    pub fn clear(&mut self, index: usize) {
        self.set(index, false);
    }

    /// Clears all bits, keeping the allocation.
    #[inline]
    pub fn reset(&mut self) {
        self.groups.iter_mut().for_each(|g| *g = 0);
    }

    /// Drops trailing zero groups from storage.
    pub fn shrink_to_canonical(&mut self) {
        let len = self.canonical_groups().len();
        self.groups.truncate(len);
    }

    /// `true` if no bit is set.
    #[inline]
    pub fn is_zeroed(&self) -> bool {
        self.groups.iter().all(|&g| g == 0)
    }

    /// Number of set bits.
    #[inline]
    pub fn count(&self) -> usize {
        self.groups.iter().map(|g| g.count_ones() as usize).sum()
    }

    /// `true` if every bit set in `other` is also set in `self`.
    #[inline]
    pub fn includes(&self, other: &BitMask) -> bool {
        other
            .groups
            .iter()
            .enumerate()
            .all(|(i, &g)| self.group_at(i) & g == g)
    }

    /// `true` if `self` and `other` share at least one set bit.
    #[inline]
    pub fn includes_partially(&self, other: &BitMask) -> bool {
        self.groups.iter().zip(other.groups.iter()).any(|(a, b)| a & b != 0)
    }

    /// `true` if `self` and `other` share no set bit.
    #[inline]
    pub fn excludes(&self, other: &BitMask) -> bool {
        !self.includes_partially(other)
    }

    /// Number of bit positions where `self` and `other` differ.
    pub fn differences_count(&self, other: &BitMask) -> usize {
        let len = self.groups.len().max(other.groups.len());
        (0..len)
            .map(|i| (self.group_at(i) ^ other.group_at(i)).count_ones() as usize)
            .sum()
    }

    /// Shared-bit count over the overlapping groups.
    ///
    /// Groups that are equal contribute a full group width.
    pub fn inclusions_count(&self, other: &BitMask) -> usize {
        self.groups
            .iter()
            .zip(other.groups.iter())
            .map(|(&a, &b)| if a == b { GROUP_BITS } else { (a & b).count_ones() as usize })
            .sum()
    }

    /// First index `>= offset` whose bit equals `state`.
    ///
    /// Searching for `true` yields `None` when no such bit exists. Searching
    /// for `false` always succeeds, because the mask is zero past its end.
    pub fn index_of(&self, state: bool, offset: usize) -> Option<usize> {
        let (mut group, _) = split(offset);
        let mut word_mask = !0u64 << (offset % GROUP_BITS);
        while group < self.groups.len() {
            let word = if state { self.groups[group] } else { !self.groups[group] };
            let candidates = word & word_mask;
            if candidates != 0 {
                return Some(group * GROUP_BITS + candidates.trailing_zeros() as usize);
            }
            word_mask = !0;
            group += 1;
        }
        if state {
            None
        } else {
            Some(offset.max(self.groups.len() * GROUP_BITS))
        }
    }

    /// Inserts `state` at `index`, shifting every bit at or above `index` up by one.
    pub fn insert(&mut self, index: usize, state: bool) {
        let (group, _) = split(index);
        if group >= self.groups.len() {
            self.set(index, state);
            return;
        }
        if self.groups.last().is_some_and(|&g| g >> (GROUP_BITS - 1) != 0) {
            self.groups.push(0);
        }
        let within = index % GROUP_BITS;
        let word = self.groups[group];
        let low_mask = (1u64 << within) - 1;
        let mut carry = word >> (GROUP_BITS - 1);
        self.groups[group] = (word & low_mask) | ((word & !low_mask) << 1) | ((state as u64) << within);
        for word in self.groups[group + 1..].iter_mut() {
            let next = *word >> (GROUP_BITS - 1);
            *word = (*word << 1) | carry;
            carry = next;
        }
        debug_assert_eq!(carry, 0);
    }

    /// Removes the bit at `index`, shifting every bit above it down by one.
    pub fn remove(&mut self, index: usize) {
        let (group, _) = split(index);
        if group >= self.groups.len() {
            return;
        }
        let within = index % GROUP_BITS;
        let word = self.groups[group];
        let low_mask = (1u64 << within) - 1;
        let low = word & low_mask;
        let high = (word >> 1) & !low_mask;
        let incoming = self.groups.get(group + 1).map_or(0, |&next| next & 1);
        self.groups[group] = low | high | (incoming << (GROUP_BITS - 1));
        let len = self.groups.len();
        for i in group + 1..len {
            let incoming = if i + 1 < len { self.groups[i + 1] & 1 } else { 0 };
            self.groups[i] = (self.groups[i] >> 1) | (incoming << (GROUP_BITS - 1));
        }
    }

    /// Iterates over the indices of set bits in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.groups.iter().enumerate().flat_map(|(group_index, &group)| {
            let base = group_index * GROUP_BITS;
            let mut bits = group;
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let tz = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(base + tz)
            })
        })
    }

    /// Hash over the canonical form; trailing zero groups do not affect it.
    pub fn calc_hash(&self) -> u64 {
        self.canonical_groups()
            .iter()
            .rev()
            .fold(0u64, |seed, &group| hash_combine(seed, group))
    }
}

impl PartialEq for BitMask {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_groups() == other.canonical_groups()
    }
}

impl Eq for BitMask {}

impl Hash for BitMask {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.calc_hash());
    }
}

impl fmt::Debug for BitMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter_ones()).finish()
    }
}

impl BitOrAssign<&BitMask> for BitMask {
    fn bitor_assign(&mut self, rhs: &BitMask) {
        if rhs.groups.len() > self.groups.len() {
            self.groups.resize(rhs.groups.len(), 0);
        }
        for (a, b) in self.groups.iter_mut().zip(rhs.groups.iter()) {
            *a |= b;
        }
    }
}

impl BitAndAssign<&BitMask> for BitMask {
    fn bitand_assign(&mut self, rhs: &BitMask) {
        for (i, a) in self.groups.iter_mut().enumerate() {
            *a &= rhs.group_at(i);
        }
    }
}

impl SubAssign<&BitMask> for BitMask {
    fn sub_assign(&mut self, rhs: &BitMask) {
        for (a, b) in self.groups.iter_mut().zip(rhs.groups.iter()) {
            *a &= !b;
        }
    }
}

impl BitOr for &BitMask {
    type Output = BitMask;

    fn bitor(self, rhs: &BitMask) -> BitMask {
        let mut out = self.clone();
        out |= rhs;
        out
    }
}

impl BitAnd for &BitMask {
    type Output = BitMask;

    fn bitand(self, rhs: &BitMask) -> BitMask {
        let mut out = self.clone();
        out &= rhs;
        out
    }
}

impl BitXor for &BitMask {
    type Output = BitMask;

    fn bitxor(self, rhs: &BitMask) -> BitMask {
        let len = self.groups.len().max(rhs.groups.len());
        BitMask { groups: (0..len).map(|i| self.group_at(i) ^ rhs.group_at(i)).collect() }
    }
}

impl Sub for &BitMask {
    type Output = BitMask;

    fn sub(self, rhs: &BitMask) -> BitMask {
        let mut out = self.clone();
        out -= rhs;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seed: u64) -> BitMask {
        let mut state = seed.wrapping_mul(GOLDEN) | 1;
        let mut mask = BitMask::new();
        for _ in 0..40 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            mask.set((state % 300) as usize, true);
        }
        mask
    }

    #[test]
    fn set_grows_only_for_true_bits() {
        let mut mask = BitMask::new();
        mask.set(500, false);
        assert_eq!(mask.groups_len(), 0);
        mask.set(130, true);
        assert_eq!(mask.groups_len(), 3);
        assert!(mask.at(130));
        assert!(!mask.at(129));
        assert!(!mask.at(10_000));
    }

    #[test]
    fn includes_matches_intersection_definition() {
        for seed in 0..32 {
            let a = sample(seed);
            let b = sample(seed + 100);
            let sub = &a & &b;
            assert_eq!(a.includes(&b), (&a & &b) == b);
            assert!(a.includes(&sub));
            assert!(a.includes(&BitMask::new()));
        }
    }

    #[test]
    fn differences_count_is_popcount_of_xor() {
        for seed in 0..32 {
            let a = sample(seed);
            let b = sample(seed * 7 + 3);
            assert_eq!(a.differences_count(&b), (&a ^ &b).count());
        }
    }

    #[test]
    fn union_is_associative_with_zero_identity() {
        let (a, b, c) = (sample(1), sample(2), sample(3));
        assert_eq!(&(&a | &b) | &c, &a | &(&b | &c));
        assert_eq!(&a | &BitMask::new(), a);
    }

    #[test]
    fn hash_ignores_trailing_zero_groups() {
        let mut a = BitMask::from_indices([3, 70]);
        let b = a.clone();
        a.set(400, true);
        a.set(400, false);
        assert_ne!(a.groups_len(), b.groups_len());
        assert_eq!(a.calc_hash(), b.calc_hash());
        assert_eq!(a, b);
    }

    #[test]
    fn insert_shifts_higher_bits_up() {
        for seed in 0..16 {
            let original = sample(seed);
            for index in [0usize, 1, 63, 64, 65, 200] {
                for state in [false, true] {
                    let mut mask = original.clone();
                    mask.insert(index, state);
                    assert_eq!(mask.at(index), state);
                    for bit in 0..index {
                        assert_eq!(mask.at(bit), original.at(bit));
                    }
                    for bit in index..400 {
                        assert_eq!(mask.at(bit + 1), original.at(bit), "bit {bit}");
                    }
                }
            }
        }
    }

    #[test]
    fn remove_undoes_insert() {
        let original = sample(9);
        let mut mask = original.clone();
        mask.insert(64, true);
        mask.remove(64);
        assert_eq!(mask, original);
    }

    #[test]
    fn index_of_finds_requested_state() {
        let mask = BitMask::from_indices([2, 3, 64, 65]);
        assert_eq!(mask.index_of(true, 0), Some(2));
        assert_eq!(mask.index_of(true, 4), Some(64));
        assert_eq!(mask.index_of(true, 66), None);
        assert_eq!(mask.index_of(false, 2), Some(4));
        assert_eq!(mask.index_of(false, 64), Some(66));
        assert_eq!(mask.index_of(false, 500), Some(500));
    }

    #[test]
    fn inclusions_count_treats_equal_groups_as_full() {
        let a = BitMask::from_indices([0, 1]);
        let b = BitMask::from_indices([0, 1]);
        let c = BitMask::from_indices([0, 5]);
        assert_eq!(a.inclusions_count(&b), 64);
        assert_eq!(a.inclusions_count(&c), 1);
    }
}
