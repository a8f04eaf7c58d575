//! A 256-entry bitmap supporting O(1) "find highest set bit".
//!
//! Grounded on `r3_kernel`'s `utils::prio_bitmap::FixedPrioBitmap`, which
//! builds an arbitrary-length bitmap out of nested one-/two-level const
//! generics (`OneLevelPrioBitmapImpl`, `TwoLevelPrioBitmapImpl`) so that a
//! `r3_kernel` application can pick any priority count at compile time. This
//! crate fixes the priority range at exactly 256 levels (base priority
//! ∈ [0, 255]), so the general const-generic machinery collapses to one
//! concrete two-level bitmap: a 4-bit summary word over four 64-bit group
//! words.
//!
//! Priority 255 is highest; "find highest set bit" is implemented as "find
//! highest", matching that convention directly rather than negating
//! priorities to reuse a find-lowest primitive.

const GROUPS: usize = 4;
const BITS_PER_GROUP: u32 = 64;

/// A bitmap over priorities `0..=255`, 255 highest.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityBitmap {
    /// Bit `g` is set iff `groups[g] != 0`.
    summary: u8,
    groups: [u64; GROUPS],
}

impl PriorityBitmap {
    pub const fn new() -> Self {
        Self {
            summary: 0,
            groups: [0; GROUPS],
        }
    }

    #[inline]
    fn split(priority: u8) -> (usize, u32) {
        let priority = priority as u32;
        (
            (priority / BITS_PER_GROUP) as usize,
            priority % BITS_PER_GROUP,
        )
    }

    #[inline]
    pub fn get(&self, priority: u8) -> bool {
        let (group, bit) = Self::split(priority);
        (self.groups[group] >> bit) & 1 != 0
    }

    #[inline]
    pub fn set(&mut self, priority: u8) {
        let (group, bit) = Self::split(priority);
        self.groups[group] |= 1 << bit;
        self.summary |= 1 << group;
    }

    #[inline]
    pub fn clear(&mut self, priority: u8) {
        let (group, bit) = Self::split(priority);
        self.groups[group] &= !(1 << bit);
        if self.groups[group] == 0 {
            self.summary &= !(1 << group);
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.summary == 0
    }

    /// The highest set bit, if any — the priority the ready-selection
    /// algorithm scans for.
    #[inline]
    pub fn highest_set(&self) -> Option<u8> {
        if self.summary == 0 {
            return None;
        }
        let group = 7 - self.summary.leading_zeros() as usize;
        let word = self.groups[group];
        debug_assert_ne!(word, 0);
        let bit = 63 - word.leading_zeros();
        Some((group as u32 * BITS_PER_GROUP + bit) as u8)
    }

    /// True iff any bit in `priority..` (i.e. strictly-higher-or-equal
    /// priorities, since 255 is highest) is set. Used by
    /// `unlock_cpu_and_check_preemption` to decide whether a just-readied
    /// thread should preempt.
    #[inline]
    pub fn has_set_at_or_above(&self, priority: u8) -> bool {
        match self.highest_set() {
            Some(highest) => highest >= priority,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn empty_has_no_highest() {
        let bm = PriorityBitmap::new();
        assert_eq!(bm.highest_set(), None);
        assert!(bm.is_empty());
    }

    #[test]
    fn highest_wins_over_lower_bits() {
        let mut bm = PriorityBitmap::new();
        bm.set(10);
        bm.set(200);
        bm.set(5);
        assert_eq!(bm.highest_set(), Some(200));
    }

    #[test]
    fn clearing_the_only_bit_in_a_group_clears_the_summary() {
        let mut bm = PriorityBitmap::new();
        bm.set(130);
        assert!(!bm.is_empty());
        bm.clear(130);
        assert!(bm.is_empty());
        assert_eq!(bm.highest_set(), None);
    }

    #[test]
    fn boundary_priorities() {
        let mut bm = PriorityBitmap::new();
        bm.set(0);
        bm.set(255);
        assert_eq!(bm.highest_set(), Some(255));
        bm.clear(255);
        assert_eq!(bm.highest_set(), Some(0));
    }

    #[quickcheck_macros::quickcheck]
    fn matches_a_reference_set(ops: Vec<(bool, u8)>) -> bool {
        let mut bm = PriorityBitmap::new();
        let mut reference = BTreeSet::new();
        for (insert, bit) in ops {
            if insert {
                bm.set(bit);
                reference.insert(bit);
            } else {
                bm.clear(bit);
                reference.remove(&bit);
            }
            if bm.highest_set() != reference.iter().next_back().copied() {
                return false;
            }
        }
        true
    }
}
