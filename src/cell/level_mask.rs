//! Level masks for multi-level cell hashes
//!
//! Bit `i` of the mask set means level `i + 1` is significant. Level 0 is
//! always significant.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 3-bit set of significant hash levels
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LevelMask(u8);

impl LevelMask {
    pub const MAX_LEVEL: u32 = 3;

    pub fn new(mask: u8) -> Self {
        LevelMask(mask & 7)
    }

    /// Mask with only level `level` set (empty for level 0)
    pub fn one_level(level: u32) -> Self {
        if level == 0 {
            LevelMask(0)
        } else {
            LevelMask::new(1 << (level - 1))
        }
    }

    pub fn mask(&self) -> u8 {
        self.0
    }

    /// Highest significant level
    pub fn level(&self) -> u32 {
        8 - self.0.leading_zeros()
    }

    /// Number of hashes a cell with this mask carries
    pub fn hashes_count(&self) -> usize {
        self.0.count_ones() as usize + 1
    }

    /// Index of the top hash among the significant ones
    pub fn hash_index(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_significant(&self, level: u32) -> bool {
        level == 0 || (level <= Self::MAX_LEVEL && (self.0 >> (level - 1)) & 1 != 0)
    }

    /// Keep only levels `<= level`
    pub fn apply(&self, level: u32) -> Self {
        if level >= 8 {
            return *self;
        }
        LevelMask(self.0 & ((1u8 << level) - 1))
    }

    pub fn apply_or(&self, other: LevelMask) -> Self {
        LevelMask(self.0 | other.0)
    }

    pub fn shift_right(&self) -> Self {
        LevelMask(self.0 >> 1)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for LevelMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LevelMask({:03b})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level() {
        assert_eq!(LevelMask::new(0).level(), 0);
        assert_eq!(LevelMask::new(1).level(), 1);
        assert_eq!(LevelMask::new(2).level(), 2);
        assert_eq!(LevelMask::new(3).level(), 2);
        assert_eq!(LevelMask::new(5).level(), 3);
    }

    #[test]
    fn test_hash_counts() {
        let mask = LevelMask::new(0b101);
        assert_eq!(mask.hashes_count(), 3);
        assert_eq!(mask.hash_index(), 2);
        assert_eq!(mask.apply(1).hash_index(), 1);
        assert_eq!(mask.apply(2).hash_index(), 1);
        assert_eq!(mask.apply(0).hash_index(), 0);
    }

    #[test]
    fn test_significance() {
        let mask = LevelMask::new(0b010);
        assert!(mask.is_significant(0));
        assert!(!mask.is_significant(1));
        assert!(mask.is_significant(2));
        assert!(!mask.is_significant(3));
    }

    #[test]
    fn test_shift_and_one_level() {
        assert_eq!(LevelMask::new(0b110).shift_right(), LevelMask::new(0b011));
        assert_eq!(LevelMask::one_level(0), LevelMask::new(0));
        assert_eq!(LevelMask::one_level(3), LevelMask::new(0b100));
        assert_eq!(LevelMask::new(7).apply(255), LevelMask::new(7));
    }
}
