use crate::cell::CellHash;
use std::collections::HashMap;

/// Per-cell records keyed by representation hash
///
/// Not synchronized; the owner serializes access.
pub struct CellHashTable<T> {
    set: HashMap<CellHash, T>,
}

impl<T> Default for CellHashTable<T> {
    fn default() -> Self {
        CellHashTable {
            set: HashMap::new(),
        }
    }
}

impl<T: Default> CellHashTable<T> {
    /// Find or create the record for `hash`, then run `f` on it
    pub fn apply(&mut self, hash: CellHash, f: impl FnOnce(&mut T)) -> &mut T {
        let info = self.set.entry(hash).or_default();
        f(&mut *info);
        info
    }
}

impl<T> CellHashTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, hash: &CellHash) -> Option<&T> {
        self.set.get(hash)
    }

    pub fn get_mut(&mut self, hash: &CellHash) -> Option<&mut T> {
        self.set.get_mut(hash)
    }

    pub fn for_each(&self, mut f: impl FnMut(&CellHash, &T)) {
        for (hash, info) in &self.set {
            f(hash, info);
        }
    }

    /// Keep only records for which `f` returns true
    pub fn filter(&mut self, mut f: impl FnMut(&CellHash, &mut T) -> bool) {
        self.set.retain(|hash, info| f(hash, info));
    }

    pub fn erase(&mut self, hash: &CellHash) -> Option<T> {
        self.set.remove(hash)
    }

    pub fn size(&self) -> usize {
        self.set.len()
    }

    pub fn clear(&mut self) {
        self.set.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_creates_once() {
        let mut table: CellHashTable<u32> = CellHashTable::new();
        let h = CellHash::digest(b"x");
        *table.apply(h, |v| *v += 1) += 10;
        table.apply(h, |v| *v += 1);
        assert_eq!(table.get(&h), Some(&12));
        assert_eq!(table.size(), 1);

        table.apply(CellHash::digest(b"y"), |_| {});
        table.filter(|_, v| *v > 0);
        assert_eq!(table.size(), 1);
        let mut total = 0;
        table.for_each(|_, v| total += *v);
        assert_eq!(total, 12);
        assert_eq!(table.erase(&h), Some(12));
        assert_eq!(table.size(), 0);
    }
}
