use crate::cell::{Cell, CellHash, CellSlice};
use crate::Result;
use std::collections::HashSet;

/// Number of cells and data bits a tree occupies
#[derive(Debug, Default)]
pub struct CellStorageStat {
    pub cells: u64,
    pub bits: u64,
    seen: HashSet<CellHash>,
}

impl CellStorageStat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate the cells under `cell`
    ///
    /// With `kill_dup`, a cell already counted (by this or an earlier call)
    /// is skipped along with its subtree.
    pub fn compute_used_storage(&mut self, cell: &Cell, kill_dup: bool) -> Result<()> {
        if kill_dup && !self.seen.insert(cell.repr_hash()) {
            return Ok(());
        }
        let cs = CellSlice::load_special(cell)?;
        self.cells += 1;
        self.bits += cs.size() as u64;
        for i in 0..cs.size_refs() {
            if let Some(child) = cs.prefetch_ref(i) {
                self.compute_used_storage(&child, kill_dup)?;
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellBuilder;

    #[test]
    fn test_shared_cells_counted_once() {
        let mut leaf = CellBuilder::new();
        leaf.store_u64(7, 5).unwrap();
        let leaf = leaf.finalize_cell(false).unwrap();
        let mut root = CellBuilder::new();
        root.store_bytes(b"r").unwrap();
        root.store_ref(leaf.clone()).unwrap().store_ref(leaf).unwrap();
        let root = root.finalize_cell(false).unwrap();

        let mut stat = CellStorageStat::new();
        stat.compute_used_storage(&root, true).unwrap();
        assert_eq!((stat.cells, stat.bits), (2, 13));

        stat.clear();
        stat.compute_used_storage(&root, false).unwrap();
        assert_eq!((stat.cells, stat.bits), (3, 18));
    }
}
