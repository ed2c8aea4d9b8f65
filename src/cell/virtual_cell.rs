use super::{Cell, CellHash, LevelMask, LoadedCell, VirtualizationParameters};
use crate::Result;
use std::sync::Arc;

/// A view of a cell with hash levels above `virt.level()` cut off
pub struct VirtualCell {
    virt: VirtualizationParameters,
    cell: Cell,
}

impl VirtualCell {
    /// Wrap `cell` unless its level already fits under the cap
    pub fn create(virt: VirtualizationParameters, cell: Cell) -> Cell {
        if cell.level() <= virt.level() {
            return cell;
        }
        Cell::Virtual(Arc::new(VirtualCell { virt, cell }))
    }

    pub fn virt(&self) -> VirtualizationParameters {
        self.virt
    }

    pub fn inner(&self) -> &Cell {
        &self.cell
    }

    pub fn level_mask(&self) -> LevelMask {
        self.cell.level_mask().apply(self.virt.level())
    }

    pub fn hash(&self, level: u32) -> CellHash {
        self.cell.hash(self.level_mask().apply(level).level())
    }

    pub fn depth(&self, level: u32) -> u16 {
        self.cell.depth(self.level_mask().apply(level).level())
    }

    pub fn load(&self) -> Result<LoadedCell> {
        let mut loaded = self.cell.load()?;
        loaded.virt = loaded.virt.apply(self.virt);
        Ok(loaded)
    }

    pub fn virtualize(self: &Arc<Self>, virt: VirtualizationParameters) -> Cell {
        let new_virt = self.virt.apply(virt);
        if new_virt == self.virt {
            return Cell::Virtual(self.clone());
        }
        VirtualCell::create(new_virt, self.cell.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellBuilder;

    fn level_one_cell() -> Cell {
        let leaf = CellBuilder::new().finalize_cell(false).unwrap();
        let mut cb = CellBuilder::new();
        cb.store_ref(leaf).unwrap();
        let parent = cb.finalize_cell(false).unwrap();
        let pruned = CellBuilder::create_pruned_branch(&parent, 1, 3).unwrap();
        let mut cb = CellBuilder::new();
        cb.store_bytes(b"top").unwrap().store_ref(pruned).unwrap();
        cb.finalize_cell(false).unwrap()
    }

    #[test]
    fn test_virtualize_caps_level() {
        let cell = level_one_cell();
        assert_eq!(cell.level(), 1);
        let view = cell.virtualize(VirtualizationParameters::new(0, 1));
        assert!(matches!(view, Cell::Virtual(_)));
        assert_eq!(view.level(), 0);
        assert_eq!(view.repr_hash(), cell.hash(0));
        assert_eq!(view.load().unwrap().virt.virtualization(), 1);
    }

    #[test]
    fn test_virtualize_noop_when_level_fits() {
        let cell = CellBuilder::new().finalize_cell(false).unwrap();
        let view = cell.virtualize(VirtualizationParameters::new(0, 1));
        assert!(view.ptr_eq(&cell));
    }

    #[test]
    fn test_revirtualize_same_params_is_identity() {
        let cell = level_one_cell();
        let v = VirtualizationParameters::new(0, 1);
        let view = cell.virtualize(v);
        assert!(view.virtualize(v).ptr_eq(&view));
        assert!(view.virtualize(VirtualizationParameters::default()).ptr_eq(&view));
    }
}
