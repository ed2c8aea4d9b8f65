//! Read cursor over a loaded cell

use super::bits;
use super::{
    Cell, DataCell, LoadedCell, SpecialType, UsageCell, UsageNode, VirtualizationParameters,
};
use crate::{Error, Result};
use std::sync::Arc;

/// Cursor over the bits and references of a loaded cell
///
/// Children handed out by [`CellSlice::prefetch_ref`] inherit the view the
/// cell was loaded through: the virtualization level shifts past Merkle
/// cells, and a usage tree node records every child that gets opened.
#[derive(Clone)]
pub struct CellSlice {
    cell: Arc<DataCell>,
    virt: VirtualizationParameters,
    tree_node: Option<UsageNode>,
    bits_st: usize,
    bits_en: usize,
    refs_st: usize,
    refs_en: usize,
}

impl CellSlice {
    pub fn new(loaded: LoadedCell) -> Self {
        let bits_en = loaded.data_cell.bit_len();
        let refs_en = loaded.data_cell.refs_count();
        CellSlice {
            cell: loaded.data_cell,
            virt: loaded.virt,
            tree_node: loaded.tree_node,
            bits_st: 0,
            bits_en,
            refs_st: 0,
            refs_en,
        }
    }

    /// Load an ordinary cell; special cells are rejected
    pub fn load(cell: &Cell) -> Result<Self> {
        let cs = Self::load_special(cell)?;
        match cs.special_type() {
            SpecialType::Ordinary => Ok(cs),
            SpecialType::PrunedBranch if cs.virt.virtualization() != 0 => {
                Err(Error::Virtualization)
            }
            SpecialType::PrunedBranch => Err(Error::PrunedBranch),
            other => Err(Error::InvalidCell(format!(
                "unexpected special cell {:?}",
                other
            ))),
        }
    }

    /// Load any cell, special ones included
    pub fn load_special(cell: &Cell) -> Result<Self> {
        Ok(Self::new(cell.load()?))
    }

    pub fn data_cell(&self) -> &Arc<DataCell> {
        &self.cell
    }

    pub fn virt(&self) -> VirtualizationParameters {
        self.virt
    }

    pub fn tree_node(&self) -> Option<&UsageNode> {
        self.tree_node.as_ref()
    }

    pub fn special_type(&self) -> SpecialType {
        self.cell.special_type()
    }

    pub fn is_special(&self) -> bool {
        self.cell.is_special()
    }

    pub fn level(&self) -> u32 {
        self.cell.level()
    }

    /// Total bits of the underlying cell
    pub fn bit_len(&self) -> usize {
        self.cell.bit_len()
    }

    /// Raw data of the underlying cell
    pub fn data(&self) -> &[u8] {
        self.cell.data()
    }

    /// Total references of the underlying cell
    pub fn refs_count(&self) -> usize {
        self.cell.refs_count()
    }

    /// Bits left to read
    pub fn size(&self) -> usize {
        self.bits_en - self.bits_st
    }

    /// References left to read
    pub fn size_refs(&self) -> usize {
        self.refs_en - self.refs_st
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0 && self.size_refs() == 0
    }

    /// Level seen by children of this cell
    pub fn child_merkle_depth(&self, depth: u32) -> u32 {
        if depth == VirtualizationParameters::NO_LEVEL {
            return depth;
        }
        if self.special_type().is_merkle() {
            return depth + 1;
        }
        depth
    }

    fn child_virt(&self) -> VirtualizationParameters {
        let level = self.child_merkle_depth(self.virt.level()).min(VirtualizationParameters::NO_LEVEL);
        VirtualizationParameters::new(level as u8, self.virt.virtualization() as u8)
    }

    /// Reference `i` (counted from the cursor) as seen through this view
    pub fn prefetch_ref(&self, i: usize) -> Option<Cell> {
        if i >= self.size_refs() {
            return None;
        }
        let idx = self.refs_st + i;
        let child = self.cell.refs()[idx].virtualize(self.child_virt());
        match &self.tree_node {
            Some(node) => Some(UsageCell::create(child, node.create_child(idx))),
            None => Some(child),
        }
    }

    pub fn fetch_ref(&mut self) -> Result<Cell> {
        let cell = self
            .prefetch_ref(0)
            .ok_or_else(|| Error::InvalidCell("no references left".into()))?;
        self.refs_st += 1;
        Ok(cell)
    }

    pub fn prefetch_u64(&self, len: usize) -> Result<u64> {
        if len > 64 || len > self.size() {
            return Err(Error::InvalidCell(format!("cannot read {} bits", len)));
        }
        Ok(bits::load_uint(self.cell.data(), self.bits_st, len))
    }

    pub fn fetch_u64(&mut self, len: usize) -> Result<u64> {
        let v = self.prefetch_u64(len)?;
        self.bits_st += len;
        Ok(v)
    }

    /// Read `len` bits into a fresh buffer, left-aligned
    pub fn fetch_bits(&mut self, len: usize) -> Result<Vec<u8>> {
        if len > self.size() {
            return Err(Error::InvalidCell(format!("cannot read {} bits", len)));
        }
        let mut out = vec![0u8; (len + 7) / 8];
        bits::copy_bits(&mut out, 0, self.cell.data(), self.bits_st, len);
        self.bits_st += len;
        Ok(out)
    }

    pub fn fetch_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        self.fetch_bits(len * 8)
    }

    pub fn skip_bits(&mut self, len: usize) -> Result<()> {
        if len > self.size() {
            return Err(Error::InvalidCell(format!("cannot skip {} bits", len)));
        }
        self.bits_st += len;
        Ok(())
    }

    /// Remaining bits as hex, `_` marking a partial nibble
    pub fn to_hex(&self) -> String {
        let len = self.size();
        let mut buf = vec![0u8; (len + 7) / 8];
        bits::copy_bits(&mut buf, 0, self.cell.data(), self.bits_st, len);
        bits::to_hex(&buf, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellBuilder;

    #[test]
    fn test_read_cursor() {
        let mut leaf = CellBuilder::new();
        leaf.store_bytes(b"z").unwrap();
        let leaf = leaf.finalize_cell(false).unwrap();
        let mut cb = CellBuilder::new();
        cb.store_u64(0xabc, 12).unwrap().store_ref(leaf.clone()).unwrap();
        let cell = cb.finalize_cell(false).unwrap();

        let mut cs = CellSlice::load(&cell).unwrap();
        assert_eq!(cs.size(), 12);
        assert_eq!(cs.fetch_u64(4).unwrap(), 0xa);
        assert_eq!(cs.to_hex(), "BC");
        assert_eq!(cs.fetch_bits(8).unwrap(), vec![0xbc]);
        assert!(cs.fetch_u64(1).is_err());
        let child = cs.fetch_ref().unwrap();
        assert!(child.ptr_eq(&leaf));
        assert!(cs.is_empty());
        assert!(cs.prefetch_ref(0).is_none());
    }

    #[test]
    fn test_strict_load_rejects_pruned() {
        let leaf = CellBuilder::new().finalize_cell(false).unwrap();
        let mut cb = CellBuilder::new();
        cb.store_ref(leaf).unwrap();
        let parent = cb.finalize_cell(false).unwrap();
        let pruned = CellBuilder::create_pruned_branch(&parent, 1, 3).unwrap();
        assert!(matches!(CellSlice::load(&pruned), Err(Error::PrunedBranch)));
        let raw = CellSlice::load_special(&pruned).unwrap();
        assert_eq!(raw.special_type(), SpecialType::PrunedBranch);
    }

    #[test]
    fn test_child_merkle_depth() {
        let leaf = CellBuilder::new().finalize_cell(false).unwrap();
        let proof = CellBuilder::create_merkle_proof(leaf).unwrap();
        let cs = CellSlice::load_special(&proof).unwrap();
        assert_eq!(cs.child_merkle_depth(0), 1);
        assert_eq!(cs.child_merkle_depth(255), 255);
    }
}
