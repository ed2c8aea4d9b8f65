//! Bit-level cell builder and constructors for special cells

use super::bits;
use super::{Cell, DataCell, LevelMask, SpecialType, MAX_BITS, MAX_REFS};
use crate::{Error, Result};
use std::sync::Arc;

/// Accumulates data bits and references for a new cell
#[derive(Clone)]
pub struct CellBuilder {
    data: [u8; 128],
    bits: usize,
    refs: Vec<Cell>,
}

impl Default for CellBuilder {
    fn default() -> Self {
        CellBuilder::new()
    }
}

impl CellBuilder {
    pub fn new() -> Self {
        CellBuilder {
            data: [0u8; 128],
            bits: 0,
            refs: Vec::with_capacity(MAX_REFS),
        }
    }

    pub fn bit_len(&self) -> usize {
        self.bits
    }

    pub fn remaining_bits(&self) -> usize {
        MAX_BITS - self.bits
    }

    pub fn refs_count(&self) -> usize {
        self.refs.len()
    }

    fn reserve(&self, len: usize) -> Result<()> {
        if len > self.remaining_bits() {
            return Err(Error::CellWrite(format!(
                "cannot store {} bits, {} left",
                len,
                self.remaining_bits()
            )));
        }
        Ok(())
    }

    /// Append the first `len` bits of `src`
    pub fn store_bits(&mut self, src: &[u8], len: usize) -> Result<&mut Self> {
        self.store_bits_from(src, 0, len)
    }

    /// Append `len` bits of `src` starting at bit `offset`
    pub fn store_bits_from(&mut self, src: &[u8], offset: usize, len: usize) -> Result<&mut Self> {
        self.reserve(len)?;
        bits::copy_bits(&mut self.data, self.bits, src, offset, len);
        self.bits += len;
        Ok(self)
    }

    pub fn store_bytes(&mut self, bytes: &[u8]) -> Result<&mut Self> {
        self.store_bits(bytes, bytes.len() * 8)
    }

    /// Append the low `len` bits of `value`, big-endian
    pub fn store_u64(&mut self, value: u64, len: usize) -> Result<&mut Self> {
        if len > 64 {
            return Err(Error::CellWrite(format!("cannot store a {}-bit integer", len)));
        }
        self.reserve(len)?;
        bits::store_uint(&mut self.data, self.bits, value, len);
        self.bits += len;
        Ok(self)
    }

    pub fn store_ref(&mut self, cell: Cell) -> Result<&mut Self> {
        if self.refs.len() >= MAX_REFS {
            return Err(Error::CellWrite("too many references".into()));
        }
        self.refs.push(cell);
        Ok(self)
    }

    /// Build the cell, running the full validation
    pub fn finalize(&self, special: bool) -> Result<Arc<DataCell>> {
        DataCell::create(&self.data, self.bits, self.refs.clone(), special)
    }

    pub fn finalize_cell(&self, special: bool) -> Result<Cell> {
        Ok(Cell::Data(self.finalize(special)?))
    }

    /// Replace `cell` with a pruned branch of level `new_level`
    ///
    /// Hashes above `virt_level` are dropped. Leaves without virtualization
    /// whose level already fits are returned unchanged.
    pub fn create_pruned_branch(cell: &Cell, new_level: u32, virt_level: u32) -> Result<Cell> {
        if cell.is_loaded() && cell.level() <= virt_level && cell.virtualization() == 0 {
            let loaded = cell.load()?;
            if loaded.data_cell.refs_count() == 0 {
                return Ok(Cell::Data(loaded.data_cell));
            }
        }

        let level_mask = cell.level_mask().apply(virt_level);
        let level = level_mask.level();
        if new_level < level + 1 {
            return Err(Error::CellWrite(format!(
                "cannot create pruned branch of level {} over a level {} cell",
                new_level, level
            )));
        }

        let mut cb = CellBuilder::new();
        cb.store_u64(SpecialType::PrunedBranch.as_byte() as u64, 8)?;
        cb.store_u64(
            level_mask.apply_or(LevelMask::one_level(new_level)).mask() as u64,
            8,
        )?;
        for i in 0..=level {
            if level_mask.is_significant(i) {
                cb.store_bytes(cell.hash(i).as_bytes())?;
            }
        }
        for i in 0..=level {
            if level_mask.is_significant(i) {
                cb.store_u64(cell.depth(i) as u64, 16)?;
            }
        }
        cb.finalize_cell(true)
    }

    /// Wrap `cell` into a MerkleProof cell
    pub fn create_merkle_proof(cell: Cell) -> Result<Cell> {
        let mut cb = CellBuilder::new();
        cb.store_u64(SpecialType::MerkleProof.as_byte() as u64, 8)?
            .store_bytes(cell.hash(0).as_bytes())?
            .store_u64(cell.depth(0) as u64, 16)?
            .store_ref(cell)?;
        cb.finalize_cell(true)
    }

    /// Build a MerkleUpdate cell from the before and after proofs
    pub fn create_merkle_update(from: Cell, to: Cell) -> Result<Cell> {
        let mut cb = CellBuilder::new();
        cb.store_u64(SpecialType::MerkleUpdate.as_byte() as u64, 8)?
            .store_bytes(from.hash(0).as_bytes())?
            .store_bytes(to.hash(0).as_bytes())?
            .store_u64(from.depth(0) as u64, 16)?
            .store_u64(to.depth(0) as u64, 16)?
            .store_ref(from)?
            .store_ref(to)?;
        cb.finalize_cell(true)
    }
}
