//! Merkle proofs and Merkle updates over cell trees
//!
//! A proof is a copy of a tree where every subtree the verifier does not
//! need is replaced by a pruned branch carrying only its hashes. An update
//! pairs a proof of the old tree with a proof of the new one; the new proof
//! prunes every subtree it shares with the old one.

mod proof;
mod update;

pub use proof::{MerkleProof, MerkleProofBuilder};
pub use update::MerkleUpdate;

use crate::cell::{Cell, CellBuilder, CellHash, CellSlice, NodeId, SpecialType, MAX_LEVEL};
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};

pub(crate) fn merkle_err(msg: impl Into<String>) -> Error {
    Error::Merkle(msg.into())
}

/// Reference `i` of a slice that must have it
pub(crate) fn child_at(cs: &CellSlice, i: usize) -> Result<Cell> {
    cs.prefetch_ref(i)
        .ok_or_else(|| merkle_err(format!("missing reference #{}", i)))
}

pub(crate) fn is_pruned_branch(cs: &CellSlice) -> bool {
    cs.special_type() == SpecialType::PrunedBranch
}

/// Copy of the loaded cell with new references
pub(crate) fn rebuild(cs: &CellSlice, refs: Vec<Cell>) -> Result<Cell> {
    let mut cb = CellBuilder::new();
    cb.store_bits(cs.data(), cs.size())?;
    for r in refs {
        cb.store_ref(r)?;
    }
    cb.finalize_cell(cs.is_special())
}

/// What the merged proofs know about one cell
#[derive(Default)]
pub(crate) struct Revealed {
    pub cell: Option<Cell>,
    /// Pruned branches seen for this cell, by level - 1
    pub pruned: [Option<Cell>; MAX_LEVEL as usize],
    pub node: NodeId,
}

impl Revealed {
    fn any_cell(&self) -> Option<&Cell> {
        self.cell
            .as_ref()
            .or_else(|| self.pruned.iter().flatten().next())
    }

    /// Pruned branch standing for this cell at `depth`, reusing one already seen
    pub fn pruned_at(&self, depth: u32, merkle_depth: u32) -> Result<Cell> {
        if let Some(Some(cell)) = self.pruned.get(depth as usize) {
            return Ok(cell.clone());
        }
        let any = self
            .any_cell()
            .ok_or_else(|| merkle_err("no cell known for a pruned branch"))?;
        CellBuilder::create_pruned_branch(any, depth + 1, merkle_depth)
    }
}

/// Every cell reachable in the virtualized views of a set of proofs,
/// keyed by its hash at the level it was reached
#[derive(Default)]
pub(crate) struct RevealedCells {
    cells: HashMap<CellHash, Revealed>,
    visited: HashSet<(CellHash, u32)>,
}

impl RevealedCells {
    pub fn clear_visited(&mut self) {
        self.visited.clear();
    }

    pub fn load(&mut self, cell: &Cell, merkle_depth: u32) -> Result<()> {
        if !self.visited.insert((cell.repr_hash(), merkle_depth)) {
            return Ok(());
        }
        let cs = CellSlice::load_special(cell)?;
        let entry = self.cells.entry(cell.hash(merkle_depth)).or_default();
        // pruned branch bounded by the current proof
        if is_pruned_branch(&cs) && cell.level() > merkle_depth {
            entry.pruned[cell.level() as usize - 1] = Some(cell.clone());
            return Ok(());
        }
        entry.cell = Some(cell.clone());

        let child_depth = cs.child_merkle_depth(merkle_depth);
        for i in 0..cs.size_refs() {
            self.load(&child_at(&cs, i)?, child_depth)?;
        }
        Ok(())
    }

    pub fn get(&self, hash: &CellHash) -> Result<&Revealed> {
        self.cells
            .get(hash)
            .ok_or_else(|| merkle_err(format!("unknown cell {}", hash.to_hex())))
    }

    pub fn entry(&mut self, hash: CellHash) -> &mut Revealed {
        self.cells.entry(hash).or_default()
    }
}
