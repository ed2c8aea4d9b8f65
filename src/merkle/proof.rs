use super::{child_at, merkle_err, rebuild, RevealedCells};
use crate::boc::{std_boc_serialize, Mode};
use crate::cell::{
    Cell, CellBuilder, CellHash, CellSlice, CellUsageTree, NodeId, SpecialType,
    VirtualizationParameters, MAX_LEVEL,
};
use crate::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Copies a tree, pruning whatever the predicate selects
struct ProofGenerator<F> {
    is_pruned: F,
    cells: HashMap<(CellHash, u32), Cell>,
}

impl<F: FnMut(&Cell) -> Result<bool>> ProofGenerator<F> {
    fn new(is_pruned: F) -> Self {
        ProofGenerator {
            is_pruned,
            cells: HashMap::new(),
        }
    }

    fn create_from(&mut self, cell: &Cell) -> Result<Cell> {
        self.dfs(cell, cell.level())
    }

    fn dfs(&mut self, cell: &Cell, merkle_depth: u32) -> Result<Cell> {
        let key = (cell.repr_hash(), merkle_depth);
        if let Some(res) = self.cells.get(&key) {
            return Ok(res.clone());
        }
        let res = if (self.is_pruned)(cell)? {
            CellBuilder::create_pruned_branch(cell, merkle_depth + 1, MAX_LEVEL)?
        } else {
            let cs = CellSlice::load_special(cell)?;
            let child_depth = cs.child_merkle_depth(merkle_depth);
            let mut refs = Vec::with_capacity(cs.size_refs());
            for i in 0..cs.size_refs() {
                refs.push(self.dfs(&child_at(&cs, i)?, child_depth)?);
            }
            rebuild(&cs, refs)?
        };
        self.cells.insert(key, res.clone());
        Ok(res)
    }
}

/// Hashes of the cells a usage tree recorded as loaded
fn collect_visited(
    cell: &Cell,
    tree: &CellUsageTree,
    node: NodeId,
    visited: &mut HashSet<CellHash>,
) -> Result<()> {
    if !tree.is_loaded(node) {
        return Ok(());
    }
    visited.insert(cell.repr_hash());
    let cs = CellSlice::load_special(cell)?;
    for i in 0..cs.size_refs() {
        collect_visited(&child_at(&cs, i)?, tree, tree.get_child(node, i), visited)?;
    }
    Ok(())
}

fn check_level_zero(cell: &Cell) -> Result<()> {
    if cell.level() != 0 {
        return Err(merkle_err("level of a Merkle proof root must be zero"));
    }
    Ok(())
}

/// Merkle proof construction, opening and merging
pub struct MerkleProof;

impl MerkleProof {
    /// Proof revealing the cells `usage_tree` saw loaded
    pub fn generate(root: &Cell, usage_tree: &CellUsageTree) -> Result<Cell> {
        check_level_zero(root)?;
        CellBuilder::create_merkle_proof(Self::generate_raw(root, usage_tree)?)
    }

    /// Proof pruning every cell for which `is_pruned` holds
    pub fn generate_with(root: &Cell, is_pruned: impl FnMut(&Cell) -> bool) -> Result<Cell> {
        check_level_zero(root)?;
        CellBuilder::create_merkle_proof(Self::generate_raw_with(root, is_pruned)?)
    }

    /// Proof contents without the MerkleProof wrapper
    pub fn generate_raw(root: &Cell, usage_tree: &CellUsageTree) -> Result<Cell> {
        let mut visited = HashSet::new();
        collect_visited(root, usage_tree, usage_tree.root_id(), &mut visited)?;
        Self::generate_raw_checked(root, |cell| Ok(!visited.contains(&cell.repr_hash())))
    }

    pub fn generate_raw_with(root: &Cell, mut is_pruned: impl FnMut(&Cell) -> bool) -> Result<Cell> {
        Self::generate_raw_checked(root, |cell| Ok(is_pruned(cell)))
    }

    pub(crate) fn generate_raw_checked(
        root: &Cell,
        is_pruned: impl FnMut(&Cell) -> Result<bool>,
    ) -> Result<Cell> {
        ProofGenerator::new(is_pruned).create_from(root)
    }

    /// Proof contents of a level 0 MerkleProof cell
    pub fn unpack(proof: &Cell) -> Result<Cell> {
        check_level_zero(proof)?;
        let cs = CellSlice::load_special(proof)?;
        if cs.special_type() != SpecialType::MerkleProof {
            return Err(merkle_err("not a MerkleProof cell"));
        }
        child_at(&cs, 0)
    }

    pub fn virtualize_raw(cell: &Cell, virt: VirtualizationParameters) -> Cell {
        cell.virtualize(virt)
    }

    /// View of the proven tree; pruned parts fail to load
    pub fn virtualize(proof: &Cell, virtualization: u32) -> Result<Cell> {
        let raw = Self::unpack(proof)?;
        Ok(Self::virtualize_raw(
            &raw,
            VirtualizationParameters::new(0, virtualization as u8),
        ))
    }

    /// Proof revealing everything either proof reveals
    pub fn combine(a: &Cell, b: &Cell) -> Result<Cell> {
        let raw = Self::combine_raw(&Self::unpack(a)?, &Self::unpack(b)?)?;
        CellBuilder::create_merkle_proof(raw)
    }

    /// Same result as [`MerkleProof::combine`] with less rehashing
    pub fn combine_fast(a: &Cell, b: &Cell) -> Result<Cell> {
        let raw = Self::combine_fast_raw(&Self::unpack(a)?, &Self::unpack(b)?)?;
        CellBuilder::create_merkle_proof(raw)
    }

    pub fn combine_raw(a: &Cell, b: &Cell) -> Result<Cell> {
        check_same_root(a, b)?;
        let mut combiner = ProofCombiner::default();
        combiner.revealed.load(a, 0)?;
        combiner.revealed.load(b, 0)?;
        combiner.create(a, 0, 0)
    }

    /// Like [`MerkleProof::combine_raw`], but returns subtrees without
    /// pruned branches as they are instead of rebuilding them
    pub fn combine_fast_raw(a: &Cell, b: &Cell) -> Result<Cell> {
        check_same_root(a, b)?;
        let mut combiner = ProofCombiner {
            keep_complete: true,
            ..ProofCombiner::default()
        };
        combiner.revealed.load(a, 0)?;
        combiner.revealed.load(b, 0)?;
        combiner.create(a, 0, 0)
    }
}

fn check_same_root(a: &Cell, b: &Cell) -> Result<()> {
    if a.hash(0) != b.hash(0) {
        return Err(merkle_err("cannot combine Merkle proofs with different roots"));
    }
    Ok(())
}

/// Rebuilds the tree from every cell either proof reveals
#[derive(Default)]
struct ProofCombiner {
    revealed: RevealedCells,
    results: HashMap<(CellHash, u32), Cell>,
    /// Reuse any subtree that has no pruned branch below `merkle_depth`
    keep_complete: bool,
}

impl ProofCombiner {
    fn create(&mut self, cell: &Cell, merkle_depth: u32, a_merkle_depth: u32) -> Result<Cell> {
        if self.keep_complete && cell.level() <= merkle_depth {
            return Ok(cell.clone());
        }
        let merkle_depth = cell.level_mask().apply(merkle_depth).level();
        let key = (cell.hash(merkle_depth), a_merkle_depth);
        if let Some(res) = self.results.get(&key) {
            return Ok(res.clone());
        }
        let res = self.do_create(&key.0, merkle_depth, a_merkle_depth)?;
        self.results.insert(key, res.clone());
        Ok(res)
    }

    fn do_create(&mut self, hash: &CellHash, merkle_depth: u32, a_merkle_depth: u32) -> Result<Cell> {
        let info = self.revealed.get(hash)?;
        let cell = match &info.cell {
            Some(cell) => cell.clone(),
            None => return info.pruned_at(a_merkle_depth, merkle_depth),
        };
        let cs = CellSlice::load_special(&cell)?;
        if cs.size_refs() == 0 {
            return Ok(cell);
        }
        let child_depth = cs.child_merkle_depth(merkle_depth);
        let child_a_depth = cs.child_merkle_depth(a_merkle_depth);
        let mut refs = Vec::with_capacity(cs.size_refs());
        for i in 0..cs.size_refs() {
            refs.push(self.create(&child_at(&cs, i)?, child_depth, child_a_depth)?);
        }
        rebuild(&cs, refs)
    }
}

/// Records what a traversal touches and turns it into a proof
pub struct MerkleProofBuilder {
    usage_tree: Arc<CellUsageTree>,
    orig_root: Cell,
    usage_root: Cell,
}

impl MerkleProofBuilder {
    pub fn new(root: Cell) -> Self {
        let usage_tree = CellUsageTree::new();
        let usage_root = usage_tree.track(root.clone());
        MerkleProofBuilder {
            usage_tree,
            orig_root: root,
            usage_root,
        }
    }

    /// Restart with a new root and a fresh usage tree; returns the tracked root
    pub fn init(&mut self, root: Cell) -> Cell {
        *self = Self::new(root);
        self.usage_root.clone()
    }

    /// Root to traverse; loads through it are recorded
    pub fn root(&self) -> &Cell {
        &self.usage_root
    }

    pub fn original_root(&self) -> &Cell {
        &self.orig_root
    }

    pub fn usage_tree(&self) -> &Arc<CellUsageTree> {
        &self.usage_tree
    }

    pub fn extract_proof(&self) -> Result<Cell> {
        MerkleProof::generate(&self.orig_root, &self.usage_tree)
    }

    pub fn extract_proof_boc(&self) -> Result<Vec<u8>> {
        std_boc_serialize(self.extract_proof()?, Mode::NONE)
    }
}
