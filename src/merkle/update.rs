use super::{child_at, is_pruned_branch, merkle_err, rebuild, RevealedCells};
use crate::cell::{Cell, CellBuilder, CellHash, CellSlice, CellUsageTree, NodeId, SpecialType};
use crate::merkle::MerkleProof;
use crate::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Before and after proofs of a MerkleUpdate cell
fn unpack_update(update: &Cell) -> Result<(Cell, Cell)> {
    if update.level() != 0 {
        return Err(merkle_err("level of a Merkle update must be zero"));
    }
    let cs = CellSlice::load_special(update)?;
    if cs.special_type() != SpecialType::MerkleUpdate {
        return Err(merkle_err("not a MerkleUpdate cell"));
    }
    Ok((child_at(&cs, 0)?, child_at(&cs, 1)?))
}

/// Rebuilds the new tree from the old one and the update
#[derive(Default)]
struct UpdateApplier {
    known: HashMap<CellHash, Cell>,
    ready: HashMap<(CellHash, u32), Cell>,
}

impl UpdateApplier {
    fn apply(
        &mut self,
        from: &Cell,
        update_from: &Cell,
        update_to: &Cell,
        from_level: u32,
        to_level: u32,
    ) -> Result<Cell> {
        if from.level() != from_level {
            return Err(merkle_err(format!(
                "old tree has level {}, expected {}",
                from.level(),
                from_level
            )));
        }
        self.walk_both(from, update_from, from_level)?;
        self.build(update_to, to_level)
    }

    fn walk_both(&mut self, original: &Cell, update_from: &Cell, merkle_depth: u32) -> Result<()> {
        let cs_update = CellSlice::load_special(update_from)?;
        self.known
            .entry(original.hash(merkle_depth))
            .or_insert_with(|| original.clone());
        if is_pruned_branch(&cs_update) {
            return Ok(());
        }
        let child_depth = cs_update.child_merkle_depth(merkle_depth);
        let cs_original = CellSlice::load_special(original)?;
        for i in 0..cs_original.size_refs() {
            self.walk_both(
                &child_at(&cs_original, i)?,
                &child_at(&cs_update, i)?,
                child_depth,
            )?;
        }
        Ok(())
    }

    fn build(&mut self, cell: &Cell, merkle_depth: u32) -> Result<Cell> {
        let cs = CellSlice::load_special(cell)?;
        if is_pruned_branch(&cs) {
            if cell.level() == merkle_depth + 1 {
                return self.known.get(&cell.hash(merkle_depth)).cloned().ok_or_else(|| {
                    merkle_err(format!(
                        "unknown pruned cell {}",
                        cell.hash(merkle_depth).to_hex()
                    ))
                });
            }
            return Ok(cell.clone());
        }
        let key = (cell.repr_hash(), merkle_depth);
        if let Some(res) = self.ready.get(&key) {
            return Ok(res.clone());
        }
        let child_depth = cs.child_merkle_depth(merkle_depth);
        let mut refs = Vec::with_capacity(cs.size_refs());
        for i in 0..cs.size_refs() {
            refs.push(self.build(&child_at(&cs, i)?, child_depth)?);
        }
        let res = rebuild(&cs, refs)?;
        self.ready.insert(key, res.clone());
        Ok(res)
    }
}

/// Checks that every pruned cell of the new proof appears in the old one
#[derive(Default)]
struct UpdateValidator {
    known: HashSet<CellHash>,
    visited_from: HashSet<(CellHash, u32)>,
    visited_to: HashSet<(CellHash, u32)>,
}

impl UpdateValidator {
    fn walk_from(&mut self, cell: &Cell, merkle_depth: u32) -> Result<()> {
        if !self.visited_from.insert((cell.repr_hash(), merkle_depth)) {
            return Ok(());
        }
        let cs = CellSlice::load_special(cell)?;
        self.known.insert(cell.hash(merkle_depth));
        if is_pruned_branch(&cs) {
            return Ok(());
        }
        let child_depth = cs.child_merkle_depth(merkle_depth);
        for i in 0..cs.size_refs() {
            self.walk_from(&child_at(&cs, i)?, child_depth)?;
        }
        Ok(())
    }

    fn walk_to(&mut self, cell: &Cell, merkle_depth: u32) -> Result<()> {
        if !self.visited_to.insert((cell.repr_hash(), merkle_depth)) {
            return Ok(());
        }
        let cs = CellSlice::load_special(cell)?;
        if is_pruned_branch(&cs) {
            if cell.level() == merkle_depth + 1 && !self.known.contains(&cell.hash(merkle_depth)) {
                return Err(merkle_err(format!(
                    "unknown pruned cell (validate): {}",
                    cell.hash(merkle_depth).to_hex()
                )));
            }
            return Ok(());
        }
        let child_depth = cs.child_merkle_depth(merkle_depth);
        for i in 0..cs.size_refs() {
            self.walk_to(&child_at(&cs, i)?, child_depth)?;
        }
        Ok(())
    }
}

/// Composes two consecutive updates
///
/// With AB = (A, B) and CD = (C, D) where B and C prove the same tree,
/// the result keeps from A only the paths leading to cells D prunes.
struct UpdateCombiner {
    revealed: RevealedCells,
    a_tree: Arc<CellUsageTree>,
    create_a_res: HashMap<(CellHash, u32), Cell>,
    create_d_res: HashMap<(CellHash, u32), Cell>,
}

impl UpdateCombiner {
    fn new() -> Self {
        UpdateCombiner {
            revealed: RevealedCells::default(),
            a_tree: CellUsageTree::new(),
            create_a_res: HashMap::new(),
            create_d_res: HashMap::new(),
        }
    }

    fn run(mut self, ab: &Cell, cd: &Cell) -> Result<Cell> {
        let (a, b) = unpack_update(ab)?;
        let (c, d) = unpack_update(cd)?;
        if b.hash(0) != c.hash(0) {
            return Err(merkle_err("impossible to combine Merkle updates"));
        }

        // cache every cell reachable in the virtualized views of all four proofs
        for proof in [&a, &b, &c, &d] {
            self.revealed.clear_visited();
            self.revealed.load(proof, 0)?;
        }

        let root_id = self.a_tree.root_id();
        self.mark_a(&a, 0, root_id)?;
        let new_d = self.create_d(&d, 0, 0).map_err(|e| {
            merkle_err(format!(
                "failed to combine updates, one of them is probably invalid: {}",
                e
            ))
        })?;
        let new_a = self.create_a(&a, 0, 0)?;
        CellBuilder::create_merkle_update(new_a, new_d)
    }

    fn mark_a(&mut self, cell: &Cell, merkle_depth: u32, node: NodeId) -> Result<()> {
        // a cached cell may be virtualized at another level
        let merkle_depth = cell.level_mask().apply(merkle_depth).level();
        let info = self.revealed.entry(cell.hash(merkle_depth));
        if info.node != 0 {
            return Ok(());
        }
        info.node = node;
        let cached = match &info.cell {
            Some(cached) => cached.clone(),
            None => return Ok(()),
        };
        let cs = CellSlice::load_special(&cached)?;
        let child_depth = cs.child_merkle_depth(merkle_depth);
        for i in 0..cs.size_refs() {
            let child_node = self.a_tree.create_child(node, i);
            self.mark_a(&child_at(&cs, i)?, child_depth, child_node)?;
        }
        Ok(())
    }

    fn create_d(&mut self, cell: &Cell, merkle_depth: u32, d_merkle_depth: u32) -> Result<Cell> {
        let merkle_depth = cell.level_mask().apply(merkle_depth).level();
        let key = (cell.hash(merkle_depth), d_merkle_depth);
        if let Some(res) = self.create_d_res.get(&key) {
            return Ok(res.clone());
        }
        let res = self.do_create_d(key.0, merkle_depth, d_merkle_depth)?;
        self.create_d_res.insert(key, res.clone());
        Ok(res)
    }

    fn do_create_d(&mut self, hash: CellHash, merkle_depth: u32, d_merkle_depth: u32) -> Result<Cell> {
        let info = self.revealed.entry(hash);
        if info.node != 0 {
            self.a_tree.mark_path(info.node);
            return info.pruned_at(d_merkle_depth, merkle_depth);
        }
        let cached = info
            .cell
            .clone()
            .ok_or_else(|| merkle_err(format!("cell {} is not revealed", hash.to_hex())))?;
        let cs = CellSlice::load_special(&cached)?;
        if cs.size_refs() == 0 {
            return Ok(cached);
        }
        let child_depth = cs.child_merkle_depth(merkle_depth);
        let child_d_depth = cs.child_merkle_depth(d_merkle_depth);
        let mut refs = Vec::with_capacity(cs.size_refs());
        for i in 0..cs.size_refs() {
            refs.push(self.create_d(&child_at(&cs, i)?, child_depth, child_d_depth)?);
        }
        rebuild(&cs, refs)
    }

    fn create_a(&mut self, cell: &Cell, merkle_depth: u32, a_merkle_depth: u32) -> Result<Cell> {
        let merkle_depth = cell.level_mask().apply(merkle_depth).level();
        let key = (cell.hash(merkle_depth), a_merkle_depth);
        if let Some(res) = self.create_a_res.get(&key) {
            return Ok(res.clone());
        }
        let res = self.do_create_a(key.0, merkle_depth, a_merkle_depth)?;
        self.create_a_res.insert(key, res.clone());
        Ok(res)
    }

    fn do_create_a(&mut self, hash: CellHash, merkle_depth: u32, a_merkle_depth: u32) -> Result<Cell> {
        let info = self.revealed.get(&hash)?;
        if info.node == 0 {
            return Err(merkle_err("cell of the old proof was never marked"));
        }
        if !self.a_tree.has_mark(info.node) {
            return info.pruned_at(a_merkle_depth, merkle_depth);
        }
        let cached = info
            .cell
            .clone()
            .ok_or_else(|| merkle_err(format!("cell {} is not revealed", hash.to_hex())))?;
        let cs = CellSlice::load_special(&cached)?;
        if cs.size_refs() == 0 {
            return Ok(cached);
        }
        let child_depth = cs.child_merkle_depth(merkle_depth);
        let child_a_depth = cs.child_merkle_depth(a_merkle_depth);
        let mut refs = Vec::with_capacity(cs.size_refs());
        for i in 0..cs.size_refs() {
            refs.push(self.create_a(&child_at(&cs, i)?, child_depth, child_a_depth)?);
        }
        rebuild(&cs, refs)
    }
}

/// Merkle update generation, checking, application and composition
pub struct MerkleUpdate;

impl MerkleUpdate {
    /// Update turning `from` into `to`
    ///
    /// `to` must have been derived from `usage_tree.track(from)`: the subtrees
    /// it shares with `from` are recognized by their usage nodes.
    pub fn generate(from: &Cell, to: &Cell, usage_tree: &Arc<CellUsageTree>) -> Result<Cell> {
        if from.level() != 0 || to.level() != 0 {
            return Err(merkle_err("Merkle update roots must have level zero"));
        }
        let (update_from, update_to) = Self::generate_raw(from, to, usage_tree)?;
        CellBuilder::create_merkle_update(update_from, update_to)
    }

    pub fn generate_raw(
        from: &Cell,
        to: &Cell,
        usage_tree: &Arc<CellUsageTree>,
    ) -> Result<(Cell, Cell)> {
        let update_to = MerkleProof::generate_raw_checked(to, |cell| {
            let loaded = cell.load()?;
            if loaded.data_cell.refs_count() == 0 {
                return Ok(false);
            }
            Ok(match &loaded.tree_node {
                Some(node) => node.mark_path(usage_tree),
                None => false,
            })
        })?;
        usage_tree.set_use_mark_for_is_loaded(true);
        let update_from = MerkleProof::generate_raw(from, usage_tree)?;
        Ok((update_from, update_to))
    }

    /// Cheap check that `update` starts from `from`
    pub fn may_apply(from: &Cell, update: &Cell) -> Result<()> {
        if from.level() != 0 {
            return Err(merkle_err("level of the old tree is not zero"));
        }
        let (update_from, _) = unpack_update(update)?;
        if from.hash(0) != update_from.hash(0) {
            return Err(merkle_err("hash mismatch"));
        }
        Ok(())
    }

    /// New tree after applying `update` to `from`
    pub fn apply(from: &Cell, update: &Cell) -> Result<Cell> {
        if from.level() != 0 {
            return Err(merkle_err("level of the old tree is not zero"));
        }
        let (update_from, update_to) = unpack_update(update)?;
        Self::apply_raw(from, &update_from, &update_to, 0, 0)
    }

    pub fn apply_raw(
        from: &Cell,
        update_from: &Cell,
        update_to: &Cell,
        from_level: u32,
        to_level: u32,
    ) -> Result<Cell> {
        if from.hash(from_level) != update_from.hash(from_level) {
            tracing::debug!(
                expected = %update_from.hash(from_level).to_hex(),
                found = %from.hash(from_level).to_hex(),
                "invalid Merkle update: old value hash mismatch"
            );
            return Err(merkle_err("invalid Merkle update: old value hash mismatch"));
        }
        UpdateApplier::default().apply(from, update_from, update_to, from_level, to_level)
    }

    /// Check the update is self-consistent without the old tree
    pub fn validate(update: &Cell) -> Result<()> {
        let (update_from, update_to) = unpack_update(update)?;
        Self::validate_raw(&update_from, &update_to, 0, 0)
    }

    pub fn validate_raw(
        update_from: &Cell,
        update_to: &Cell,
        from_level: u32,
        to_level: u32,
    ) -> Result<()> {
        let mut validator = UpdateValidator::default();
        validator.walk_from(update_from, from_level)?;
        validator.walk_to(update_to, to_level)
    }

    /// Update A -> C from updates A -> B and B -> C
    pub fn combine(ab: &Cell, bc: &Cell) -> Result<Cell> {
        UpdateCombiner::new().run(ab, bc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(data: &[u8], refs: &[Cell]) -> Cell {
        let mut cb = CellBuilder::new();
        cb.store_bytes(data).unwrap();
        for r in refs {
            cb.store_ref(r.clone()).unwrap();
        }
        cb.finalize_cell(false).unwrap()
    }

    fn fresh(data: &[u8]) -> Cell {
        let mut leaf = data.to_vec();
        leaf.push(b'!');
        node(data, &[node(&leaf, &[])])
    }

    /// Replace the second child of `from`, keeping the first one shared
    fn replace_second(from: &Cell, data: &[u8]) -> (Cell, Cell) {
        let tree = CellUsageTree::new();
        let tracked = tree.track(from.clone());
        let cs = CellSlice::load(&tracked).unwrap();
        let kept = cs.prefetch_ref(0).unwrap();
        let to = node(b"root", &[kept, fresh(data)]);
        let update = MerkleUpdate::generate(from, &to, &tree).unwrap();
        (to, update)
    }

    fn sample() -> Cell {
        let a = node(b"a", &[node(b"x", &[])]);
        let b = node(b"b", &[node(b"y", &[])]);
        node(b"root", &[a, b])
    }

    #[test]
    fn test_apply_rebuilds_new_tree() {
        let from = sample();
        let (to, update) = replace_second(&from, b"b2");
        assert_eq!(update.level(), 0);
        MerkleUpdate::validate(&update).unwrap();
        MerkleUpdate::may_apply(&from, &update).unwrap();
        let applied = MerkleUpdate::apply(&from, &update).unwrap();
        assert_eq!(applied.repr_hash(), to.repr_hash());
    }

    #[test]
    fn test_apply_to_other_tree_fails() {
        let from = sample();
        let (_, update) = replace_second(&from, b"b2");
        let other = node(b"other", &[]);
        assert!(MerkleUpdate::may_apply(&other, &update).is_err());
        assert!(MerkleUpdate::apply(&other, &update).is_err());
    }

    #[test]
    fn test_combine_consecutive_updates() {
        let from = sample();
        let (tracked_mid, ab) = replace_second(&from, b"b2");
        let mid = node(b"root", &[from.child(0).unwrap().unwrap(), fresh(b"b2")]);
        assert_eq!(mid.repr_hash(), tracked_mid.repr_hash());
        let (to, bc) = replace_second(&mid, b"b3");

        let ac = MerkleUpdate::combine(&ab, &bc).unwrap();
        MerkleUpdate::validate(&ac).unwrap();
        let applied = MerkleUpdate::apply(&from, &ac).unwrap();
        assert_eq!(applied.repr_hash(), to.repr_hash());

        assert!(MerkleUpdate::combine(&bc, &ab).is_err());
    }
}
