//! Shared helpers for integration tests

#![allow(dead_code)]

use boc_db::cell::{Cell, CellBuilder, CellSlice};
use boc_db::{MerkleProof, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn leaf(data: &[u8]) -> Cell {
    let mut b = CellBuilder::new();
    b.store_bytes(data).unwrap();
    b.finalize_cell(false).unwrap()
}

pub fn node(data: &[u8], refs: &[Cell]) -> Cell {
    let mut b = CellBuilder::new();
    b.store_bytes(data).unwrap();
    for r in refs {
        b.store_ref(r.clone()).unwrap();
    }
    b.finalize_cell(false).unwrap()
}

fn random_cell(rng: &mut StdRng, refs: &[Cell]) -> Cell {
    let mut b = CellBuilder::new();
    let mut bits = rng.gen_range(0..=300usize);
    while bits > 0 {
        let len = bits.min(64);
        b.store_u64(rng.gen::<u64>() >> (64 - len), len).unwrap();
        bits -= len;
    }
    for r in refs {
        b.store_ref(r.clone()).unwrap();
    }
    b.finalize_cell(false).unwrap()
}

/// Random DAG of ordinary cells; children may be shared between parents
///
/// The returned root references up to four of the other cells.
pub fn random_dag(seed: u64, cells: usize) -> Cell {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut made: Vec<Cell> = Vec::with_capacity(cells);
    for _ in 0..cells.saturating_sub(1) {
        let n = rng.gen_range(0..=made.len().min(4));
        let refs: Vec<Cell> = (0..n)
            .map(|_| made[rng.gen_range(0..made.len())].clone())
            .collect();
        made.push(random_cell(&mut rng, &refs));
    }
    let n = made.len().min(4);
    let refs: Vec<Cell> = (0..n)
        .map(|_| made[rng.gen_range(0..made.len())].clone())
        .collect();
    random_cell(&mut rng, &refs)
}

/// Random DAG that also embeds Merkle proofs of its own subtrees
///
/// Each proof prunes a random part of the subtree it covers, so the DAG
/// carries pruned branches of level 1 and 2. Proofs nest at most two deep.
/// The root is an ordinary cell of level 0.
pub fn random_proof_dag(seed: u64, cells: usize) -> Cell {
    let mut rng = StdRng::seed_from_u64(seed);
    // (cell, depth of proof nesting inside it)
    let mut made: Vec<(Cell, u32)> = Vec::with_capacity(cells);
    for _ in 0..cells.saturating_sub(1) {
        if made.len() >= 2 && rng.gen_bool(0.2) {
            let (target, nesting) = made[rng.gen_range(0..made.len())].clone();
            let has_refs = target.as_data().map_or(false, |d| d.refs_count() > 0);
            if nesting < 2 && has_refs {
                let keep = target.repr_hash();
                let proof = MerkleProof::generate_with(&target, |c| {
                    c.repr_hash() != keep && rng.gen_bool(0.5)
                })
                .unwrap();
                made.push((proof, nesting + 1));
                continue;
            }
        }
        let n = rng.gen_range(0..=made.len().min(4));
        let refs: Vec<(Cell, u32)> = (0..n)
            .map(|_| made[rng.gen_range(0..made.len())].clone())
            .collect();
        let nesting = refs.iter().map(|(_, d)| *d).max().unwrap_or(0);
        let refs: Vec<Cell> = refs.into_iter().map(|(c, _)| c).collect();
        made.push((random_cell(&mut rng, &refs), nesting));
    }
    let n = made.len().min(4);
    let refs: Vec<Cell> = (0..n)
        .map(|_| made[rng.gen_range(0..made.len())].0.clone())
        .collect();
    random_cell(&mut rng, &refs)
}

/// Seeded random walk over a cell tree
///
/// Logs hash, level and data bits of every cell it loads. Running the same
/// seed over a tree and over a proof view of it must give the same log when
/// the proof reveals the walk.
pub struct CellExplorer {
    rng: StdRng,
    budget: usize,
    special: bool,
    log: Vec<String>,
}

impl CellExplorer {
    /// Walk ordinary cells only; a special cell fails the walk
    pub fn explore(root: &Cell, seed: u64) -> Result<Vec<String>> {
        Self::run(root, seed, false)
    }

    /// Walk into special cells too, Merkle proofs and pruned branches included
    pub fn explore_special(root: &Cell, seed: u64) -> Result<Vec<String>> {
        Self::run(root, seed, true)
    }

    fn run(root: &Cell, seed: u64, special: bool) -> Result<Vec<String>> {
        let mut explorer = CellExplorer {
            rng: StdRng::seed_from_u64(seed),
            budget: 200,
            special,
            log: Vec::new(),
        };
        explorer.visit(root)?;
        Ok(explorer.log)
    }

    fn visit(&mut self, cell: &Cell) -> Result<()> {
        if self.budget == 0 {
            return Ok(());
        }
        self.budget -= 1;
        let cs = if self.special {
            CellSlice::load_special(cell)?
        } else {
            CellSlice::load(cell)?
        };
        self.log.push(format!(
            "{} {} {}",
            cell.repr_hash().to_hex(),
            cell.level(),
            cs.to_hex()
        ));
        for i in 0..cs.size_refs() {
            if self.rng.gen_bool(0.6) {
                self.visit(&cs.prefetch_ref(i).unwrap())?;
            }
        }
        Ok(())
    }
}
