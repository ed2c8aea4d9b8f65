//! Incrementally committed, reference-counted cell database
//!
//! Roots are queued with [`DynamicBagOfCellsDb::inc`] and
//! [`DynamicBagOfCellsDb::dec`]. [`DynamicBagOfCellsDb::prepare_commit`]
//! walks them against the backend:
//!
//! 1. find which new cells are already stored (a stored cell implies its
//!    whole subtree is stored);
//! 2. bump the pending refcount of every new cell down to the stored ones;
//! 3. drop the pending refcount of every removed cell, descending only into
//!    cells whose resulting refcount reaches zero.
//!
//! [`DynamicBagOfCellsDb::commit`] then writes each touched cell with its new
//! refcount, or erases it once the count is zero.
//!
//! A loader must be set with [`DynamicBagOfCellsDb::set_loader`] before use
//! and again after every commit.

use super::cell_storage::{CellLoader, CellStorer, ExtCellCreator, LoadResult};
use super::hash_table::CellHashTable;
use crate::cell::{Cell, CellHash, CellSlice, DataCell, ExtCell, ExtCellLoader, LevelMask, PrunedCellInfo};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};

/// Change in stored cell count and size produced by a commit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellDbStats {
    pub cells_total_count: i64,
    /// Sum of with-hashes serialized sizes
    pub cells_total_size: i64,
}

#[derive(Default)]
struct CellInfo {
    /// The backend has been consulted for this hash
    sync_with_db: bool,
    in_db: bool,

    was_dfs_new_cells: bool,
    was: bool,

    db_refcnt: i32,
    refcnt_diff: i32,
    cell: Option<Cell>,
}

/// Loads cells for the external cells handed out by the store
///
/// Owns its own copy of the loader so those cells stay loadable after the
/// store moves on to a new snapshot.
struct CellDbReader {
    loader: CellLoader,
    this: Weak<CellDbReader>,
}

impl CellDbReader {
    fn new(loader: CellLoader) -> Arc<Self> {
        Arc::new_cyclic(|this| CellDbReader {
            loader,
            this: this.clone(),
        })
    }
}

struct ReaderCreator(Arc<CellDbReader>);

impl ExtCellCreator for ReaderCreator {
    fn ext_cell(&mut self, info: PrunedCellInfo) -> Result<Cell> {
        Ok(ExtCell::create(info, self.0.clone()))
    }
}

impl ExtCellLoader for CellDbReader {
    fn load_data_cell(&self, info: &PrunedCellInfo) -> Result<Arc<DataCell>> {
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| Error::Destroyed("cell db reader is gone".into()))?;
        let hash = info.repr_hash();
        match self.loader.load(&hash, &mut ReaderCreator(this))? {
            LoadResult::Ok { cell, .. } => cell
                .as_data()
                .cloned()
                .ok_or_else(|| Error::Corruption(format!("cell {} did not load as data", hash.to_hex()))),
            LoadResult::NotFound => Err(Error::NotFound(hash.to_hex())),
        }
    }
}

/// Reference-counted cell store over a key-value backend
///
/// Single writer: none of the methods may run concurrently.
#[derive(Default)]
pub struct DynamicBagOfCellsDb {
    loader: Option<Arc<CellLoader>>,
    reader: Option<Arc<CellDbReader>>,
    to_inc: Vec<Cell>,
    to_dec: Vec<Cell>,
    hash_table: CellHashTable<CellInfo>,
    visited: Vec<CellHash>,
    stats_diff: CellDbStats,
}

impl DynamicBagOfCellsDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point the store at a backend snapshot and start a new epoch
    pub fn set_loader(&mut self, loader: CellLoader) {
        self.reset_cell_db_reader();
        self.reader = Some(CellDbReader::new(loader.clone()));
        self.loader = Some(Arc::new(loader));
        self.stats_diff = CellDbStats::default();
    }

    /// Drop the loader, the reader and every cached record
    pub fn reset_cell_db_reader(&mut self) {
        self.reader = None;
        self.loader = None;
        self.hash_table.clear();
    }

    /// Queue `cell` to gain one reference. Proof views are ignored.
    pub fn inc(&mut self, cell: &Cell) {
        if cell.virtualization() != 0 {
            return;
        }
        self.to_inc.push(cell.clone());
    }

    /// Queue `cell` to lose one reference. Proof views are ignored.
    pub fn dec(&mut self, cell: &Cell) {
        if cell.virtualization() != 0 {
            return;
        }
        self.to_dec.push(cell.clone());
    }

    fn is_prepared_for_commit(&self) -> bool {
        self.to_inc.is_empty() && self.to_dec.is_empty()
    }

    /// Stats of the prepared diff
    pub fn get_stats_diff(&self) -> Result<CellDbStats> {
        if !self.is_prepared_for_commit() {
            return Err(Error::Backend("changes are not prepared for commit".into()));
        }
        Ok(self.stats_diff)
    }

    /// Resolve every queued root against the backend and compute refcount changes
    ///
    /// On failure the partial diff is dropped and the roots stay queued.
    pub fn prepare_commit(&mut self) -> Result<()> {
        if self.is_prepared_for_commit() {
            return Ok(());
        }
        let to_inc = self.to_inc.clone();
        let to_dec = self.to_dec.clone();
        match self.prepare_diff(&to_inc, &to_dec) {
            Ok(()) => {
                self.to_inc.clear();
                self.to_dec.clear();
                Ok(())
            }
            Err(err) => {
                self.discard_diff();
                Err(err)
            }
        }
    }

    fn prepare_diff(&mut self, to_inc: &[Cell], to_dec: &[Cell]) -> Result<()> {
        let new_roots: Vec<CellHash> = to_inc.iter().map(|c| self.get_cell_info(c)).collect();
        for hash in &new_roots {
            self.dfs_new_cells_in_db(hash)?;
        }
        for hash in &new_roots {
            self.dfs_new_cells(hash)?;
        }
        for cell in to_dec {
            let hash = self.get_cell_info(cell);
            self.dfs_old_cells(&hash)?;
        }

        self.save_diff_prepare()
    }

    fn discard_diff(&mut self) {
        for hash in std::mem::take(&mut self.visited) {
            if let Some(info) = self.hash_table.get_mut(&hash) {
                info.refcnt_diff = 0;
                info.was = false;
                info.was_dfs_new_cells = false;
            }
        }
        self.stats_diff = CellDbStats::default();
    }

    /// Write the prepared diff through `storer`
    ///
    /// The cached records are dropped afterwards, so the loader has to be
    /// set again before the next batch.
    pub fn commit(&mut self, storer: &CellStorer<'_>) -> Result<()> {
        self.prepare_commit()?;
        let touched = self.visited.len();
        self.save_diff(storer)?;
        tracing::debug!(
            target: "store::dynamic",
            touched,
            cells_delta = self.stats_diff.cells_total_count,
            size_delta = self.stats_diff.cells_total_size,
            "committed cell diff"
        );
        self.reset_cell_db_reader();
        Ok(())
    }

    /// Load a stored cell by representation hash
    pub fn load_cell(&mut self, hash: &CellHash) -> Result<Arc<DataCell>> {
        let cell = self.load_cell_info(hash).and_then(|_| self.cell_of(hash));
        match cell {
            Ok(cell) => Ok(cell.load()?.data_cell),
            Err(err) => {
                self.forget_if_idle(hash);
                Err(err)
            }
        }
    }

    /// Drop a record that holds no cell and no pending change
    fn forget_if_idle(&mut self, hash: &CellHash) {
        let idle = self
            .hash_table
            .get(hash)
            .map_or(false, |info| info.cell.is_none() && !info.was && info.refcnt_diff == 0);
        if idle {
            self.hash_table.erase(hash);
        }
    }

    /// Handle to a stored cell known only by its hashes
    pub fn ext_cell(
        &mut self,
        level_mask: LevelMask,
        hashes: Vec<CellHash>,
        depths: Vec<u16>,
    ) -> Result<Cell> {
        let info = PrunedCellInfo::new(level_mask, hashes, depths)?;
        self.get_cell_info_lazy(info)
    }

    fn info_mut(&mut self, hash: &CellHash) -> &mut CellInfo {
        self.hash_table.apply(*hash, |_| {})
    }

    fn cell_of(&mut self, hash: &CellHash) -> Result<Cell> {
        self.info_mut(hash)
            .cell
            .clone()
            .ok_or_else(|| Error::NotFound(hash.to_hex()))
    }

    fn get_cell_info(&mut self, cell: &Cell) -> CellHash {
        let hash = cell.repr_hash();
        self.hash_table.apply(hash, |info| {
            if !info.sync_with_db {
                info.cell = Some(cell.clone());
            }
        });
        hash
    }

    fn get_cell_info_lazy(&mut self, pruned: PrunedCellInfo) -> Result<Cell> {
        let hash = pruned.repr_hash();
        let reader = self.reader.clone();
        let info = self.hash_table.apply(hash, |_| {});
        if info.sync_with_db {
            return info
                .cell
                .clone()
                .ok_or_else(|| Error::NotFound(hash.to_hex()));
        }
        if info.cell.is_none() {
            let reader = match reader {
                Some(reader) => reader,
                None => {
                    tracing::error!(target: "store::dynamic", hash = %hash, "failed to create ext cell: no loader set");
                    return Err(Error::Backend("no loader set".into()));
                }
            };
            info.cell = Some(ExtCell::create(pruned, reader));
            info.in_db = true;
        }
        info.cell
            .clone()
            .ok_or_else(|| Error::NotFound(hash.to_hex()))
    }

    /// Consult the backend once for `hash`
    ///
    /// A failed read leaves the record unresolved so a later call retries.
    fn load_cell_info(&mut self, hash: &CellHash) -> Result<()> {
        if self.info_mut(hash).sync_with_db {
            return Ok(());
        }
        let loader = match &self.loader {
            Some(loader) => loader.clone(),
            None => {
                tracing::error!(target: "store::dynamic", hash = %hash, "no loader set");
                return Err(Error::Backend("no loader set".into()));
            }
        };
        let loaded = loader.load(hash, self).map_err(|err| {
            tracing::error!(target: "store::dynamic", hash = %hash, error = %err, "failed to load cell from db");
            err
        })?;
        let info = self.info_mut(hash);
        if let LoadResult::Ok { cell, refcnt } = loaded {
            info.cell = Some(cell);
            info.in_db = true;
            info.db_refcnt = refcnt;
        }
        info.sync_with_db = true;
        Ok(())
    }

    fn is_in_db(&mut self, hash: &CellHash) -> Result<bool> {
        if self.info_mut(hash).in_db {
            return Ok(true);
        }
        self.load_cell_info(hash)?;
        Ok(self.info_mut(hash).in_db)
    }

    /// Hashes of the children of `hash`, registering each one
    ///
    /// Without `force` an unloaded cell reports no children.
    fn children(&mut self, hash: &CellHash, force: bool) -> Result<Vec<CellHash>> {
        let mut cell = self.cell_of(hash)?;
        if !cell.is_loaded() {
            if !force {
                return Ok(Vec::new());
            }
            self.load_cell_info(hash)?;
            cell = self.cell_of(hash)?;
        }
        let cs = CellSlice::load_special(&cell).map_err(|err| {
            tracing::error!(target: "store::dynamic", hash = %hash, error = %err, "cannot load cell");
            Error::Corruption(format!("cell {} cannot be loaded: {}", hash.to_hex(), err))
        })?;
        let mut res = Vec::with_capacity(cs.size_refs());
        for i in 0..cs.size_refs() {
            if let Some(child) = cs.prefetch_ref(i) {
                res.push(self.get_cell_info(&child));
            }
        }
        Ok(res)
    }

    fn dfs_new_cells_in_db(&mut self, hash: &CellHash) -> Result<bool> {
        let info = self.info_mut(hash);
        if info.sync_with_db {
            return self.is_in_db(hash);
        }
        if info.in_db {
            return Ok(true);
        }

        let mut not_in_db = false;
        for child in self.children(hash, false)? {
            not_in_db |= !self.dfs_new_cells_in_db(&child)?;
        }

        if not_in_db {
            let info = self.info_mut(hash);
            assert!(!info.in_db, "cell {} has absent children but is in db", hash.to_hex());
            info.sync_with_db = true;
        }
        self.is_in_db(hash)
    }

    fn visit(&mut self, hash: &CellHash, delta: i32) {
        let info = self.info_mut(hash);
        info.refcnt_diff += delta;
        if !info.was {
            info.was = true;
            self.visited.push(*hash);
        }
    }

    fn dfs_new_cells(&mut self, hash: &CellHash) -> Result<()> {
        self.visit(hash, 1);

        let info = self.info_mut(hash);
        if info.was_dfs_new_cells {
            return Ok(());
        }
        info.was_dfs_new_cells = true;

        if self.is_in_db(hash)? {
            return Ok(());
        }
        for child in self.children(hash, true)? {
            self.dfs_new_cells(&child)?;
        }
        Ok(())
    }

    fn dfs_old_cells(&mut self, hash: &CellHash) -> Result<()> {
        self.visit(hash, -1);
        self.load_cell_info(hash)?;

        let info = self.info_mut(hash);
        let new_refcnt = info.refcnt_diff + info.db_refcnt;
        assert!(
            new_refcnt >= 0,
            "cell {} refcount drops to {}",
            hash.to_hex(),
            new_refcnt
        );
        if new_refcnt != 0 {
            return Ok(());
        }
        for child in self.children(hash, true)? {
            self.dfs_old_cells(&child)?;
        }
        Ok(())
    }

    fn save_diff_prepare(&mut self) -> Result<()> {
        self.stats_diff = CellDbStats::default();
        let visited = self.visited.clone();
        for hash in &visited {
            self.save_cell_prepare(hash)?;
        }
        Ok(())
    }

    fn save_cell_prepare(&mut self, hash: &CellHash) -> Result<()> {
        if self.info_mut(hash).refcnt_diff == 0 {
            return Ok(());
        }
        self.load_cell_info(hash)?;
        let size = self.cell_of(hash)?.load()?.data_cell.serialized_size(true) as i64;

        let info = self.info_mut(hash);
        if info.db_refcnt + info.refcnt_diff == 0 {
            assert!(info.in_db, "cell {} is erased but was never stored", hash.to_hex());
            self.stats_diff.cells_total_count -= 1;
            self.stats_diff.cells_total_size -= size;
        } else if !info.in_db {
            self.stats_diff.cells_total_count += 1;
            self.stats_diff.cells_total_size += size;
        }
        Ok(())
    }

    fn save_diff(&mut self, storer: &CellStorer<'_>) -> Result<()> {
        let visited = std::mem::take(&mut self.visited);
        for hash in &visited {
            self.save_cell(hash, storer)?;
        }
        Ok(())
    }

    fn save_cell(&mut self, hash: &CellHash, storer: &CellStorer<'_>) -> Result<()> {
        let info = self.info_mut(hash);
        info.was_dfs_new_cells = false;
        info.was = false;
        if info.refcnt_diff == 0 {
            return Ok(());
        }
        assert!(info.sync_with_db, "cell {} was never resolved", hash.to_hex());

        info.db_refcnt += info.refcnt_diff;
        info.refcnt_diff = 0;

        if info.db_refcnt == 0 {
            assert!(info.in_db, "cell {} is erased but was never stored", hash.to_hex());
            storer.erase(hash)?;
            self.hash_table.erase(hash);
        } else {
            let cell = info
                .cell
                .clone()
                .ok_or_else(|| Error::NotFound(hash.to_hex()))?;
            storer.set(info.db_refcnt, &cell.load()?.data_cell)?;
            self.info_mut(hash).in_db = true;
        }
        Ok(())
    }
}

impl ExtCellCreator for DynamicBagOfCellsDb {
    fn ext_cell(&mut self, info: PrunedCellInfo) -> Result<Cell> {
        self.get_cell_info_lazy(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellBuilder;
    use crate::store::{KeyValue, KeyValueReader, MemoryKeyValue};

    fn leaf(data: &[u8]) -> Cell {
        let mut b = CellBuilder::new();
        b.store_bytes(data).unwrap();
        b.finalize_cell(false).unwrap()
    }

    fn node(data: &[u8], refs: &[Cell]) -> Cell {
        let mut b = CellBuilder::new();
        b.store_bytes(data).unwrap();
        for r in refs {
            b.store_ref(r.clone()).unwrap();
        }
        b.finalize_cell(false).unwrap()
    }

    fn commit(db: &mut DynamicBagOfCellsDb, kv: &MemoryKeyValue) -> CellDbStats {
        db.prepare_commit().unwrap();
        let stats = db.get_stats_diff().unwrap();
        kv.begin_transaction().unwrap();
        db.commit(&CellStorer::new(kv)).unwrap();
        kv.commit_transaction().unwrap();
        db.set_loader(CellLoader::new(kv.snapshot()));
        stats
    }

    #[test]
    fn test_shared_subtree_refcounts() {
        let kv = MemoryKeyValue::new();
        let mut db = DynamicBagOfCellsDb::new();
        db.set_loader(CellLoader::new(kv.snapshot()));

        let shared = leaf(b"shared");
        let a = node(b"a", &[shared.clone()]);
        let b = node(b"b", &[shared.clone()]);

        db.inc(&a);
        let stats = commit(&mut db, &kv);
        assert_eq!(stats.cells_total_count, 2);
        assert_eq!(kv.count(&[]).unwrap(), 2);

        // `shared` is already stored, so only `b` is new
        db.inc(&b);
        let stats = commit(&mut db, &kv);
        assert_eq!(stats.cells_total_count, 1);
        assert_eq!(kv.count(&[]).unwrap(), 3);

        db.dec(&a);
        let stats = commit(&mut db, &kv);
        assert_eq!(stats.cells_total_count, -1);
        assert_eq!(kv.count(&[]).unwrap(), 2);
        assert!(kv.get(shared.repr_hash().as_bytes()).unwrap().is_some());

        db.dec(&b);
        commit(&mut db, &kv);
        assert!(kv.is_empty());
    }

    #[test]
    fn test_load_cell_after_commit() {
        let kv = MemoryKeyValue::new();
        let mut db = DynamicBagOfCellsDb::new();
        db.set_loader(CellLoader::new(kv.snapshot()));
        let root = node(b"root", &[leaf(b"x"), leaf(b"y")]);
        db.inc(&root);
        commit(&mut db, &kv);

        let loaded = db.load_cell(&root.repr_hash()).unwrap();
        assert_eq!(loaded.repr_hash(), root.repr_hash());
        let child = Cell::Data(loaded).child(1).unwrap().unwrap();
        assert!(!child.is_loaded());
        assert_eq!(child.load().unwrap().data_cell.data(), b"y");

        let missing = db.load_cell(&CellHash::digest(b"missing"));
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_ext_cell_is_lazy() {
        let kv = MemoryKeyValue::new();
        let mut db = DynamicBagOfCellsDb::new();
        db.set_loader(CellLoader::new(kv.snapshot()));
        let root = node(b"r", &[leaf(b"z")]);
        db.inc(&root);
        commit(&mut db, &kv);

        let info = PrunedCellInfo::from_cell(&root);
        let ext = db
            .ext_cell(info.level_mask, info.hashes().to_vec(), info.depths().to_vec())
            .unwrap();
        assert!(!ext.is_loaded());
        assert_eq!(ext.repr_hash(), root.repr_hash());
        assert_eq!(ext.load().unwrap().data_cell.refs_count(), 1);

        // dropping a root known only by hash still frees its subtree
        db.dec(&ext);
        commit(&mut db, &kv);
        assert!(kv.is_empty());
    }

    #[test]
    fn test_stats_need_prepare() {
        let mut db = DynamicBagOfCellsDb::new();
        db.set_loader(CellLoader::new(MemoryKeyValue::new().snapshot()));
        db.inc(&leaf(b"q"));
        assert!(db.get_stats_diff().is_err());
        db.prepare_commit().unwrap();
        let stats = db.get_stats_diff().unwrap();
        assert_eq!(stats.cells_total_count, 1);
        assert_eq!(stats.cells_total_size, 2 + 32 + 2 + 1);
    }

    struct OfflineReader;

    impl KeyValueReader for OfflineReader {
        fn get(&self, _key: &[u8]) -> Result<Option<Vec<u8>>> {
            Err(Error::Backend("offline".into()))
        }

        fn count(&self, _prefix: &[u8]) -> Result<usize> {
            Err(Error::Backend("offline".into()))
        }
    }

    #[test]
    fn test_failed_prepare_keeps_queue() {
        let kv = MemoryKeyValue::new();
        let mut db = DynamicBagOfCellsDb::new();
        let root = node(b"r", &[leaf(b"a"), leaf(b"b")]);
        db.inc(&root);
        assert!(db.prepare_commit().is_err());
        assert!(db.get_stats_diff().is_err());

        db.set_loader(CellLoader::new(kv.snapshot()));
        let stats = commit(&mut db, &kv);
        assert_eq!(stats.cells_total_count, 3);
        assert_eq!(kv.count(&[]).unwrap(), 3);
    }

    #[test]
    fn test_backend_error_is_propagated() {
        let kv = MemoryKeyValue::new();
        let mut db = DynamicBagOfCellsDb::new();
        db.set_loader(CellLoader::new(Arc::new(OfflineReader)));
        let root = node(b"r", &[leaf(b"a")]);
        db.inc(&root);
        assert!(matches!(db.prepare_commit(), Err(Error::Backend(_))));
        assert!(db.load_cell(&root.repr_hash()).is_err());

        // nothing was taken as absent: a later pass stores the tree
        db.set_loader(CellLoader::new(kv.snapshot()));
        commit(&mut db, &kv);
        assert_eq!(kv.count(&[]).unwrap(), 2);
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let kv = MemoryKeyValue::new();
        let mut db = DynamicBagOfCellsDb::new();
        db.set_loader(CellLoader::new(kv.snapshot()));
        let child = leaf(b"c");
        let root = node(b"r", &[child.clone()]);
        db.inc(&root);
        commit(&mut db, &kv);

        kv.set(child.repr_hash().as_bytes(), b"garbage").unwrap();
        db.set_loader(CellLoader::new(kv.snapshot()));
        db.dec(&root);
        assert!(db.prepare_commit().is_err());
    }

    #[test]
    fn test_missing_cell_is_not_cached() {
        let kv = MemoryKeyValue::new();
        let mut db = DynamicBagOfCellsDb::new();
        db.set_loader(CellLoader::new(kv.snapshot()));
        for i in 0..10u8 {
            let missing = db.load_cell(&CellHash::digest(&[i]));
            assert!(matches!(missing, Err(Error::NotFound(_))));
        }
        assert_eq!(db.hash_table.size(), 0);
    }

    #[test]
    fn test_missing_loader_is_an_error() {
        let mut db = DynamicBagOfCellsDb::new();
        db.inc(&leaf(b"q"));
        assert!(matches!(db.prepare_commit(), Err(Error::Backend(_))));
    }
}
