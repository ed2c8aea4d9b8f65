//! Hash-only cells: pruned stand-ins and lazily loaded external cells

use super::{Cell, CellHash, DataCell, LevelMask};
use crate::{stats, Error, Result};
use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::Arc;

/// Hashes and depths of every significant level of some cell
#[derive(Clone, PartialEq, Eq)]
pub struct PrunedCellInfo {
    pub level_mask: LevelMask,
    hashes: Vec<CellHash>,
    depths: Vec<u16>,
}

impl PrunedCellInfo {
    pub fn new(level_mask: LevelMask, hashes: Vec<CellHash>, depths: Vec<u16>) -> Result<Self> {
        let n = level_mask.hashes_count();
        if hashes.len() != n || depths.len() != n {
            return Err(Error::InvalidCell(format!(
                "expected {} hashes and depths, got {} and {}",
                n,
                hashes.len(),
                depths.len()
            )));
        }
        Ok(PrunedCellInfo {
            level_mask,
            hashes,
            depths,
        })
    }

    /// Capture the hashes of an existing cell
    pub fn from_cell(cell: &Cell) -> Self {
        let level_mask = cell.level_mask();
        let mut hashes = Vec::with_capacity(level_mask.hashes_count());
        let mut depths = Vec::with_capacity(level_mask.hashes_count());
        for i in 0..=level_mask.level() {
            if level_mask.is_significant(i) {
                hashes.push(cell.hash(i));
                depths.push(cell.depth(i));
            }
        }
        PrunedCellInfo {
            level_mask,
            hashes,
            depths,
        }
    }

    pub fn hash(&self, level: u32) -> CellHash {
        self.hashes[self.level_mask.apply(level).hash_index()]
    }

    pub fn depth(&self, level: u32) -> u16 {
        self.depths[self.level_mask.apply(level).hash_index()]
    }

    pub fn repr_hash(&self) -> CellHash {
        self.hashes[self.level_mask.hash_index()]
    }

    pub fn hashes(&self) -> &[CellHash] {
        &self.hashes
    }

    pub fn depths(&self) -> &[u16] {
        &self.depths
    }
}

impl fmt::Debug for PrunedCellInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrunedCellInfo")
            .field("hash", &self.repr_hash())
            .field("level_mask", &self.level_mask)
            .finish()
    }
}

/// A cell known only by its hashes; loading it always fails
pub struct PrunedCell {
    info: PrunedCellInfo,
}

impl PrunedCell {
    pub fn create(info: PrunedCellInfo) -> Cell {
        Cell::Pruned(Arc::new(PrunedCell { info }))
    }

    pub fn info(&self) -> &PrunedCellInfo {
        &self.info
    }
}

/// Source of the concrete cell behind an [`ExtCell`]
pub trait ExtCellLoader: Send + Sync {
    fn load_data_cell(&self, info: &PrunedCellInfo) -> Result<Arc<DataCell>>;
}

/// A cell known by its hashes until first load
///
/// The first successful load is kept; concurrent callers wait for it
/// and share the result. A failed load leaves the cell unloaded.
pub struct ExtCell {
    info: PrunedCellInfo,
    loader: Arc<dyn ExtCellLoader>,
    data_cell: OnceCell<Arc<DataCell>>,
}

impl ExtCell {
    pub fn create(info: PrunedCellInfo, loader: Arc<dyn ExtCellLoader>) -> Cell {
        Cell::Ext(Arc::new(ExtCell {
            info,
            loader,
            data_cell: OnceCell::new(),
        }))
    }

    pub fn info(&self) -> &PrunedCellInfo {
        &self.info
    }

    pub fn is_loaded(&self) -> bool {
        self.data_cell.get().is_some()
    }

    pub fn load_data_cell(&self) -> Result<Arc<DataCell>> {
        self.data_cell
            .get_or_try_init(|| {
                let cell = self.loader.load_data_cell(&self.info)?;
                if cell.repr_hash() != self.info.repr_hash() {
                    return Err(Error::Corruption(format!(
                        "loaded cell {} instead of {}",
                        cell.repr_hash().short(),
                        self.info.repr_hash().short()
                    )));
                }
                stats::record_ext_load();
                Ok(cell)
            })
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLoader {
        cell: Arc<DataCell>,
        calls: AtomicUsize,
    }

    impl ExtCellLoader for CountingLoader {
        fn load_data_cell(&self, _info: &PrunedCellInfo) -> Result<Arc<DataCell>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.cell.clone())
        }
    }

    struct FailingLoader;

    impl ExtCellLoader for FailingLoader {
        fn load_data_cell(&self, _info: &PrunedCellInfo) -> Result<Arc<DataCell>> {
            Err(Error::NotFound("gone".into()))
        }
    }

    fn sample() -> Arc<DataCell> {
        let mut cb = CellBuilder::new();
        cb.store_bytes(b"ext").unwrap();
        cb.finalize(false).unwrap()
    }

    #[test]
    fn test_ext_cell_loads_once() {
        let data = sample();
        let loader = Arc::new(CountingLoader {
            cell: data.clone(),
            calls: AtomicUsize::new(0),
        });
        let info = PrunedCellInfo::from_cell(&Cell::Data(data.clone()));
        let ext = ExtCell::create(info, loader.clone());
        assert!(!ext.is_loaded());
        assert_eq!(ext.repr_hash(), data.repr_hash());
        ext.load().unwrap();
        ext.load().unwrap();
        assert!(ext.is_loaded());
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_load_stays_unloaded() {
        let data = sample();
        let info = PrunedCellInfo::from_cell(&Cell::Data(data));
        let ext = ExtCell::create(info, Arc::new(FailingLoader));
        assert!(matches!(ext.load(), Err(Error::NotFound(_))));
        assert!(!ext.is_loaded());
    }

    #[test]
    fn test_pruned_cell_cannot_load() {
        let info = PrunedCellInfo::from_cell(&Cell::Data(sample()));
        let pruned = PrunedCell::create(info.clone());
        assert_eq!(pruned.repr_hash(), info.repr_hash());
        assert!(matches!(pruned.load(), Err(Error::PrunedBranch)));
    }

    #[test]
    fn test_info_length_check() {
        assert!(PrunedCellInfo::new(LevelMask::new(1), vec![CellHash::ZERO], vec![0]).is_err());
        assert!(PrunedCellInfo::new(LevelMask::new(0), vec![CellHash::ZERO], vec![0]).is_ok());
    }
}
