//! Encoding of stored cells
//!
//! A stored value is a bincode [`StoredCell`]: the reference count, the
//! cell's with-hashes serialization, and the level mask, hashes and depths
//! of every child. Children come back as lazily loaded external cells.

use super::{KeyValue, KeyValueReader};
use crate::boc::CellSerializationInfo;
use crate::cell::{Cell, CellHash, DataCell, LevelMask, PrunedCellInfo};
use crate::{stats, Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Serialize, Deserialize)]
struct StoredRef {
    level_mask: u8,
    hashes: Vec<CellHash>,
    depths: Vec<u16>,
}

#[derive(Serialize, Deserialize)]
struct StoredCell {
    refcnt: i32,
    cell: Vec<u8>,
    refs: Vec<StoredRef>,
}

/// Builds placeholders for the children of a loaded cell
pub trait ExtCellCreator {
    fn ext_cell(&mut self, info: PrunedCellInfo) -> Result<Cell>;
}

pub enum LoadResult {
    NotFound,
    Ok { cell: Cell, refcnt: i32 },
}

/// Reads cells from a backend snapshot
#[derive(Clone)]
pub struct CellLoader {
    reader: Arc<dyn KeyValueReader>,
}

impl CellLoader {
    pub fn new(reader: Arc<dyn KeyValueReader>) -> Self {
        CellLoader { reader }
    }

    pub fn load(&self, hash: &CellHash, creator: &mut dyn ExtCellCreator) -> Result<LoadResult> {
        let value = match self.reader.get(hash.as_bytes())? {
            Some(value) => value,
            None => return Ok(LoadResult::NotFound),
        };
        stats::record_store_load();
        let stored: StoredCell = bincode::deserialize(&value)?;

        let mut refs = Vec::with_capacity(stored.refs.len());
        for r in stored.refs {
            let info = PrunedCellInfo::new(LevelMask::new(r.level_mask), r.hashes, r.depths)?;
            refs.push(creator.ext_cell(info)?);
        }
        let info = CellSerializationInfo::init(&stored.cell, 0)?;
        if info.end_offset != stored.cell.len() || info.refs_cnt != refs.len() {
            return Err(Error::Corruption(format!(
                "stored cell {} has an inconsistent layout",
                hash.to_hex()
            )));
        }
        let cell = info.create_data_cell(&stored.cell, refs)?;
        if cell.repr_hash() != *hash {
            return Err(Error::Corruption(format!(
                "stored cell {} hashes to {}",
                hash.to_hex(),
                cell.repr_hash().to_hex()
            )));
        }
        Ok(LoadResult::Ok {
            cell: Cell::Data(cell),
            refcnt: stored.refcnt,
        })
    }
}

/// Writes cells into a backend
pub struct CellStorer<'a> {
    kv: &'a dyn KeyValue,
}

impl<'a> CellStorer<'a> {
    pub fn new(kv: &'a dyn KeyValue) -> Self {
        CellStorer { kv }
    }

    pub fn erase(&self, hash: &CellHash) -> Result<()> {
        self.kv.erase(hash.as_bytes())
    }

    pub fn set(&self, refcnt: i32, cell: &DataCell) -> Result<()> {
        self.kv
            .set(cell.repr_hash().as_bytes(), &Self::serialize_value(refcnt, cell)?)
    }

    pub fn serialize_value(refcnt: i32, cell: &DataCell) -> Result<Vec<u8>> {
        let refs = cell
            .refs()
            .iter()
            .map(|child| {
                let info = PrunedCellInfo::from_cell(child);
                StoredRef {
                    level_mask: info.level_mask.mask(),
                    hashes: info.hashes().to_vec(),
                    depths: info.depths().to_vec(),
                }
            })
            .collect();
        let stored = StoredCell {
            refcnt,
            cell: cell.serialize(true),
            refs,
        };
        Ok(bincode::serialize(&stored)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{CellBuilder, PrunedCell};
    use crate::store::MemoryKeyValue;

    struct Pruned;

    impl ExtCellCreator for Pruned {
        fn ext_cell(&mut self, info: PrunedCellInfo) -> Result<Cell> {
            Ok(PrunedCell::create(info))
        }
    }

    #[test]
    fn test_store_and_load() {
        let mut leaf = CellBuilder::new();
        leaf.store_bytes(b"leaf").unwrap();
        let leaf = leaf.finalize_cell(false).unwrap();
        let mut root = CellBuilder::new();
        root.store_u64(5, 3).unwrap().store_ref(leaf.clone()).unwrap();
        let root = root.finalize(false).unwrap();

        let kv = MemoryKeyValue::new();
        CellStorer::new(&kv).set(3, &root).unwrap();
        let loader = CellLoader::new(kv.snapshot());
        match loader.load(&root.repr_hash(), &mut Pruned).unwrap() {
            LoadResult::Ok { cell, refcnt } => {
                assert_eq!(refcnt, 3);
                assert_eq!(cell.repr_hash(), root.repr_hash());
                let child = cell.child(0).unwrap().unwrap();
                assert_eq!(child.repr_hash(), leaf.repr_hash());
                assert!(!child.is_loaded());
            }
            LoadResult::NotFound => panic!("cell not found"),
        }
        assert!(matches!(
            loader.load(&leaf.repr_hash(), &mut Pruned).unwrap(),
            LoadResult::NotFound
        ));

        CellStorer::new(&kv).erase(&root.repr_hash()).unwrap();
        assert!(kv.is_empty());
    }
}
