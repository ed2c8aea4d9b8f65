//! Bag-of-cells codec
//!
//! A bag of cells serializes a set of roots together with every cell they
//! reach. [`BagOfCells`] decodes eagerly; [`LazyBoc`] decodes cells on
//! first access through a [`BlobView`].

mod bag;
mod blob_view;
mod info;
mod lazy;
mod serialization_info;
mod static_db;
mod storage_stat;

pub use bag::BagOfCells;
pub use blob_view::{BlobView, BufferBlobView, FileBlobView, MmapBlobView};
pub use info::BocInfo;
pub use lazy::LazyBoc;
pub use serialization_info::CellSerializationInfo;
pub use static_db::{BaselineBoc, StaticBagOfCellsDb};
pub use storage_stat::CellStorageStat;

use crate::cell::Cell;
use crate::{Error, Result};

bitflags::bitflags! {
    /// Serialization feature flags
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Mode: u32 {
        const NONE = 0;
        /// Per-cell offset index
        const WITH_INDEX = 1;
        /// Trailing CRC32C
        const WITH_CRC32C = 1 << 1;
        /// Roots carry their hashes
        const WITH_TOP_HASH = 1 << 2;
        /// Heavy internal cells carry their hashes
        const WITH_INT_HASHES = 1 << 3;
        /// Index entries flag cells referenced more than once (needs the index)
        const WITH_CACHE_BITS = 1 << 4;
        const ALL = Self::WITH_INDEX.bits()
            | Self::WITH_CRC32C.bits()
            | Self::WITH_TOP_HASH.bits()
            | Self::WITH_INT_HASHES.bits()
            | Self::WITH_CACHE_BITS.bits();
    }
}

/// Serialize a single root
pub fn std_boc_serialize(root: Cell, mode: Mode) -> Result<Vec<u8>> {
    let mut boc = BagOfCells::new();
    boc.add_root(root)?;
    boc.import_cells()?;
    boc.serialize(mode)
}

/// Serialize several roots; no roots give an empty buffer
pub fn std_boc_serialize_multi(roots: Vec<Cell>, mode: Mode) -> Result<Vec<u8>> {
    if roots.is_empty() {
        return Ok(Vec::new());
    }
    let mut boc = BagOfCells::new();
    boc.add_roots(roots)?;
    boc.import_cells()?;
    boc.serialize(mode)
}

/// Decode a bag with exactly one root of level 0
pub fn std_boc_deserialize(data: &[u8]) -> Result<Cell> {
    let mut boc = BagOfCells::new();
    boc.deserialize(data, 1)?;
    if boc.root_count() != 1 {
        return Err(Error::BocParse(
            "bag of cells is expected to have exactly one root".into(),
        ));
    }
    let root = boc
        .root_cell(0)
        .ok_or_else(|| Error::BocParse("bag of cells has no root cell".into()))?;
    if root.level() != 0 {
        return Err(Error::BocParse(
            "bag of cells has a root with non-zero level".into(),
        ));
    }
    Ok(root)
}

/// Decode up to `max_roots` roots, all of level 0; empty input gives no roots
pub fn std_boc_deserialize_multi(data: &[u8], max_roots: usize) -> Result<Vec<Cell>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let mut boc = BagOfCells::new();
    boc.deserialize(data, max_roots)?;
    let roots = boc.roots();
    if roots.iter().any(|r| r.level() != 0) {
        return Err(Error::BocParse(
            "bag of cells has a root with non-zero level".into(),
        ));
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellBuilder;

    #[test]
    fn test_mode_flags() {
        let mode = Mode::WITH_INDEX | Mode::WITH_CACHE_BITS;
        assert_eq!(mode.bits(), 17);
        assert!(mode.contains(Mode::WITH_INDEX));
        assert!(!mode.contains(Mode::WITH_CRC32C));
        assert_eq!(Mode::from_bits_truncate(0xff), Mode::ALL);
        assert_eq!(Mode::from_bits(0x40), None);
    }

    #[test]
    fn test_std_helpers() {
        let mut cb = CellBuilder::new();
        cb.store_bytes(b"hello").unwrap();
        let cell = cb.finalize_cell(false).unwrap();
        let bytes = std_boc_serialize(cell.clone(), Mode::WITH_CRC32C).unwrap();
        assert_eq!(std_boc_deserialize(&bytes).unwrap().repr_hash(), cell.repr_hash());

        let multi = std_boc_serialize_multi(vec![cell.clone(), cell.clone()], Mode::NONE).unwrap();
        assert!(std_boc_deserialize(&multi).is_err());
        assert_eq!(std_boc_deserialize_multi(&multi, 2).unwrap().len(), 2);
        assert!(std_boc_deserialize_multi(&[], 2).unwrap().is_empty());
        assert!(std_boc_serialize_multi(vec![], Mode::NONE).unwrap().is_empty());
    }

    #[test]
    fn test_level_one_root_rejected() {
        let leaf = CellBuilder::new().finalize_cell(false).unwrap();
        let mut cb = CellBuilder::new();
        cb.store_ref(leaf).unwrap();
        let parent = cb.finalize_cell(false).unwrap();
        let pruned = CellBuilder::create_pruned_branch(&parent, 1, 3).unwrap();
        let bytes = std_boc_serialize(pruned, Mode::NONE).unwrap();
        assert!(std_boc_deserialize(&bytes).is_err());
    }
}
