//! On-demand bag-of-cells decoding
//!
//! Only the header is read up front. Cells are decoded when first reached;
//! cells serialized with their hashes become [`ExtCell`] stubs that decode
//! themselves on load. Without a stored index, cell offsets are found by
//! walking the blob as far as the highest index requested so far.

use super::info::BocInfo;
use super::serialization_info::CellSerializationInfo;
use super::{BlobView, StaticBagOfCellsDb};
use crate::cell::{Cell, DataCell, ExtCell, ExtCellLoader, PrunedCellInfo, RootCell};
use crate::config::LazyOptions;
use crate::{stats, Error, Result};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Largest serialized cell is well below this
const CELL_READ_LIMIT: u64 = 1024;
const HEADER_READ_LIMIT: u64 = 1000;

struct CellLocation {
    begin: u64,
    end: u64,
    should_cache: bool,
}

/// Lazily decoded bag of cells over a [`BlobView`]
///
/// The first failure is sticky: every later call returns the same error.
pub struct LazyBoc {
    data: Box<dyn BlobView>,
    options: LazyOptions,
    info: OnceCell<BocInfo>,

    index_i: AtomicUsize,
    index_offset: Mutex<u64>,
    index_data: RwLock<Vec<u64>>,
    cells: RwLock<HashMap<usize, Arc<DataCell>>>,

    has_error: AtomicBool,
    status: Mutex<Option<Error>>,
    this: Weak<LazyBoc>,
}

/// Loads one cell of a lazy bag by its wire index
struct LazyCellLoader {
    idx: usize,
    boc: Weak<LazyBoc>,
}

impl ExtCellLoader for LazyCellLoader {
    fn load_data_cell(&self, _info: &PrunedCellInfo) -> Result<Arc<DataCell>> {
        let boc = self.boc.upgrade().ok_or_else(|| {
            Error::Destroyed("lazy bag of cells is already destroyed, cannot fetch cell".into())
        })?;
        boc.load_by_idx(self.idx)
    }
}

impl LazyBoc {
    pub fn create(data: Box<dyn BlobView>, options: LazyOptions) -> Arc<Self> {
        Arc::new_cyclic(|this| LazyBoc {
            data,
            options,
            info: OnceCell::new(),
            index_i: AtomicUsize::new(0),
            index_offset: Mutex::new(0),
            index_data: RwLock::new(Vec::new()),
            cells: RwLock::new(HashMap::new()),
            has_error: AtomicBool::new(false),
            status: Mutex::new(None),
            this: this.clone(),
        })
    }

    fn check_status(&self) -> Result<()> {
        if self.has_error.load(Ordering::Relaxed) {
            if let Some(err) = self.status.lock().as_ref() {
                return Err(err.clone());
            }
        }
        Ok(())
    }

    fn check_result<T>(&self, res: Result<T>) -> Result<T> {
        if let Err(err) = &res {
            let mut status = self.status.lock();
            if status.is_none() {
                tracing::warn!(target: "boc::lazy", error = %err, "lazy bag of cells failed");
                *status = Some(err.clone());
                self.has_error.store(true, Ordering::Relaxed);
            }
        }
        res
    }

    fn header(&self) -> Result<&BocInfo> {
        self.info.get_or_try_init(|| self.load_header())
    }

    fn load_header(&self) -> Result<BocInfo> {
        let size = self.data.size();
        let header = self.data.read_at(0, size.min(HEADER_READ_LIMIT) as usize)?;
        let info = BocInfo::parse(&header)?;
        if info.total_size > size {
            return Err(Error::NotEnoughData {
                needed: info.total_size,
                available: size,
            });
        }
        if self.options.check_crc32c && info.has_crc32c {
            let data = self.data.read_at(0, info.total_size as usize)?;
            let body = data.len() - 4;
            let expected = crc32c::crc32c(&data[..body]);
            let mut stored = [0u8; 4];
            stored.copy_from_slice(&data[body..]);
            let found = u32::from_le_bytes(stored);
            if expected != found {
                return Err(Error::ChecksumMismatch { expected, found });
            }
        }
        Ok(info)
    }

    /// Header of the blob, read on first use
    pub fn info(&self) -> Result<BocInfo> {
        self.check_status()?;
        let res = self.header().cloned();
        self.check_result(res)
    }

    fn load_by_idx(&self, idx: usize) -> Result<Arc<DataCell>> {
        self.check_status()?;
        let res = self.load_data_cell(idx);
        self.check_result(res)
    }

    fn load_root_idx(&self, info: &BocInfo, root_i: usize) -> Result<usize> {
        if !info.has_roots {
            return Ok(0);
        }
        let rs = info.ref_byte_size;
        let view = self
            .data
            .read_at(info.roots_offset + (root_i * rs) as u64, rs)?;
        let idx = info.read_ref(&view);
        if idx >= info.cell_count {
            return Err(Error::BocParse(format!("invalid root index {}", idx)));
        }
        Ok(idx)
    }

    fn load_idx_offset(&self, info: &BocInfo, idx: Option<usize>) -> Result<u64> {
        let idx = match idx {
            Some(idx) => idx,
            None => return Ok(0),
        };
        if info.has_index {
            let os = info.offset_byte_size;
            let view = self.data.read_at(info.index_offset + (idx * os) as u64, os)?;
            return Ok(info.read_offset(&view));
        }
        self.index_data
            .read()
            .get(idx)
            .copied()
            .ok_or_else(|| Error::BocParse(format!("cell #{} is not indexed", idx)))
    }

    /// Extend the walked index to cover `idx`
    fn preload_index(&self, info: &BocInfo, idx: usize) -> Result<()> {
        if info.has_index || self.index_i.load(Ordering::Acquire) > idx {
            return Ok(());
        }
        let mut index_offset = self.index_offset.lock();
        while self.index_i.load(Ordering::Acquire) <= idx {
            let offset = info.data_offset + *index_offset;
            let end = info.data_offset + info.data_size;
            if offset >= end {
                return Err(Error::BocParse(format!(
                    "cell #{} starts past the end of data",
                    self.index_i.load(Ordering::Acquire)
                )));
            }
            let len = (end - offset).min(CELL_READ_LIMIT);
            let cell = self.data.read_at(offset, len as usize)?;
            let cell_info = CellSerializationInfo::init(&cell, info.ref_byte_size)?;
            *index_offset += cell_info.end_offset as u64;
            self.index_data.write().push(*index_offset);
            self.index_i.fetch_add(1, Ordering::Release);
        }
        Ok(())
    }

    fn get_cell_location(&self, info: &BocInfo, idx: usize) -> Result<CellLocation> {
        if idx >= info.cell_count {
            return Err(Error::BocParse(format!("cell #{} does not exist", idx)));
        }
        self.preload_index(info, idx)?;
        let mut begin = self.load_idx_offset(info, idx.checked_sub(1))?;
        let mut end = self.load_idx_offset(info, Some(idx))?;
        let mut should_cache = true;
        if info.has_cache_bits {
            begin /= 2;
            should_cache = end % 2 == 1 || self.options.cache_cells;
            end /= 2;
        }
        if begin > end || end > info.data_size {
            return Err(Error::BocParse(format!(
                "invalid index entry [{}; {}] for cell #{}",
                begin, end, idx
            )));
        }
        Ok(CellLocation {
            begin: begin + info.data_offset,
            end: end + info.data_offset,
            should_cache,
        })
    }

    fn cached(&self, idx: usize) -> Option<Arc<DataCell>> {
        self.cells.read().get(&idx).cloned()
    }

    fn set_data_cell(&self, idx: usize, cell: Arc<DataCell>) -> Arc<DataCell> {
        self.cells.write().entry(idx).or_insert(cell).clone()
    }

    fn read_cell(&self, info: &BocInfo, idx: usize) -> Result<(bytes::Bytes, bool)> {
        let loc = self.get_cell_location(info, idx)?;
        let slice = self.data.read_at(loc.begin, (loc.end - loc.begin) as usize)?;
        Ok((slice, loc.should_cache))
    }

    fn load_any_cell(&self, info: &BocInfo, idx: usize) -> Result<Cell> {
        if let Some(cell) = self.cached(idx) {
            return Ok(Cell::Data(cell));
        }
        let (slice, should_cache) = self.read_cell(info, idx)?;
        let cell_info = CellSerializationInfo::init(&slice, info.ref_byte_size)?;
        if cell_info.with_hashes {
            let stored = cell_info.stored_info(&slice)?;
            let loader = Arc::new(LazyCellLoader {
                idx,
                boc: self.this.clone(),
            });
            return Ok(ExtCell::create(stored, loader));
        }
        let cell = self.deserialize_data_cell(info, idx, &slice, &cell_info, should_cache)?;
        Ok(Cell::Data(cell))
    }

    fn load_data_cell(&self, idx: usize) -> Result<Arc<DataCell>> {
        let info = self.header()?;
        if let Some(cell) = self.cached(idx) {
            return Ok(cell);
        }
        let (slice, should_cache) = self.read_cell(info, idx)?;
        let cell_info = CellSerializationInfo::init(&slice, info.ref_byte_size)?;
        self.deserialize_data_cell(info, idx, &slice, &cell_info, should_cache)
    }

    fn deserialize_data_cell(
        &self,
        info: &BocInfo,
        idx: usize,
        slice: &[u8],
        cell_info: &CellSerializationInfo,
        should_cache: bool,
    ) -> Result<Arc<DataCell>> {
        if cell_info.end_offset != slice.len() {
            return Err(Error::BocParse(format!(
                "unused space in cell #{} serialization",
                idx
            )));
        }
        stats::record_lazy_decode();
        let mut refs = Vec::with_capacity(cell_info.refs_cnt);
        for ref_idx in cell_info.ref_indices(slice, info.ref_byte_size) {
            if ref_idx >= info.cell_count {
                return Err(Error::BocParse(format!(
                    "cell #{} refers to cell #{} which is too big, cell_count {}",
                    idx, ref_idx, info.cell_count
                )));
            }
            if idx >= ref_idx {
                return Err(Error::BocParse(format!(
                    "cell #{} refers to cell #{} which is a backward reference",
                    idx, ref_idx
                )));
            }
            refs.push(self.load_any_cell(info, ref_idx)?);
        }
        let cell = cell_info.create_data_cell(slice, refs)?;
        if !should_cache {
            return Ok(cell);
        }
        Ok(self.set_data_cell(idx, cell))
    }

    /// Number of cells decoded and kept so far
    pub fn cached_cells(&self) -> usize {
        self.cells.read().len()
    }
}

impl StaticBagOfCellsDb for LazyBoc {
    fn root_count(&self) -> Result<usize> {
        Ok(self.info()?.root_count)
    }

    fn root_cell(&self, i: usize) -> Result<Cell> {
        let info = self.info()?;
        if i >= info.root_count {
            return Err(Error::NotFound(format!("invalid root_cell index: {}", i)));
        }
        let res = self.load_root_idx(&info, i);
        let cell_idx = self.check_result(res)?;
        // a concrete root also validates the lower hashes of the cells below it
        let data_cell = self.load_by_idx(cell_idx)?;
        let owner = self
            .this
            .upgrade()
            .ok_or_else(|| Error::Destroyed("lazy bag of cells is being dropped".into()))?;
        Ok(RootCell::create(Cell::Data(data_cell), owner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boc::{std_boc_serialize, BufferBlobView, Mode};
    use crate::cell::CellBuilder;

    fn sample_tree() -> Cell {
        let mut shared = CellBuilder::new();
        shared.store_bytes(b"shared").unwrap();
        let shared = shared.finalize_cell(false).unwrap();
        let mut a = CellBuilder::new();
        a.store_bytes(b"a").unwrap().store_ref(shared.clone()).unwrap();
        let a = a.finalize_cell(false).unwrap();
        let mut root = CellBuilder::new();
        root.store_bytes(b"root").unwrap();
        root.store_ref(a).unwrap().store_ref(shared).unwrap();
        root.finalize_cell(false).unwrap()
    }

    fn open(bytes: Vec<u8>) -> Arc<LazyBoc> {
        LazyBoc::create(Box::new(BufferBlobView::new(bytes)), LazyOptions::default())
    }

    #[test]
    fn test_lazy_matches_eager() {
        let root = sample_tree();
        for mode in [Mode::NONE, Mode::WITH_INDEX, Mode::ALL, Mode::WITH_TOP_HASH] {
            let bytes = std_boc_serialize(root.clone(), mode).unwrap();
            let boc = open(bytes);
            assert_eq!(boc.root_count().unwrap(), 1);
            let lazy_root = boc.root_cell(0).unwrap();
            assert_eq!(lazy_root.repr_hash(), root.repr_hash());
            let child = lazy_root.child(0).unwrap().unwrap();
            assert_eq!(child.repr_hash(), root.child(0).unwrap().unwrap().repr_hash());
        }
    }

    #[test]
    fn test_errors_are_sticky() {
        let bytes = std_boc_serialize(sample_tree(), Mode::NONE).unwrap();
        let truncated = bytes[..bytes.len() - 1].to_vec();
        let boc = open(truncated);
        assert!(boc.root_count().unwrap_err().is_truncated());
        assert!(boc.root_cell(0).unwrap_err().is_truncated());
    }

    #[test]
    fn test_root_keeps_reader_alive() {
        let mut leaf = CellBuilder::new();
        leaf.store_bytes(b"leaf").unwrap();
        let mut mid = CellBuilder::new();
        mid.store_ref(leaf.finalize_cell(false).unwrap()).unwrap();
        let mut top = CellBuilder::new();
        top.store_ref(mid.finalize_cell(false).unwrap()).unwrap();
        let root = top.finalize_cell(false).unwrap();
        let bytes = std_boc_serialize(root.clone(), Mode::NONE).unwrap();

        let boc = open(bytes);
        let lazy_root = boc.root_cell(0).unwrap();
        drop(boc);
        // the root handle keeps the reader alive
        let child = lazy_root.child(0).unwrap().unwrap();
        assert_eq!(child.repr_hash(), root.child(0).unwrap().unwrap().repr_hash());
    }
}
