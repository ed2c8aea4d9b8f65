//! Eager bag-of-cells serializer and deserializer
//!
//! Serialization imports the DAG reachable from the roots (deduplicated by
//! representation hash), reorders it so that roots come first and every
//! child follows its parent, then writes header, root list, optional
//! index, cells and optional checksum.

use super::info::{write_int, BocInfo};
use super::serialization_info::CellSerializationInfo;
use super::Mode;
use crate::cell::{Cell, CellHash, CellSlice, DataCell, DEPTH_BYTES, HASH_BYTES, MAX_DEPTH};
use crate::config::BocConfig;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Cells whose subtree weight exceeds this bound are "special" and may
/// carry their hashes on the wire
const MAX_CELL_WHS: u32 = 64;

#[derive(Clone)]
struct CellInfo {
    dc: Arc<DataCell>,
    ref_num: usize,
    ref_idx: [usize; 4],
    wt: u8,
    hcnt: u8,
    new_idx: i64,
    should_cache: bool,
    is_root_cell: bool,
}

impl CellInfo {
    fn is_special(&self) -> bool {
        self.wt == 0
    }

    fn with_hash(&self, mode: Mode) -> bool {
        (mode.contains(Mode::WITH_INT_HASHES) && self.is_special())
            || (self.is_root_cell && mode.contains(Mode::WITH_TOP_HASH))
    }
}

struct RootInfo {
    cell: Cell,
    idx: usize,
}

/// Sizes chosen for a given mode
struct Layout {
    ref_byte_size: usize,
    offset_byte_size: usize,
    data_size: u64,
}

/// A set of roots and the cells they reach
#[derive(Default)]
pub struct BagOfCells {
    roots: Vec<RootInfo>,
    cells: HashMap<CellHash, usize>,
    cell_list: Vec<CellInfo>,
    int_refs: u64,
    data_bytes: u64,
    rv_idx: i64,
    order: Vec<usize>,
    info: BocInfo,
}

fn import_err(msg: impl std::fmt::Display) -> Error {
    Error::CellWrite(format!(
        "error while importing a cell into a bag of cells: {}",
        msg
    ))
}

impl BagOfCells {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn cells_clear(&mut self) {
        self.cells.clear();
        self.cell_list.clear();
        self.int_refs = 0;
        self.data_bytes = 0;
    }

    pub fn add_root(&mut self, root: Cell) -> Result<()> {
        if root.virtualization() != 0 {
            return Err(import_err("cannot serialize virtualized cells"));
        }
        self.roots.push(RootInfo { cell: root, idx: 0 });
        self.cells_clear();
        Ok(())
    }

    pub fn add_roots(&mut self, roots: impl IntoIterator<Item = Cell>) -> Result<()> {
        for root in roots {
            self.add_root(root)?;
        }
        Ok(())
    }

    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    pub fn root_cell(&self, i: usize) -> Option<Cell> {
        self.roots.get(i).map(|r| r.cell.clone())
    }

    pub fn roots(&self) -> Vec<Cell> {
        self.roots.iter().map(|r| r.cell.clone()).collect()
    }

    pub fn cell_count(&self) -> usize {
        self.cell_list.len()
    }

    /// Header of the last deserialized or laid-out bag
    pub fn info(&self) -> &BocInfo {
        &self.info
    }

    /// Collect and order every cell reachable from the roots
    pub fn import_cells(&mut self) -> Result<()> {
        self.cells_clear();
        for i in 0..self.roots.len() {
            let root = self.roots[i].cell.clone();
            self.roots[i].idx = self.import_cell(root, 0)?;
        }
        self.reorder_cells();
        if self.cell_list.is_empty() {
            return Err(import_err("no cells"));
        }
        Ok(())
    }

    fn import_cell(&mut self, cell: Cell, depth: u32) -> Result<usize> {
        if depth > MAX_DEPTH as u32 {
            return Err(import_err("cell depth too large"));
        }
        if let Some(&pos) = self.cells.get(&cell.repr_hash()) {
            self.cell_list[pos].should_cache = true;
            return Ok(pos);
        }
        if cell.virtualization() != 0 {
            return Err(import_err("cell has non-zero virtualization level"));
        }
        let cs = CellSlice::load_special(&cell).map_err(import_err)?;

        let mut refs = [0usize; 4];
        let mut sum_child_wt = 1u32;
        for (i, slot) in refs.iter_mut().enumerate().take(cs.refs_count()) {
            let child = cs
                .prefetch_ref(i)
                .ok_or_else(|| import_err("missing reference"))?;
            *slot = self.import_cell(child, depth + 1)?;
            sum_child_wt += self.cell_list[*slot].wt as u32;
            self.int_refs += 1;
        }

        let dc = cs.data_cell().clone();
        let pos = self.cell_list.len();
        self.cells.insert(dc.repr_hash(), pos);
        self.data_bytes += dc.serialized_size(false) as u64;
        self.cell_list.push(CellInfo {
            ref_num: dc.refs_count(),
            ref_idx: refs,
            wt: sum_child_wt.min(255) as u8,
            hcnt: dc.level_mask().hashes_count() as u8,
            new_idx: -1,
            should_cache: false,
            is_root_cell: false,
            dc,
        });
        Ok(pos)
    }

    fn reorder_cells(&mut self) {
        let n = self.cell_list.len();
        let whs = MAX_CELL_WHS as i64;
        // cap children weights so that no cell exceeds MAX_CELL_WHS
        for i in (0..n).rev() {
            let s = self.cell_list[i].ref_num as i64;
            let mut c = s;
            let mut sum = whs - 1;
            let mut mask = 0u32;
            for j in 0..s as usize {
                let child = self.cell_list[i].ref_idx[j];
                let limit = (whs - 1 + j as i64) / s;
                let wt = self.cell_list[child].wt as i64;
                if wt <= limit {
                    sum -= wt;
                    c -= 1;
                    mask |= 1 << j;
                }
            }
            if c > 0 {
                for j in 0..s as usize {
                    if mask & (1 << j) == 0 {
                        let child = self.cell_list[i].ref_idx[j];
                        let limit = sum / c;
                        sum += 1;
                        if self.cell_list[child].wt as i64 > limit {
                            self.cell_list[child].wt = limit as u8;
                        }
                    }
                }
            }
        }
        for i in 0..n {
            let mut sum = 1u32;
            for j in 0..self.cell_list[i].ref_num {
                sum += self.cell_list[self.cell_list[i].ref_idx[j]].wt as u32;
            }
            debug_assert!(sum <= MAX_CELL_WHS);
            if sum <= self.cell_list[i].wt as u32 {
                self.cell_list[i].wt = sum as u8;
            } else {
                self.cell_list[i].wt = 0;
            }
        }
        for r in 0..self.roots.len() {
            let idx = self.roots[r].idx;
            self.cell_list[idx].is_root_cell = true;
        }
        if n == 0 {
            return;
        }

        self.rv_idx = 0;
        self.order = Vec::with_capacity(n);
        for r in 0..self.roots.len() {
            let idx = self.roots[r].idx;
            self.revisit(idx, 0);
            self.revisit(idx, 1);
        }
        for r in 0..self.roots.len() {
            let idx = self.roots[r].idx;
            self.revisit(idx, 2);
        }
        for r in 0..self.roots.len() {
            self.roots[r].idx = self.cell_list[self.roots[r].idx].new_idx as usize;
        }
        debug_assert_eq!(self.order.len(), n);
        let order = std::mem::take(&mut self.order);
        self.cell_list = order.iter().map(|&i| self.cell_list[i].clone()).collect();
    }

    // force 0: previsit, descending until special cells, which get visited
    // force 1: visit, processing and allocating all children
    // force 2: allocate a new index (only after visiting)
    fn revisit(&mut self, cell_idx: usize, force: u8) -> i64 {
        let new_idx = self.cell_list[cell_idx].new_idx;
        if new_idx >= 0 {
            return new_idx;
        }
        let n = self.cell_list[cell_idx].ref_num;
        if force == 0 {
            if new_idx != -1 {
                return new_idx;
            }
            for j in (0..n).rev() {
                let child = self.cell_list[cell_idx].ref_idx[j];
                let special = self.cell_list[child].is_special();
                self.revisit(child, special as u8);
            }
            self.cell_list[cell_idx].new_idx = -2;
            return -2;
        }
        if force > 1 {
            let i = self.rv_idx;
            self.rv_idx += 1;
            self.cell_list[cell_idx].new_idx = i;
            self.order.push(cell_idx);
            return i;
        }
        if new_idx == -3 {
            return new_idx;
        }
        if self.cell_list[cell_idx].is_special() {
            self.revisit(cell_idx, 0);
        }
        for j in (0..n).rev() {
            let child = self.cell_list[cell_idx].ref_idx[j];
            self.revisit(child, 1);
        }
        for j in (0..n).rev() {
            let child = self.cell_list[cell_idx].ref_idx[j];
            let allocated = self.revisit(child, 2);
            self.cell_list[cell_idx].ref_idx[j] = allocated as usize;
        }
        self.cell_list[cell_idx].new_idx = -3;
        -3
    }

    fn compute_sizes(&self, mode: Mode) -> Option<Layout> {
        if self.roots.is_empty() || self.data_bytes == 0 {
            return None;
        }
        let cell_count = self.cell_list.len() as u128;
        let mut rs = 0usize;
        while cell_count >= 1u128 << (rs * 8) {
            rs += 1;
        }
        let hashes: u64 = self
            .cell_list
            .iter()
            .filter(|c| c.with_hash(mode))
            .map(|c| c.hcnt as u64)
            .sum::<u64>()
            * (HASH_BYTES + DEPTH_BYTES) as u64;
        let data_size = self.data_bytes + self.int_refs * rs as u64 + hashes;
        let max_offset = if mode.contains(Mode::WITH_CACHE_BITS) {
            data_size as u128 * 2
        } else {
            data_size as u128
        };
        let mut os = 0usize;
        while os <= 8 && max_offset >= 1u128 << (os * 8) {
            os += 1;
        }
        if rs > 4 || os > 8 {
            return None;
        }
        Some(Layout {
            ref_byte_size: rs,
            offset_byte_size: os,
            data_size,
        })
    }

    fn layout(&self, mode: Mode) -> Result<BocInfo> {
        if mode.contains(Mode::WITH_CACHE_BITS) && !mode.contains(Mode::WITH_INDEX) {
            return Err(Error::CellWrite("cache bits require an index".into()));
        }
        let sizes = self
            .compute_sizes(mode)
            .ok_or_else(|| Error::CellWrite("no cells to serialize to this bag of cells".into()))?;
        let cell_count = self.cell_list.len();
        let mut info = BocInfo {
            magic: BocInfo::BOC_GENERIC,
            root_count: self.roots.len(),
            cell_count,
            absent_count: 0,
            ref_byte_size: sizes.ref_byte_size,
            offset_byte_size: sizes.offset_byte_size,
            has_index: mode.contains(Mode::WITH_INDEX),
            has_crc32c: mode.contains(Mode::WITH_CRC32C),
            has_cache_bits: mode.contains(Mode::WITH_CACHE_BITS),
            has_roots: true,
            data_size: sizes.data_size,
            ..BocInfo::default()
        };
        info.roots_offset = (6 + 3 * info.ref_byte_size + info.offset_byte_size) as u64;
        info.index_offset = info.roots_offset + (info.root_count * info.ref_byte_size) as u64;
        info.data_offset = info.index_offset;
        if info.has_index {
            info.data_offset += (cell_count * info.offset_byte_size) as u64;
        }
        info.total_size = info.data_offset + info.data_size + if info.has_crc32c { 4 } else { 0 };
        Ok(info)
    }

    /// Exact size `serialize(mode)` would produce
    pub fn estimate_serialized_size(&self, mode: Mode) -> Result<usize> {
        Ok(self.layout(mode)?.total_size as usize)
    }

    /// Serialize imported cells
    pub fn serialize(&mut self, mode: Mode) -> Result<Vec<u8>> {
        let info = self.layout(mode)?;
        let n = self.cell_list.len();
        let rs = info.ref_byte_size;
        let os = info.offset_byte_size;
        let mut out = Vec::with_capacity(info.total_size as usize);

        info.write_header(&mut out);
        for root in &self.roots {
            write_int(&mut out, (n - 1 - root.idx) as u64, rs);
        }
        if info.has_index {
            let mut offs = 0u64;
            for ci in self.cell_list.iter().rev() {
                offs += (ci.dc.serialized_size(ci.with_hash(mode)) + ci.ref_num * rs) as u64;
                let entry = if info.has_cache_bits {
                    offs * 2 + ci.should_cache as u64
                } else {
                    offs
                };
                write_int(&mut out, entry, os);
            }
        }
        debug_assert_eq!(out.len() as u64, info.data_offset);
        for i in 0..n {
            let ci = &self.cell_list[n - 1 - i];
            ci.dc.serialize_into(&mut out, ci.with_hash(mode));
            for &r in &ci.ref_idx[..ci.ref_num] {
                let k = n - 1 - r;
                debug_assert!(k > i && k < n);
                write_int(&mut out, k as u64, rs);
            }
        }
        if info.has_crc32c {
            let crc = crc32c::crc32c(&out);
            out.extend_from_slice(&crc.to_le_bytes());
        }
        if out.len() as u64 != info.total_size {
            return Err(Error::CellWrite(
                "actual serialized size differs from estimated".into(),
            ));
        }
        self.info = info;
        Ok(out)
    }

    /// Decode `data`, replacing the current contents
    ///
    /// Returns the number of bytes consumed.
    pub fn deserialize(&mut self, data: &[u8], max_roots: usize) -> Result<usize> {
        self.deserialize_with(
            data,
            &BocConfig {
                max_roots,
                ..BocConfig::default()
            },
        )
    }

    pub fn deserialize_with(&mut self, data: &[u8], config: &BocConfig) -> Result<usize> {
        self.clear();
        let info = BocInfo::parse(data)?;
        if info.total_size > data.len() as u64 {
            return Err(Error::NotEnoughData {
                needed: info.total_size,
                available: data.len() as u64,
            });
        }
        let total = info.total_size as usize;
        if info.root_count > config.max_roots {
            return Err(Error::BocParse(
                "bag of cells has more root cells than expected".into(),
            ));
        }
        if info.has_crc32c && config.verify_crc32c {
            let expected = crc32c::crc32c(&data[..total - 4]);
            let mut stored = [0u8; 4];
            stored.copy_from_slice(&data[total - 4..total]);
            let found = u32::from_le_bytes(stored);
            if expected != found {
                return Err(Error::ChecksumMismatch { expected, found });
            }
        }

        let cell_count = info.cell_count;
        let rs = info.ref_byte_size;
        let mut cell_should_cache = if info.has_cache_bits {
            vec![0u8; cell_count]
        } else {
            Vec::new()
        };
        let mut root_idx = Vec::with_capacity(info.root_count);
        for i in 0..info.root_count {
            let idx = if info.has_roots {
                info.read_ref(&data[info.roots_offset as usize + i * rs..])
            } else {
                0
            };
            if idx >= cell_count {
                return Err(Error::BocParse(format!("invalid root index {}", idx)));
            }
            root_idx.push(idx);
            if info.has_cache_bits && cell_should_cache[idx] < 2 {
                cell_should_cache[idx] += 1;
            }
        }

        let cells_slice =
            &data[info.data_offset as usize..(info.data_offset + info.data_size) as usize];
        let custom_index = if info.has_index {
            Vec::new()
        } else {
            build_custom_index(cells_slice, &info)?
        };
        let index_base = info.index_offset as usize;
        let raw_entry = |i: usize| -> u64 {
            if info.has_index {
                info.read_offset(&data[index_base + i * info.offset_byte_size..])
            } else {
                custom_index[i]
            }
        };
        let entry = |i: Option<usize>| -> u64 {
            match i {
                None => 0,
                Some(i) if info.has_cache_bits => raw_entry(i) / 2,
                Some(i) => raw_entry(i),
            }
        };

        let mut cell_list: Vec<Arc<DataCell>> = Vec::with_capacity(cell_count);
        for i in 0..cell_count {
            let idx = cell_count - 1 - i;
            let offs = entry(idx.checked_sub(1));
            let end = entry(Some(idx));
            if offs > end || end > cells_slice.len() as u64 {
                return Err(Error::BocParse(format!(
                    "invalid index entry [{}; {}] for cell #{}, data size {}",
                    offs,
                    end,
                    idx,
                    cells_slice.len()
                )));
            }
            let cell_slice = &cells_slice[offs as usize..end as usize];
            let cell = deserialize_cell(
                idx,
                cell_slice,
                &info,
                &cell_list,
                if info.has_cache_bits {
                    Some(&mut cell_should_cache)
                } else {
                    None
                },
            )
            .map_err(|e| {
                Error::BocParse(format!("failed to deserialize cell #{}: {}", idx, e))
            })?;
            cell_list.push(cell);
        }

        if info.has_cache_bits {
            for (idx, &count) in cell_should_cache.iter().enumerate() {
                let stored = raw_entry(idx) % 2 == 1;
                if (count > 1) != stored {
                    return Err(Error::BocParse(format!(
                        "cell #{} has wrong cache flag {}",
                        idx, stored
                    )));
                }
            }
        }

        self.roots = root_idx
            .into_iter()
            .map(|idx| RootInfo {
                cell: Cell::Data(cell_list[cell_count - 1 - idx].clone()),
                idx: cell_count - 1 - idx,
            })
            .collect();
        self.info = info;
        Ok(total)
    }
}

/// Offsets of cell ends, found by walking cells without an index
pub(crate) fn build_custom_index(cells_slice: &[u8], info: &BocInfo) -> Result<Vec<u64>> {
    let mut index = Vec::with_capacity(info.cell_count);
    let mut cur = 0usize;
    for i in 0..info.cell_count {
        let cell_info = CellSerializationInfo::init(&cells_slice[cur..], info.ref_byte_size)
            .map_err(|e| Error::BocParse(format!("failed to deserialize cell #{}: {}", i, e)))?;
        cur += cell_info.end_offset;
        index.push(cur as u64);
    }
    if cur != cells_slice.len() {
        return Err(Error::BocParse(format!(
            "last cell #{} ends at {}, total data size is {}",
            info.cell_count - 1,
            cur,
            cells_slice.len()
        )));
    }
    Ok(index)
}

fn deserialize_cell(
    idx: usize,
    cell_slice: &[u8],
    info: &BocInfo,
    decoded: &[Arc<DataCell>],
    cell_should_cache: Option<&mut Vec<u8>>,
) -> Result<Arc<DataCell>> {
    let cell_count = info.cell_count;
    let cell_info = CellSerializationInfo::init(cell_slice, info.ref_byte_size)?;
    if cell_info.end_offset != cell_slice.len() {
        return Err(Error::BocParse("unused space in cell serialization".into()));
    }
    let ref_indices = cell_info.ref_indices(cell_slice, info.ref_byte_size);
    let mut refs = Vec::with_capacity(ref_indices.len());
    for (k, &ref_idx) in ref_indices.iter().enumerate() {
        if ref_idx <= idx {
            return Err(Error::BocParse(format!(
                "reference #{} of cell #{} is to cell #{} with smaller index",
                k, idx, ref_idx
            )));
        }
        if ref_idx >= cell_count {
            return Err(Error::BocParse(format!(
                "reference #{} of cell #{} is to non-existent cell #{}, only {} cells are defined",
                k, idx, ref_idx, cell_count
            )));
        }
        refs.push(Cell::Data(decoded[cell_count - ref_idx - 1].clone()));
    }
    if let Some(counts) = cell_should_cache {
        for &ref_idx in &ref_indices {
            if counts[ref_idx] < 2 {
                counts[ref_idx] += 1;
            }
        }
    }
    cell_info.create_data_cell(cell_slice, refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellBuilder;

    fn leaf(data: &[u8]) -> Cell {
        let mut cb = CellBuilder::new();
        cb.store_bytes(data).unwrap();
        cb.finalize_cell(false).unwrap()
    }

    fn node(data: &[u8], refs: &[Cell]) -> Cell {
        let mut cb = CellBuilder::new();
        cb.store_bytes(data).unwrap();
        for r in refs {
            cb.store_ref(r.clone()).unwrap();
        }
        cb.finalize_cell(false).unwrap()
    }

    fn bag(roots: &[Cell]) -> BagOfCells {
        let mut boc = BagOfCells::new();
        boc.add_roots(roots.iter().cloned()).unwrap();
        boc.import_cells().unwrap();
        boc
    }

    #[test]
    fn test_single_leaf_bytes() {
        let mut boc = bag(&[leaf(b"ab")]);
        let bytes = boc.serialize(Mode::NONE).unwrap();
        let expected: Vec<u8> = vec![
            0xb5, 0xee, 0x9c, 0x72, // magic
            0x01, 0x01, // ref size 1, offset size 1
            0x01, 0x01, 0x00, // cells, roots, absent
            0x04, // data size
            0x00, // root index
            0x00, 0x04, b'a', b'b',
        ];
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_dedup_and_order() {
        let shared = leaf(b"shared");
        let a = node(b"a", &[shared.clone()]);
        let b = node(b"b", &[shared.clone()]);
        let root = node(b"root", &[a, b]);
        let boc = bag(&[root]);
        assert_eq!(boc.cell_count(), 4);
        assert!(boc.estimate_serialized_size(Mode::NONE).unwrap() > 0);
    }

    #[test]
    fn test_roundtrip_all_modes() {
        let shared = leaf(b"shared");
        let a = node(b"a", &[shared.clone(), leaf(b"x")]);
        let root = node(b"root", &[a, shared.clone()]);
        for bits in 0..32 {
            let mode = Mode::from_bits_truncate(bits);
            let mut boc = bag(&[root.clone()]);
            let res = boc.serialize(mode);
            if mode.contains(Mode::WITH_CACHE_BITS) && !mode.contains(Mode::WITH_INDEX) {
                assert!(res.is_err());
                continue;
            }
            let bytes = res.unwrap();
            assert_eq!(bytes.len(), boc.estimate_serialized_size(mode).unwrap());

            let mut decoded = BagOfCells::new();
            assert_eq!(decoded.deserialize(&bytes, 1).unwrap(), bytes.len());
            let back = decoded.root_cell(0).unwrap();
            assert_eq!(back.repr_hash(), root.repr_hash());

            let mut again = bag(&[back]);
            assert_eq!(again.serialize(mode).unwrap(), bytes);
        }
    }

    #[test]
    fn test_bad_reference_rejected() {
        let root = node(b"r", &[leaf(b"c")]);
        let mut boc = bag(&[root]);
        let mut bytes = boc.serialize(Mode::NONE).unwrap();
        // root cell: d1 d2 'r' ref; point the ref at itself
        let ref_pos = 11 + 3;
        assert_eq!(bytes[ref_pos], 1);
        bytes[ref_pos] = 0;
        let err = BagOfCells::new().deserialize(&bytes, 1).unwrap_err();
        assert!(matches!(err, Error::BocParse(_)));
    }

    #[test]
    fn test_too_many_roots() {
        let mut boc = bag(&[leaf(b"1"), leaf(b"2")]);
        let bytes = boc.serialize(Mode::NONE).unwrap();
        assert!(BagOfCells::new().deserialize(&bytes, 1).is_err());
        let mut decoded = BagOfCells::new();
        decoded.deserialize(&bytes, 2).unwrap();
        assert_eq!(decoded.root_count(), 2);
    }
}
