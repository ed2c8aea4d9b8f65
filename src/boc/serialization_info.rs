use super::info::read_int;
use crate::cell::{
    Cell, CellHash, DataCell, LevelMask, PrunedCellInfo, DEPTH_BYTES, HASH_BYTES, MAX_REFS,
};
use crate::{Error, Result};
use std::sync::Arc;

/// Layout of one serialized cell, decoded from its two descriptor bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellSerializationInfo {
    pub special: bool,
    pub level_mask: LevelMask,
    pub with_hashes: bool,
    pub hashes_offset: usize,
    pub depth_offset: usize,
    pub data_offset: usize,
    pub data_len: usize,
    pub data_with_bits: bool,
    pub refs_offset: usize,
    pub refs_cnt: usize,
    pub end_offset: usize,
}

fn parse_err(msg: impl Into<String>) -> Error {
    Error::BocParse(msg.into())
}

impl CellSerializationInfo {
    /// Decode the layout of the cell at the start of `data`
    pub fn init(data: &[u8], ref_byte_size: usize) -> Result<Self> {
        if data.len() < 2 {
            return Err(parse_err(format!(
                "not enough bytes for a cell descriptor: got {}",
                data.len()
            )));
        }
        let info = Self::from_descriptor(data[0], data[1], ref_byte_size)?;
        if data.len() < info.end_offset {
            return Err(parse_err(format!(
                "not enough bytes for a cell: got {}, expected {}",
                data.len(),
                info.end_offset
            )));
        }
        Ok(info)
    }

    pub fn from_descriptor(d1: u8, d2: u8, ref_byte_size: usize) -> Result<Self> {
        let refs_cnt = (d1 & 7) as usize;
        let level_mask = LevelMask::new(d1 >> 5);
        let special = d1 & 8 != 0;
        let with_hashes = d1 & 16 != 0;

        if refs_cnt > MAX_REFS {
            if refs_cnt != 7 || !with_hashes {
                return Err(parse_err("invalid first descriptor byte"));
            }
            return Err(parse_err("absent cells are not supported"));
        }

        let n = level_mask.hashes_count();
        let hashes_offset = 2;
        let depth_offset = hashes_offset + if with_hashes { n * HASH_BYTES } else { 0 };
        let data_offset = depth_offset + if with_hashes { n * DEPTH_BYTES } else { 0 };
        let data_len = (d2 >> 1) as usize + (d2 & 1) as usize;
        let refs_offset = data_offset + data_len;
        Ok(CellSerializationInfo {
            special,
            level_mask,
            with_hashes,
            hashes_offset,
            depth_offset,
            data_offset,
            data_len,
            data_with_bits: d2 & 1 != 0,
            refs_offset,
            refs_cnt,
            end_offset: refs_offset + refs_cnt * ref_byte_size,
        })
    }

    /// Bit length encoded by the completion tag
    pub fn get_bits(&self, cell: &[u8]) -> Result<usize> {
        if !self.data_with_bits {
            return Ok(self.data_len * 8);
        }
        let last = cell[self.data_offset + self.data_len - 1];
        if last & 0x7f == 0 {
            return Err(parse_err("overlong encoding"));
        }
        Ok((self.data_len - 1) * 8 + 7 - last.trailing_zeros() as usize)
    }

    /// Child indices as written on the wire
    pub fn ref_indices(&self, cell: &[u8], ref_byte_size: usize) -> Vec<usize> {
        (0..self.refs_cnt)
            .map(|k| read_int(&cell[self.refs_offset + k * ref_byte_size..], ref_byte_size) as usize)
            .collect()
    }

    fn stored_hash<'a>(&self, cell: &'a [u8], i: usize) -> &'a [u8] {
        let at = self.hashes_offset + i * HASH_BYTES;
        &cell[at..at + HASH_BYTES]
    }

    fn stored_depth(&self, cell: &[u8], i: usize) -> u16 {
        DataCell::load_depth(&cell[self.depth_offset + i * DEPTH_BYTES..])
    }

    /// Hashes and depths carried by a with-hashes cell
    pub fn stored_info(&self, cell: &[u8]) -> Result<PrunedCellInfo> {
        let n = self.level_mask.hashes_count();
        let mut hashes = Vec::with_capacity(n);
        let mut depths = Vec::with_capacity(n);
        for i in 0..n {
            hashes.push(
                CellHash::from_slice(self.stored_hash(cell, i))
                    .ok_or_else(|| parse_err("truncated hash"))?,
            );
            depths.push(self.stored_depth(cell, i));
        }
        PrunedCellInfo::new(self.level_mask, hashes, depths)
    }

    /// Build the cell and check it against the descriptor and stored hashes
    pub fn create_data_cell(&self, cell: &[u8], refs: Vec<Cell>) -> Result<Arc<DataCell>> {
        let bits = self.get_bits(cell)?;
        let data = &cell[self.data_offset..self.data_offset + self.data_len];
        let res = DataCell::create(data, bits, refs, self.special)?;
        if res.is_special() != self.special {
            return Err(parse_err("is_special mismatch"));
        }
        if res.level_mask() != self.level_mask {
            return Err(parse_err("level mask mismatch"));
        }
        if self.with_hashes {
            let hash_n = self.level_mask.hashes_count();
            if res.repr_hash().as_bytes()[..] != *self.stored_hash(cell, hash_n - 1) {
                return Err(parse_err("representation hash mismatch"));
            }
            if res.repr_depth() != self.stored_depth(cell, hash_n - 1) {
                return Err(parse_err("depth mismatch"));
            }

            let mut hash_i = 0;
            for level_i in 0..self.level_mask.level() {
                if !self.level_mask.is_significant(level_i) {
                    continue;
                }
                if res.hash(level_i).as_bytes()[..] != *self.stored_hash(cell, hash_i) {
                    return Err(parse_err("lower hash mismatch"));
                }
                if res.depth(level_i) != self.stored_depth(cell, hash_i) {
                    return Err(parse_err("lower depth mismatch"));
                }
                hash_i += 1;
            }
        }
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellBuilder;

    #[test]
    fn test_layout_with_hashes() {
        let info = CellSerializationInfo::from_descriptor(0b0011_0010, 5, 2).unwrap();
        assert_eq!(info.refs_cnt, 2);
        assert!(info.with_hashes);
        assert_eq!(info.level_mask, LevelMask::new(1));
        assert_eq!(info.depth_offset, 2 + 64);
        assert_eq!(info.data_offset, 2 + 68);
        assert_eq!(info.data_len, 3);
        assert_eq!(info.end_offset, 2 + 68 + 3 + 4);
    }

    #[test]
    fn test_rejects_absent_and_bad_refs() {
        assert!(CellSerializationInfo::from_descriptor(5, 0, 1).is_err());
        assert!(CellSerializationInfo::from_descriptor(7 | 16, 0, 1).is_err());
    }

    #[test]
    fn test_overlong_encoding() {
        let info = CellSerializationInfo::from_descriptor(0, 1, 1).unwrap();
        assert!(info.get_bits(&[0, 1, 0x80]).is_err());
        assert_eq!(info.get_bits(&[0, 1, 0x40]).unwrap(), 1);
    }

    #[test]
    fn test_decode_serialized_cell() {
        let mut cb = CellBuilder::new();
        cb.store_u64(0x5a, 7).unwrap();
        let cell = cb.finalize(false).unwrap();
        for with_hashes in [false, true] {
            let bytes = cell.serialize(with_hashes);
            let info = CellSerializationInfo::init(&bytes, 1).unwrap();
            assert_eq!(info.end_offset, bytes.len());
            let decoded = info.create_data_cell(&bytes, vec![]).unwrap();
            assert_eq!(decoded.repr_hash(), cell.repr_hash());
        }

        let mut bytes = cell.serialize(true);
        bytes[5] ^= 1;
        let info = CellSerializationInfo::init(&bytes, 1).unwrap();
        assert!(info.create_data_cell(&bytes, vec![]).is_err());
    }
}
