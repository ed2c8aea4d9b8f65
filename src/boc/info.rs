//! Bag-of-cells header
//!
//! ```text
//! magic:            u32 BE
//! flags:            has_idx:1 has_crc32c:1 has_cache_bits:1 reserved:2 ref_size:3
//! offset_size:      u8
//! cell_count:       ref_size bytes BE
//! root_count:       ref_size bytes BE
//! absent_count:     ref_size bytes BE
//! data_size:        offset_size bytes BE
//! roots:            root_count * ref_size      (generic magic only)
//! index:            cell_count * offset_size   (if has_idx)
//! cell data:        data_size bytes
//! crc32c:           u32 LE                     (if has_crc32c)
//! ```

use crate::{Error, Result};

/// Read a big-endian integer of `bytes` bytes
pub fn read_int(data: &[u8], bytes: usize) -> u64 {
    data[..bytes].iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

/// Append `value` as a big-endian integer of `bytes` bytes
pub fn write_int(out: &mut Vec<u8>, value: u64, bytes: usize) {
    for i in (0..bytes).rev() {
        out.push((value >> (i * 8)) as u8);
    }
}

/// Parsed header of a serialized bag of cells
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BocInfo {
    pub magic: u32,
    pub root_count: usize,
    pub cell_count: usize,
    pub absent_count: usize,
    pub ref_byte_size: usize,
    pub offset_byte_size: usize,
    pub has_index: bool,
    pub has_crc32c: bool,
    pub has_cache_bits: bool,
    pub has_roots: bool,
    pub roots_offset: u64,
    pub index_offset: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub total_size: u64,
}

impl BocInfo {
    /// Indexed, single root
    pub const BOC_IDX: u32 = 0x68ff65f3;
    /// Indexed with checksum, single root
    pub const BOC_IDX_CRC32C: u32 = 0xacc3a728;
    /// Explicit root list, features selected by flags
    pub const BOC_GENERIC: u32 = 0xb5ee9c72;
    /// Schema constructor tag of `serialized_boc`; never on the wire
    pub const SCHEMA_TAG: u32 = 0x672fb0ac;

    pub fn read_ref(&self, data: &[u8]) -> usize {
        read_int(data, self.ref_byte_size) as usize
    }

    pub fn read_offset(&self, data: &[u8]) -> u64 {
        read_int(data, self.offset_byte_size)
    }

    /// Parse the fixed part of the header
    ///
    /// Fails with [`Error::NotEnoughData`] while the header itself is cut
    /// short. The caller compares `total_size` with the data it has.
    pub fn parse(data: &[u8]) -> Result<BocInfo> {
        let sz = data.len() as u64;
        let need = |needed: u64| Error::NotEnoughData {
            needed,
            available: sz,
        };
        if sz < 4 {
            return Err(need(6));
        }

        let mut info = BocInfo {
            magic: read_int(data, 4) as u32,
            ..BocInfo::default()
        };
        if !matches!(
            info.magic,
            Self::BOC_GENERIC | Self::BOC_IDX | Self::BOC_IDX_CRC32C
        ) {
            return Err(Error::BocParse(format!("unknown magic {:08x}", info.magic)));
        }
        if sz < 5 {
            return Err(need(6));
        }

        let flags = data[4];
        if info.magic == Self::BOC_GENERIC {
            info.has_index = flags & 0x80 != 0;
            info.has_crc32c = flags & 0x40 != 0;
            info.has_cache_bits = flags & 0x20 != 0;
        } else {
            info.has_index = true;
            info.has_crc32c = info.magic == Self::BOC_IDX_CRC32C;
        }
        if info.has_cache_bits && !info.has_index {
            return Err(Error::BocParse("cache bits without an index".into()));
        }
        info.ref_byte_size = (flags & 7) as usize;
        if info.ref_byte_size < 1 || info.ref_byte_size > 4 {
            return Err(Error::BocParse(format!(
                "invalid ref size {}",
                info.ref_byte_size
            )));
        }
        let rs = info.ref_byte_size;
        if sz < 6 {
            return Err(need(7 + 3 * rs as u64));
        }

        info.offset_byte_size = data[5] as usize;
        if info.offset_byte_size < 1 || info.offset_byte_size > 8 {
            return Err(Error::BocParse(format!(
                "invalid offset size {}",
                info.offset_byte_size
            )));
        }
        info.roots_offset = (6 + 3 * rs + info.offset_byte_size) as u64;
        if sz < info.roots_offset {
            return Err(need(info.roots_offset));
        }

        let fields = &data[6..];
        info.cell_count = info.read_ref(fields);
        if info.cell_count == 0 {
            return Err(Error::BocParse("no cells".into()));
        }
        info.root_count = info.read_ref(&fields[rs..]);
        if info.root_count == 0 {
            return Err(Error::BocParse("no roots".into()));
        }
        info.index_offset = info.roots_offset;
        if info.magic == Self::BOC_GENERIC {
            info.index_offset += (info.root_count * rs) as u64;
            info.has_roots = true;
        } else if info.root_count != 1 {
            return Err(Error::BocParse(
                "indexed bag of cells must have exactly one root".into(),
            ));
        }
        info.data_offset = info.index_offset;
        if info.has_index {
            info.data_offset += (info.cell_count * info.offset_byte_size) as u64;
        }

        info.absent_count = info.read_ref(&fields[2 * rs..]);
        if info.absent_count > info.cell_count {
            return Err(Error::BocParse("too many absent cells".into()));
        }
        info.data_size = info.read_offset(&fields[3 * rs..]);
        let cells = info.cell_count as u64;
        if info.data_size > cells << 10 {
            return Err(Error::BocParse("too much data for the cell count".into()));
        }
        if info.data_size > 1 << 40 {
            return Err(Error::BocParse("data size exceeds 1 TiB".into()));
        }
        if info.data_size < cells * (2 + rs as u64) - rs as u64 {
            return Err(Error::BocParse("too many cells for the data size".into()));
        }
        info.total_size =
            info.data_offset + info.data_size + if info.has_crc32c { 4 } else { 0 };
        Ok(info)
    }

    /// Append the header fields (up to the root list)
    pub fn write_header(&self, out: &mut Vec<u8>) {
        write_int(out, self.magic as u64, 4);
        let mut flags = self.ref_byte_size as u8;
        if self.has_index {
            flags |= 0x80;
        }
        if self.has_crc32c {
            flags |= 0x40;
        }
        if self.has_cache_bits {
            flags |= 0x20;
        }
        out.push(flags);
        out.push(self.offset_byte_size as u8);
        write_int(out, self.cell_count as u64, self.ref_byte_size);
        write_int(out, self.root_count as u64, self.ref_byte_size);
        write_int(out, self.absent_count as u64, self.ref_byte_size);
        write_int(out, self.data_size, self.offset_byte_size);
    }
}
