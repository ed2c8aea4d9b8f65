//! Concrete cells: data, children, and precomputed hashes

use super::bits;
use super::{
    Cell, CellHash, LevelMask, SpecialType, DEPTH_BYTES, HASH_BYTES, MAX_BITS, MAX_DEPTH,
    MAX_LEVEL, MAX_REFS,
};
use crate::{stats, Error, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// A fully materialized cell
///
/// Hashes and depths are computed once in [`DataCell::create`]. A pruned
/// branch stores only its top hash; lower ones are read from its data.
pub struct DataCell {
    data: Box<[u8]>,
    bits: u16,
    refs: Vec<Cell>,
    special: bool,
    level_mask: LevelMask,
    virtualization: u8,
    hashes: Vec<CellHash>,
    depths: Vec<u16>,
}

fn invalid(msg: &str) -> Error {
    Error::InvalidCell(msg.to_string())
}

impl DataCell {
    /// Validate and build a cell from `bits` bits of `data` and its children
    pub fn create(data: &[u8], bits: usize, refs: Vec<Cell>, special: bool) -> Result<Arc<DataCell>> {
        if bits > MAX_BITS {
            return Err(invalid("Too many bits"));
        }
        if refs.len() > MAX_REFS {
            return Err(invalid("Too many references"));
        }
        let len = (bits + 7) / 8;
        if data.len() < len {
            return Err(invalid("Not enough bytes for the declared bit length"));
        }

        let mut stored = data[..len].to_vec().into_boxed_slice();
        // completion tag: a single 1 bit after the data, then zeros
        if bits % 8 != 0 {
            let m = 0x80u8 >> (bits % 8);
            let l = bits / 8;
            stored[l] = (stored[l] & !(m - 1)) | m;
        }

        let mut cell_type = SpecialType::Ordinary;
        if special {
            if bits < 8 {
                return Err(invalid("Not enough data for a special cell"));
            }
            cell_type = match SpecialType::from_byte(stored[0]) {
                Some(SpecialType::Ordinary) => {
                    return Err(invalid("Special cell has Ordinary type"))
                }
                Some(t) => t,
                None => return Err(invalid("Unknown special cell type")),
            };
        }

        let mut level_mask = LevelMask::default();
        let mut virtualization = 0u8;
        match cell_type {
            SpecialType::Ordinary => {
                for r in &refs {
                    level_mask = level_mask.apply_or(r.level_mask());
                    virtualization = virtualization.max(r.virtualization() as u8);
                }
            }
            SpecialType::PrunedBranch => {
                if !refs.is_empty() {
                    return Err(invalid("PrunedBranch special cell has a cell reference"));
                }
                if bits < 16 {
                    return Err(invalid("Not enough data for a PrunedBranch special cell"));
                }
                level_mask = LevelMask::new(stored[1]);
                let level = level_mask.level();
                if level == 0 || level > MAX_LEVEL || stored[1] > 7 {
                    return Err(invalid("Pruned branch has an invalid level"));
                }
                let n = level_mask.apply(level - 1).hashes_count();
                if bits != (2 + n * (HASH_BYTES + DEPTH_BYTES)) * 8 {
                    return Err(invalid("Wrong data length for a PrunedBranch special cell"));
                }
            }
            SpecialType::Library => {
                if bits != 8 + HASH_BYTES * 8 {
                    return Err(invalid("Wrong data length for a Library special cell"));
                }
            }
            SpecialType::MerkleProof => {
                if bits != 8 + (HASH_BYTES + DEPTH_BYTES) * 8 {
                    return Err(invalid("Wrong data length for a MerkleProof special cell"));
                }
                if refs.len() != 1 {
                    return Err(invalid("Wrong references count for a MerkleProof special cell"));
                }
                if stored[1..1 + HASH_BYTES] != refs[0].hash(0).as_bytes()[..] {
                    return Err(invalid("Hash mismatch in a MerkleProof special cell"));
                }
                if Self::load_depth(&stored[1 + HASH_BYTES..]) != refs[0].depth(0) {
                    return Err(invalid("Depth mismatch in a MerkleProof special cell"));
                }
                level_mask = refs[0].level_mask().shift_right();
                virtualization = refs[0].virtualization() as u8;
            }
            SpecialType::MerkleUpdate => {
                if bits != 8 + (HASH_BYTES + DEPTH_BYTES) * 8 * 2 {
                    return Err(invalid("Wrong data length for a MerkleUpdate special cell"));
                }
                if refs.len() != 2 {
                    return Err(invalid("Wrong references count for a MerkleUpdate special cell"));
                }
                let depths_at = 1 + 2 * HASH_BYTES;
                if stored[1..1 + HASH_BYTES] != refs[0].hash(0).as_bytes()[..] {
                    return Err(invalid("First hash mismatch in a MerkleUpdate special cell"));
                }
                if stored[1 + HASH_BYTES..depths_at] != refs[1].hash(0).as_bytes()[..] {
                    return Err(invalid("Second hash mismatch in a MerkleUpdate special cell"));
                }
                if Self::load_depth(&stored[depths_at..]) != refs[0].depth(0) {
                    return Err(invalid("First depth mismatch in a MerkleUpdate special cell"));
                }
                if Self::load_depth(&stored[depths_at + DEPTH_BYTES..]) != refs[1].depth(0) {
                    return Err(invalid("Second depth mismatch in a MerkleUpdate special cell"));
                }
                level_mask = refs[0].level_mask().apply_or(refs[1].level_mask()).shift_right();
                virtualization = (refs[0].virtualization().max(refs[1].virtualization())) as u8;
            }
        }

        let hash_count = if cell_type == SpecialType::PrunedBranch {
            1
        } else {
            level_mask.hashes_count()
        };
        let mut cell = DataCell {
            data: stored,
            bits: bits as u16,
            refs,
            special,
            level_mask,
            virtualization,
            hashes: Vec::with_capacity(hash_count),
            depths: Vec::with_capacity(hash_count),
        };
        cell.compute_hashes(cell_type, hash_count)?;
        stats::record_data_cell();
        Ok(Arc::new(cell))
    }

    fn compute_hashes(&mut self, cell_type: SpecialType, hash_count: usize) -> Result<()> {
        let total = self.level_mask.hashes_count();
        let offset = total - hash_count;
        let merkle = cell_type.is_merkle();
        let mut hash_i = 0;

        for level_i in 0..=self.level_mask.level() {
            if !self.level_mask.is_significant(level_i) {
                continue;
            }
            let cur = hash_i;
            hash_i += 1;
            if cur < offset {
                continue;
            }

            let mut hasher = Sha256::new();
            hasher.update([self.d1_at(self.level_mask.apply(level_i)), self.d2()]);
            if cur == offset {
                hasher.update(&self.data);
            } else {
                hasher.update(self.hashes[cur - offset - 1].as_bytes());
            }

            let child_level = if merkle { level_i + 1 } else { level_i };
            let mut depth = 0u16;
            for r in &self.refs {
                let child_depth = r.depth(child_level);
                hasher.update(child_depth.to_be_bytes());
                depth = depth.max(child_depth);
            }
            if !self.refs.is_empty() {
                if depth >= MAX_DEPTH {
                    return Err(invalid("Depth is too big"));
                }
                depth += 1;
            }
            for r in &self.refs {
                hasher.update(r.hash(child_level).as_bytes());
            }

            self.hashes.push(CellHash::from_bytes(hasher.finalize().into()));
            self.depths.push(depth);
        }
        Ok(())
    }

    pub fn load_depth(bytes: &[u8]) -> u16 {
        u16::from_be_bytes([bytes[0], bytes[1]])
    }

    /// Data bytes, including the completion tag when the bit length is partial
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn bit_len(&self) -> usize {
        self.bits as usize
    }

    pub fn refs(&self) -> &[Cell] {
        &self.refs
    }

    pub fn refs_count(&self) -> usize {
        self.refs.len()
    }

    pub fn is_special(&self) -> bool {
        self.special
    }

    pub fn special_type(&self) -> SpecialType {
        if !self.special {
            return SpecialType::Ordinary;
        }
        SpecialType::from_byte(self.data[0]).unwrap_or(SpecialType::Ordinary)
    }

    pub fn level_mask(&self) -> LevelMask {
        self.level_mask
    }

    pub fn level(&self) -> u32 {
        self.level_mask.level()
    }

    pub fn virtualization(&self) -> u32 {
        self.virtualization as u32
    }

    /// Index into the stored hashes, or the inline table of a pruned branch
    fn pruned_index(&self, level: u32) -> (usize, Option<usize>) {
        let hash_i = self.level_mask.apply(level).hash_index();
        if self.special_type() == SpecialType::PrunedBranch {
            let this_hash_i = self.level_mask.hash_index();
            if hash_i != this_hash_i {
                return (this_hash_i, Some(hash_i));
            }
            return (0, None);
        }
        (hash_i, None)
    }

    pub fn hash(&self, level: u32) -> CellHash {
        match self.pruned_index(level) {
            (_, Some(i)) => {
                let at = 2 + i * HASH_BYTES;
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&self.data[at..at + HASH_BYTES]);
                CellHash::from_bytes(arr)
            }
            (i, None) => self.hashes[i],
        }
    }

    pub fn depth(&self, level: u32) -> u16 {
        match self.pruned_index(level) {
            (stored, Some(i)) => {
                Self::load_depth(&self.data[2 + HASH_BYTES * stored + DEPTH_BYTES * i..])
            }
            (i, None) => self.depths[i],
        }
    }

    pub fn repr_hash(&self) -> CellHash {
        self.hash(MAX_LEVEL)
    }

    pub fn repr_depth(&self) -> u16 {
        self.depth(MAX_LEVEL)
    }

    fn d1_at(&self, level_mask: LevelMask) -> u8 {
        self.refs.len() as u8 + 8 * self.special as u8 + 32 * level_mask.mask()
    }

    /// First descriptor byte
    pub fn d1(&self) -> u8 {
        self.d1_at(self.level_mask)
    }

    /// Second descriptor byte, encoding the bit length
    pub fn d2(&self) -> u8 {
        let bits = self.bits as usize;
        ((bits >> 3) + ((bits + 7) >> 3)) as u8
    }

    pub fn serialized_size(&self, with_hashes: bool) -> usize {
        let hashes = if with_hashes {
            self.level_mask.hashes_count() * (HASH_BYTES + DEPTH_BYTES)
        } else {
            0
        };
        2 + hashes + self.data.len()
    }

    /// Descriptor, optional hash/depth table and data (without references)
    pub fn serialize_into(&self, out: &mut Vec<u8>, with_hashes: bool) {
        out.push(self.d1() | if with_hashes { 16 } else { 0 });
        out.push(self.d2());
        if with_hashes {
            let level = self.level();
            for i in 0..=level {
                if self.level_mask.is_significant(i) {
                    out.extend_from_slice(self.hash(i).as_bytes());
                }
            }
            for i in 0..=level {
                if self.level_mask.is_significant(i) {
                    out.extend_from_slice(&self.depth(i).to_be_bytes());
                }
            }
        }
        out.extend_from_slice(&self.data);
    }

    pub fn serialize(&self, with_hashes: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_size(with_hashes));
        self.serialize_into(&mut out, with_hashes);
        out
    }

    /// Data bits as upper-case hex, `_` marking a partial last nibble
    pub fn to_hex(&self) -> String {
        bits::to_hex(&self.data, self.bit_len())
    }
}

impl fmt::Debug for DataCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataCell")
            .field("hash", &self.repr_hash())
            .field("bits", &self.bits)
            .field("refs", &self.refs.len())
            .field("special", &self.special_type())
            .field("level_mask", &self.level_mask)
            .finish()
    }
}
