//! Immutable content-addressed cells
//!
//! A cell holds up to 1023 bits and up to 4 references. Every cell is
//! identified by its representation hash; cells carrying pruned branches
//! (directly or through children) also have lower-level hashes, one per
//! significant level of their [`LevelMask`].
//!
//! [`Cell`] is a cheap-to-clone handle over one of several variants:
//! - `Data`: a concrete cell with data and children
//! - `Pruned`: hash/depth only, cannot be loaded
//! - `Ext`: hash/depth only until a loader materializes it, exactly once
//! - `Virtual`: a view capping the visible level of a proof cell
//! - `Usage`: a view recording loads into a [`CellUsageTree`]
//! - `Root`: a root handle keeping its source alive

pub mod bits;
mod builder;
mod data_cell;
mod ext;
mod hash;
mod level_mask;
mod root;
mod slice;
mod usage;
mod virtual_cell;

pub use builder::CellBuilder;
pub use data_cell::DataCell;
pub use ext::{ExtCell, ExtCellLoader, PrunedCell, PrunedCellInfo};
pub use hash::CellHash;
pub use level_mask::LevelMask;
pub use root::RootCell;
pub use slice::CellSlice;
pub use usage::{CellUsageTree, NodeId, UsageCell, UsageNode};
pub use virtual_cell::VirtualCell;

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Maximum number of data bits in a cell
pub const MAX_BITS: usize = 1023;
/// Maximum number of references in a cell
pub const MAX_REFS: usize = 4;
/// Maximum cell level
pub const MAX_LEVEL: u32 = 3;
/// Largest cell depth; a cell deeper than this cannot be created
pub const MAX_DEPTH: u16 = 1024;
pub const HASH_BYTES: usize = 32;
pub const DEPTH_BYTES: usize = 2;

/// Type tag of a special (exotic) cell, stored in its first data byte
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecialType {
    Ordinary,
    PrunedBranch,
    Library,
    MerkleProof,
    MerkleUpdate,
}

impl SpecialType {
    pub fn as_byte(&self) -> u8 {
        match self {
            SpecialType::Ordinary => 0,
            SpecialType::PrunedBranch => 1,
            SpecialType::Library => 2,
            SpecialType::MerkleProof => 3,
            SpecialType::MerkleUpdate => 4,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(SpecialType::Ordinary),
            1 => Some(SpecialType::PrunedBranch),
            2 => Some(SpecialType::Library),
            3 => Some(SpecialType::MerkleProof),
            4 => Some(SpecialType::MerkleUpdate),
            _ => None,
        }
    }

    /// Merkle cells shift the levels of their children down by one
    pub fn is_merkle(&self) -> bool {
        matches!(self, SpecialType::MerkleProof | SpecialType::MerkleUpdate)
    }
}

/// How far into a proof a cell view can see
///
/// `level` caps the visible hash level; `virtualization` counts the proof
/// layers opened to reach the view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VirtualizationParameters {
    level: u8,
    virtualization: u8,
}

impl VirtualizationParameters {
    /// Level value meaning "not virtualized"
    pub const NO_LEVEL: u32 = u8::MAX as u32;

    pub fn new(level: u8, virtualization: u8) -> Self {
        VirtualizationParameters {
            level,
            virtualization,
        }
    }

    pub fn level(&self) -> u32 {
        self.level as u32
    }

    pub fn virtualization(&self) -> u32 {
        self.virtualization as u32
    }

    pub fn is_virtualized(&self) -> bool {
        self.level != u8::MAX
    }

    /// Combine with an outer view; the tighter level wins
    pub fn apply(&self, outer: VirtualizationParameters) -> Self {
        if outer.level >= self.level {
            return *self;
        }
        debug_assert!(self.virtualization <= outer.virtualization);
        outer
    }
}

impl Default for VirtualizationParameters {
    fn default() -> Self {
        VirtualizationParameters {
            level: u8::MAX,
            virtualization: 0,
        }
    }
}

/// A materialized cell together with the view it was loaded through
#[derive(Clone)]
pub struct LoadedCell {
    pub data_cell: Arc<DataCell>,
    pub virt: VirtualizationParameters,
    pub tree_node: Option<UsageNode>,
}

impl LoadedCell {
    pub fn new(data_cell: Arc<DataCell>) -> Self {
        LoadedCell {
            data_cell,
            virt: VirtualizationParameters::default(),
            tree_node: None,
        }
    }
}

/// Shared handle to an immutable cell
#[derive(Clone)]
pub enum Cell {
    Data(Arc<DataCell>),
    Pruned(Arc<PrunedCell>),
    Ext(Arc<ExtCell>),
    Virtual(Arc<VirtualCell>),
    Usage(Arc<UsageCell>),
    Root(Arc<RootCell>),
}

impl Cell {
    /// Hash at `level` (levels above the cell's own collapse to it)
    pub fn hash(&self, level: u32) -> CellHash {
        match self {
            Cell::Data(c) => c.hash(level),
            Cell::Pruned(c) => c.info().hash(level),
            Cell::Ext(c) => c.info().hash(level),
            Cell::Virtual(c) => c.hash(level),
            Cell::Usage(c) => c.inner().hash(level),
            Cell::Root(c) => c.inner().hash(level),
        }
    }

    pub fn depth(&self, level: u32) -> u16 {
        match self {
            Cell::Data(c) => c.depth(level),
            Cell::Pruned(c) => c.info().depth(level),
            Cell::Ext(c) => c.info().depth(level),
            Cell::Virtual(c) => c.depth(level),
            Cell::Usage(c) => c.inner().depth(level),
            Cell::Root(c) => c.inner().depth(level),
        }
    }

    /// Representation hash, the identity of the cell
    pub fn repr_hash(&self) -> CellHash {
        self.hash(MAX_LEVEL)
    }

    pub fn repr_depth(&self) -> u16 {
        self.depth(MAX_LEVEL)
    }

    pub fn level_mask(&self) -> LevelMask {
        match self {
            Cell::Data(c) => c.level_mask(),
            Cell::Pruned(c) => c.info().level_mask,
            Cell::Ext(c) => c.info().level_mask,
            Cell::Virtual(c) => c.level_mask(),
            Cell::Usage(c) => c.inner().level_mask(),
            Cell::Root(c) => c.inner().level_mask(),
        }
    }

    pub fn level(&self) -> u32 {
        self.level_mask().level()
    }

    /// Number of proof layers opened to reach this view
    pub fn virtualization(&self) -> u32 {
        match self {
            Cell::Data(c) => c.virtualization(),
            Cell::Pruned(_) | Cell::Ext(_) => 0,
            Cell::Virtual(c) => c.virt().virtualization(),
            Cell::Usage(c) => c.inner().virtualization(),
            Cell::Root(c) => c.inner().virtualization(),
        }
    }

    /// Whether `load` can succeed without I/O
    pub fn is_loaded(&self) -> bool {
        match self {
            Cell::Data(_) => true,
            Cell::Pruned(_) => false,
            Cell::Ext(c) => c.is_loaded(),
            Cell::Virtual(c) => c.inner().is_loaded(),
            Cell::Usage(c) => c.inner().is_loaded(),
            Cell::Root(c) => c.inner().is_loaded(),
        }
    }

    /// Materialize the concrete cell behind this handle
    pub fn load(&self) -> Result<LoadedCell> {
        match self {
            Cell::Data(c) => Ok(LoadedCell::new(c.clone())),
            Cell::Pruned(_) => Err(crate::Error::PrunedBranch),
            Cell::Ext(c) => Ok(LoadedCell::new(c.load_data_cell()?)),
            Cell::Virtual(c) => c.load(),
            Cell::Usage(c) => c.load(),
            Cell::Root(c) => c.inner().load(),
        }
    }

    /// View of this cell capped at `virt`
    pub fn virtualize(&self, virt: VirtualizationParameters) -> Cell {
        match self {
            Cell::Virtual(c) => c.virtualize(virt),
            Cell::Usage(c) => c.virtualize(virt),
            Cell::Root(c) => c.inner().virtualize(virt),
            _ => VirtualCell::create(virt, self.clone()),
        }
    }

    /// Usage tree node attached to this handle, if any
    pub fn tree_node(&self) -> Option<UsageNode> {
        match self {
            Cell::Usage(c) => Some(c.node().clone()),
            Cell::Root(c) => c.inner().tree_node(),
            _ => None,
        }
    }

    /// The concrete cell if this handle is one
    pub fn as_data(&self) -> Option<&Arc<DataCell>> {
        match self {
            Cell::Data(c) => Some(c),
            _ => None,
        }
    }

    /// Same underlying allocation
    pub fn ptr_eq(&self, other: &Cell) -> bool {
        match (self, other) {
            (Cell::Data(a), Cell::Data(b)) => Arc::ptr_eq(a, b),
            (Cell::Pruned(a), Cell::Pruned(b)) => Arc::ptr_eq(a, b),
            (Cell::Ext(a), Cell::Ext(b)) => Arc::ptr_eq(a, b),
            (Cell::Virtual(a), Cell::Virtual(b)) => Arc::ptr_eq(a, b),
            (Cell::Usage(a), Cell::Usage(b)) => Arc::ptr_eq(a, b),
            (Cell::Root(a), Cell::Root(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Special type of the concrete cell (loads it)
    pub fn special_type(&self) -> Result<SpecialType> {
        Ok(self.load()?.data_cell.special_type())
    }

    /// Child `i` as seen through this handle (loads it)
    pub fn child(&self, i: usize) -> Result<Option<Cell>> {
        Ok(CellSlice::load_special(self)?.prefetch_ref(i))
    }
}

impl From<Arc<DataCell>> for Cell {
    fn from(cell: Arc<DataCell>) -> Self {
        Cell::Data(cell)
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Cell::Data(_) => "Data",
            Cell::Pruned(_) => "Pruned",
            Cell::Ext(_) => "Ext",
            Cell::Virtual(_) => "Virtual",
            Cell::Usage(_) => "Usage",
            Cell::Root(_) => "Root",
        };
        write!(
            f,
            "Cell::{}({}, level={})",
            kind,
            self.repr_hash().short(),
            self.level()
        )
    }
}
