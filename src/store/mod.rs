//! Reference-counted persistent cell storage
//!
//! Cells are stored in a key-value backend under their representation hash,
//! each with a reference count. [`DynamicBagOfCellsDb`] tracks roots being
//! added and removed and, on commit, writes only the cells whose counts
//! changed; cells that drop to zero are erased.

mod cell_storage;
mod dynamic;
mod hash_table;
mod memory;

pub use cell_storage::{CellLoader, CellStorer, ExtCellCreator, LoadResult};
pub use dynamic::{CellDbStats, DynamicBagOfCellsDb};
pub use hash_table::CellHashTable;
pub use memory::MemoryKeyValue;

use crate::Result;
use std::sync::Arc;

/// Read access to a key-value backend
pub trait KeyValueReader: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Number of keys starting with `prefix`
    fn count(&self, prefix: &[u8]) -> Result<usize>;
}

/// Writable key-value backend with transactions
///
/// Writes between `begin_transaction` and `commit_transaction` become
/// visible together; `abort_transaction` drops them.
pub trait KeyValue: KeyValueReader {
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn erase(&self, key: &[u8]) -> Result<()>;

    /// Read-only view frozen at the current state
    fn snapshot(&self) -> Arc<dyn KeyValueReader>;

    fn begin_transaction(&self) -> Result<()>;
    fn commit_transaction(&self) -> Result<()>;
    fn abort_transaction(&self) -> Result<()>;
}
