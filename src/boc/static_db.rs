use super::{BagOfCells, BlobView};
use crate::cell::Cell;
use crate::config::BocConfig;
use crate::{Error, Result};
use std::sync::Arc;

/// Read-only access to the roots of a serialized bag of cells
pub trait StaticBagOfCellsDb: Send + Sync {
    fn root_count(&self) -> Result<usize>;
    fn root_cell(&self, i: usize) -> Result<Cell>;
}

/// Bag of cells decoded eagerly into memory
pub struct BaselineBoc {
    roots: Vec<Cell>,
}

impl BaselineBoc {
    pub fn create(data: &[u8]) -> Result<Arc<Self>> {
        Self::create_with(data, &BocConfig::default())
    }

    pub fn create_with(data: &[u8], config: &BocConfig) -> Result<Arc<Self>> {
        let mut boc = BagOfCells::new();
        boc.deserialize_with(data, config)?;
        Ok(Arc::new(BaselineBoc { roots: boc.roots() }))
    }

    /// Read the whole blob and decode it
    pub fn from_view(view: &dyn BlobView) -> Result<Arc<Self>> {
        let data = view.read_at(0, view.size() as usize)?;
        Self::create(&data)
    }
}

impl StaticBagOfCellsDb for BaselineBoc {
    fn root_count(&self) -> Result<usize> {
        Ok(self.roots.len())
    }

    fn root_cell(&self, i: usize) -> Result<Cell> {
        self.roots
            .get(i)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("invalid root_cell index: {}", i)))
    }
}
