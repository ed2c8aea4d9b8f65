use super::Cell;
use std::any::Any;
use std::sync::Arc;

/// Root handle that keeps the source of its cells alive
///
/// Lazily decoded cells only hold weak references to their reader; the
/// reader lives as long as some root handle does.
pub struct RootCell {
    cell: Cell,
    _owner: Arc<dyn Any + Send + Sync>,
}

impl RootCell {
    pub fn create(cell: Cell, owner: Arc<dyn Any + Send + Sync>) -> Cell {
        Cell::Root(Arc::new(RootCell {
            cell,
            _owner: owner,
        }))
    }

    pub fn inner(&self) -> &Cell {
        &self.cell
    }
}
