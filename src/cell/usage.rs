//! Usage tracking for proof generation
//!
//! A [`CellUsageTree`] mirrors the shape of a traversal: one node per
//! opened reference path. Cells reached through a [`UsageCell`] report
//! their loads to the tree, which later tells the proof generator which
//! cells must be revealed.

use super::{Cell, LoadedCell, VirtualizationParameters, MAX_REFS};
use crate::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

pub type NodeId = u32;

#[derive(Clone, Copy, Default)]
struct Node {
    is_loaded: bool,
    has_mark: bool,
    parent: NodeId,
    children: [NodeId; MAX_REFS],
}

/// Record of which cells a traversal loaded
///
/// Node 0 is a sentinel meaning "none"; the root is node 1.
pub struct CellUsageTree {
    use_mark: AtomicBool,
    nodes: Mutex<Vec<Node>>,
}

impl CellUsageTree {
    pub fn new() -> Arc<Self> {
        Arc::new(CellUsageTree {
            use_mark: AtomicBool::new(false),
            nodes: Mutex::new(vec![Node::default(), Node::default()]),
        })
    }

    pub fn root_id(&self) -> NodeId {
        1
    }

    pub fn root_ptr(self: &Arc<Self>) -> UsageNode {
        UsageNode {
            tree: Arc::downgrade(self),
            id: self.root_id(),
        }
    }

    /// Wrap `cell` so its loads are recorded at the root node
    pub fn track(self: &Arc<Self>, cell: Cell) -> Cell {
        UsageCell::create(cell, self.root_ptr())
    }

    /// Whether the node was loaded, or marked when marks stand in for loads
    pub fn is_loaded(&self, id: NodeId) -> bool {
        let nodes = self.nodes.lock();
        if self.use_mark.load(Ordering::Acquire) {
            nodes[id as usize].has_mark
        } else {
            nodes[id as usize].is_loaded
        }
    }

    pub fn has_mark(&self, id: NodeId) -> bool {
        self.nodes.lock()[id as usize].has_mark
    }

    pub fn set_mark(&self, id: NodeId, mark: bool) {
        if id == 0 {
            return;
        }
        self.nodes.lock()[id as usize].has_mark = mark;
    }

    pub fn set_use_mark_for_is_loaded(&self, use_mark: bool) {
        self.use_mark.store(use_mark, Ordering::Release);
    }

    /// Mark every ancestor of `id`, stopping at the first marked one
    pub fn mark_path(&self, id: NodeId) {
        let mut nodes = self.nodes.lock();
        let mut cur = nodes[id as usize].parent;
        while cur != 0 {
            if nodes[cur as usize].has_mark {
                break;
            }
            nodes[cur as usize].has_mark = true;
            cur = nodes[cur as usize].parent;
        }
    }

    pub fn parent(&self, id: NodeId) -> NodeId {
        self.nodes.lock()[id as usize].parent
    }

    /// Child node for reference `ref_id`, or 0 if never created
    pub fn get_child(&self, id: NodeId, ref_id: usize) -> NodeId {
        self.nodes.lock()[id as usize].children[ref_id]
    }

    pub fn create_child(&self, id: NodeId, ref_id: usize) -> NodeId {
        let mut nodes = self.nodes.lock();
        let existing = nodes[id as usize].children[ref_id];
        if existing != 0 {
            return existing;
        }
        let child = nodes.len() as NodeId;
        nodes.push(Node {
            parent: id,
            ..Node::default()
        });
        nodes[id as usize].children[ref_id] = child;
        child
    }

    pub fn on_load(&self, id: NodeId) {
        self.nodes.lock()[id as usize].is_loaded = true;
    }

    /// Number of nodes, the sentinel included
    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }
}

/// Weak pointer to one node of a usage tree
#[derive(Clone)]
pub struct UsageNode {
    tree: Weak<CellUsageTree>,
    id: NodeId,
}

impl UsageNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn tree(&self) -> Option<Arc<CellUsageTree>> {
        self.tree.upgrade()
    }

    /// Record a load; false once the tree is gone
    pub fn on_load(&self) -> bool {
        match self.tree.upgrade() {
            Some(tree) => {
                tree.on_load(self.id);
                true
            }
            None => false,
        }
    }

    pub fn create_child(&self, ref_id: usize) -> UsageNode {
        match self.tree.upgrade() {
            Some(tree) => UsageNode {
                tree: self.tree.clone(),
                id: tree.create_child(self.id, ref_id),
            },
            None => UsageNode {
                tree: Weak::new(),
                id: 0,
            },
        }
    }

    pub fn is_from_tree(&self, tree: &Arc<CellUsageTree>) -> bool {
        std::ptr::eq(self.tree.as_ptr(), Arc::as_ptr(tree))
    }

    /// Mark the path to this node in `master`; false if the node belongs elsewhere
    pub fn mark_path(&self, master: &Arc<CellUsageTree>) -> bool {
        if !self.is_from_tree(master) || self.tree.strong_count() == 0 {
            return false;
        }
        master.mark_path(self.id);
        true
    }
}

/// A cell whose loads are reported to a usage tree node
pub struct UsageCell {
    cell: Cell,
    node: UsageNode,
}

impl UsageCell {
    pub fn create(cell: Cell, node: UsageNode) -> Cell {
        Cell::Usage(Arc::new(UsageCell { cell, node }))
    }

    pub fn inner(&self) -> &Cell {
        &self.cell
    }

    pub fn node(&self) -> &UsageNode {
        &self.node
    }

    pub fn load(&self) -> Result<LoadedCell> {
        let mut loaded = self.cell.load()?;
        if self.node.on_load() {
            loaded.tree_node = Some(self.node.clone());
        }
        Ok(loaded)
    }

    pub fn virtualize(self: &Arc<Self>, virt: VirtualizationParameters) -> Cell {
        let virtualized = self.cell.virtualize(virt);
        if virtualized.ptr_eq(&self.cell) {
            return Cell::Usage(self.clone());
        }
        UsageCell::create(virtualized, self.node.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{CellBuilder, CellSlice};

    fn chain(len: usize) -> Cell {
        let mut cell = CellBuilder::new().finalize_cell(false).unwrap();
        for i in 0..len {
            let mut cb = CellBuilder::new();
            cb.store_u64(i as u64, 8).unwrap().store_ref(cell).unwrap();
            cell = cb.finalize_cell(false).unwrap();
        }
        cell
    }

    #[test]
    fn test_loads_are_recorded() {
        let tree = CellUsageTree::new();
        let root = tree.track(chain(3));
        assert!(!tree.is_loaded(tree.root_id()));

        let cs = CellSlice::load(&root).unwrap();
        assert!(tree.is_loaded(tree.root_id()));
        let child = cs.prefetch_ref(0).unwrap();
        let child_id = tree.get_child(tree.root_id(), 0);
        assert_ne!(child_id, 0);
        assert!(!tree.is_loaded(child_id));
        CellSlice::load(&child).unwrap();
        assert!(tree.is_loaded(child_id));
        assert_eq!(tree.get_child(child_id, 0), 0);
    }

    #[test]
    fn test_create_child_is_idempotent() {
        let tree = CellUsageTree::new();
        let a = tree.create_child(tree.root_id(), 2);
        let b = tree.create_child(tree.root_id(), 2);
        assert_eq!(a, b);
        assert_eq!(tree.parent(a), tree.root_id());
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_mark_path_starts_at_parent() {
        let tree = CellUsageTree::new();
        let a = tree.create_child(tree.root_id(), 0);
        let b = tree.create_child(a, 0);
        tree.mark_path(b);
        assert!(!tree.has_mark(b));
        assert!(tree.has_mark(a));
        assert!(tree.has_mark(tree.root_id()));

        tree.set_use_mark_for_is_loaded(true);
        assert!(tree.is_loaded(a));
        assert!(!tree.is_loaded(b));
    }

    #[test]
    fn test_node_outlives_tree() {
        let tree = CellUsageTree::new();
        let node = tree.root_ptr();
        let other = CellUsageTree::new();
        assert!(node.is_from_tree(&tree));
        assert!(!node.mark_path(&other));
        drop(tree);
        assert!(!node.on_load());
        assert_eq!(node.create_child(0).id(), 0);
    }
}
