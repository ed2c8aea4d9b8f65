//! Process-wide cell counters

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

static DATA_CELLS_CREATED: AtomicU64 = AtomicU64::new(0);
static EXT_CELLS_LOADED: AtomicU64 = AtomicU64::new(0);
static LAZY_CELLS_DECODED: AtomicU64 = AtomicU64::new(0);
static STORE_CELLS_LOADED: AtomicU64 = AtomicU64::new(0);

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellStats {
    pub data_cells_created: u64,
    pub ext_cells_loaded: u64,
    pub lazy_cells_decoded: u64,
    pub store_cells_loaded: u64,
}

pub(crate) fn record_data_cell() {
    DATA_CELLS_CREATED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_ext_load() {
    EXT_CELLS_LOADED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_lazy_decode() {
    LAZY_CELLS_DECODED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_store_load() {
    STORE_CELLS_LOADED.fetch_add(1, Ordering::Relaxed);
}

pub fn snapshot() -> CellStats {
    CellStats {
        data_cells_created: DATA_CELLS_CREATED.load(Ordering::Relaxed),
        ext_cells_loaded: EXT_CELLS_LOADED.load(Ordering::Relaxed),
        lazy_cells_decoded: LAZY_CELLS_DECODED.load(Ordering::Relaxed),
        store_cells_loaded: STORE_CELLS_LOADED.load(Ordering::Relaxed),
    }
}
