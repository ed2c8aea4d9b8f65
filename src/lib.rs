//! # boc_db
//!
//! Content-addressed cell storage with a bag-of-cells codec and Merkle proofs.
//!
//! Data is a DAG of immutable cells, each identified by a SHA-256
//! representation hash. The crate provides:
//!
//! - **Cells**: construction, multi-level hashing, pruned branches and views
//!   for proof checking ([`cell`])
//! - **Bag of cells**: the binary codec, eager and lazy ([`boc`])
//! - **Merkle proofs and updates**: generation, checking and composition
//!   ([`merkle`])
//! - **Dynamic store**: a reference-counted cell database persisting
//!   minimal diffs to a key-value backend ([`store`])
//!
//! ## Example
//!
//! ```
//! use boc_db::boc::{std_boc_deserialize, std_boc_serialize, Mode};
//! use boc_db::cell::CellBuilder;
//!
//! let mut b = CellBuilder::new();
//! b.store_bytes(b"ab")?;
//! let cell = b.finalize_cell(false)?;
//! let bytes = std_boc_serialize(cell.clone(), Mode::WITH_CRC32C)?;
//! assert_eq!(std_boc_deserialize(&bytes)?.repr_hash(), cell.repr_hash());
//! # Ok::<(), boc_db::Error>(())
//! ```

pub mod boc;
pub mod cell;
pub mod config;
pub mod merkle;
pub mod stats;
pub mod store;

mod error;

pub use boc::{BagOfCells, LazyBoc, Mode};
pub use cell::{Cell, CellBuilder, CellHash, CellSlice, CellUsageTree};
pub use config::{BocConfig, EngineConfig, LazyOptions};
pub use error::{Error, Result};
pub use merkle::{MerkleProof, MerkleProofBuilder, MerkleUpdate};
pub use store::{DynamicBagOfCellsDb, KeyValue, KeyValueReader, MemoryKeyValue};
