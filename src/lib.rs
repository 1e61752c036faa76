//! Deterministic LSM forest orchestration.
//!
//! A [`Forest`] is the top layer of a deterministic, single-node storage
//! engine driven by a replicated state machine. It owns a fixed set of
//! *grooves* — typed object collections, each decomposing into an object
//! tree, an optional id tree, and named secondary-index trees — and paces
//! compaction over the consensus layer's operations: a *bar* of
//! `lsm_batch_multiple` operations budgets the work, each operation is a
//! *beat*, and within a beat the [`compaction`] pipeline advances live
//! compactions through read/merge/write *blips* over a fixed block-memory
//! budget.
//!
//! The storage [`Grid`](grid::Grid), the [`ManifestLog`](manifest::ManifestLog),
//! and the per-tree [`Compaction`](compaction::Compaction) state machines are
//! external collaborators supplied at construction. Everything is
//! single-threaded and cooperative: asynchrony is completion callbacks
//! delivered by the surrounding event loop, and the forest never spawns
//! threads.

mod error;
mod forest;
mod observability;
mod option;

pub mod compaction;
pub mod grid;
pub mod groove;
pub mod manifest;
pub mod node_pool;
pub mod scan_buffer;
pub mod tree;

pub use compaction::{Compaction, CompactionInfo, CompactionMetrics};
pub use error::ForestError;
pub use forest::Forest;
pub use grid::{Callback, Grid};
pub use groove::{GrooveOptions, IndexOptions};
pub use manifest::{ManifestLog, TableInfo};
pub use option::ForestOptions;
pub use tree::{TreeId, TreeInfo, TreeKind};
