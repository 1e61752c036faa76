//! The beat-paced compaction pipeline.
//!
//! Compaction work is amortised across the operations of the consensus
//! layer: a *bar* of `lsm_batch_multiple` consecutive operations budgets the
//! work, each operation within it is a *beat*, and within a beat each live
//! compaction advances through *blips* (read, merge, write) staged across
//! three pipeline slots. The per-tree compaction state machines themselves
//! live outside this crate behind the [`Compaction`] trait; this module owns
//! the scheduler, the block pool it partitions, and the uniform interface it
//! drives the state machines through.

mod blocks;
mod interface;
mod metrics;
mod pipeline;

pub use blocks::{CompactionBlocks, ReadDescriptor, WriteDescriptor, BLOCK_POOL_BLOCKS};
pub use interface::{BlipCallback, Compaction, CompactionInfo, CompactionRef};
pub use metrics::CompactionMetrics;

pub(crate) use blocks::{blocks_required, BlockPool};
pub(crate) use interface::{CompactionInterface, PipelineHost};
pub(crate) use pipeline::CompactionPipeline;

/// Number of pipeline slots: one per blip stage of the active compaction.
pub const PIPELINE_SLOT_COUNT: usize = 3;
