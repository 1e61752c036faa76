use thiserror::Error;

use crate::tree::TreeId;

/// Errors surfaced while constructing a forest.
///
/// Everything here indicates a misconfigured groove registry or invalid
/// operating parameters, caught before any lifecycle operation runs. Runtime
/// invariant violations are not errors; they abort.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ForestError {
    #[error("forest requires at least one groove")]
    NoGrooves,
    #[error("tree id 0 is reserved")]
    ReservedTreeId,
    #[error("tree id {0} assigned to more than one tree")]
    DuplicateTreeId(TreeId),
    #[error("tree ids are not contiguous: {0} is unassigned")]
    MissingTreeId(TreeId),
    #[error("lsm_levels must be between 1 and {max}, got {got}")]
    InvalidLevels { got: u8, max: u8 },
    #[error("lsm_batch_multiple must be a power of two >= 2, got {0}")]
    InvalidBatchMultiple(u64),
    #[error("lsm_growth_factor must be >= 2, got {0}")]
    InvalidGrowthFactor(u64),
    #[error("block_size of {got} bytes is below the {min} byte minimum")]
    InvalidBlockSize { got: usize, min: usize },
    #[error("node pool requires a nonzero node count and a node size of at least {min} bytes")]
    InvalidNodePool { min: usize },
    #[error(
        "block pool of {available} blocks cannot budget {required} blocks \
         for {compactions} concurrent compactions"
    )]
    BlockPoolTooSmall {
        available: usize,
        required: usize,
        compactions: usize,
    },
}
