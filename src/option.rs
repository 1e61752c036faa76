//! Operating parameters for the forest.

use crate::{error::ForestError, manifest::MANIFEST_ENTRY_SIZE};

/// Upper bound on the number of LSM levels per tree.
pub const LSM_LEVELS_MAX: u8 = 16;

/// Smallest supported grid block.
pub const BLOCK_SIZE_MIN: usize = 512;

/// Configure the operating parameters of each component in the
/// [`Forest`](crate::Forest).
///
/// Options are validated once, at forest construction; every lifecycle
/// operation afterwards assumes they hold.
#[derive(Clone, Debug)]
pub struct ForestOptions {
    /// Number of levels in each tree, including level 0.
    pub(crate) lsm_levels: u8,

    /// Operations per bar; compaction work is budgeted over this window.
    pub(crate) lsm_batch_multiple: u64,

    /// Table count growth factor between adjacent levels.
    pub(crate) lsm_growth_factor: u64,

    /// Size in bytes of one grid block.
    pub(crate) block_size: usize,

    /// Size in bytes of one node in the manifest level arena.
    pub(crate) node_size: usize,

    /// Number of nodes in the manifest level arena.
    pub(crate) node_count: usize,

    /// Size in bytes of one scan buffer.
    pub(crate) scan_buffer_size: usize,

    /// Number of buffers in the scan buffer pool.
    pub(crate) scan_buffer_count: usize,
}

impl Default for ForestOptions {
    fn default() -> Self {
        Self {
            lsm_levels: 7,
            lsm_batch_multiple: 32,
            lsm_growth_factor: 8,
            block_size: 64 * 1024,
            node_size: 4 * 1024,
            node_count: 1024,
            scan_buffer_size: 16 * 1024,
            scan_buffer_count: 8,
        }
    }
}

impl ForestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lsm_levels(mut self, levels: u8) -> Self {
        self.lsm_levels = levels;
        self
    }

    pub fn lsm_batch_multiple(mut self, batch_multiple: u64) -> Self {
        self.lsm_batch_multiple = batch_multiple;
        self
    }

    pub fn lsm_growth_factor(mut self, growth_factor: u64) -> Self {
        self.lsm_growth_factor = growth_factor;
        self
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn node_pool(mut self, node_count: usize, node_size: usize) -> Self {
        self.node_count = node_count;
        self.node_size = node_size;
        self
    }

    pub fn scan_buffers(mut self, count: usize, size: usize) -> Self {
        self.scan_buffer_count = count;
        self.scan_buffer_size = size;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ForestError> {
        if self.lsm_levels == 0 || self.lsm_levels > LSM_LEVELS_MAX {
            return Err(ForestError::InvalidLevels {
                got: self.lsm_levels,
                max: LSM_LEVELS_MAX,
            });
        }
        if self.lsm_batch_multiple < 2 || !self.lsm_batch_multiple.is_power_of_two() {
            return Err(ForestError::InvalidBatchMultiple(self.lsm_batch_multiple));
        }
        if self.lsm_growth_factor < 2 {
            return Err(ForestError::InvalidGrowthFactor(self.lsm_growth_factor));
        }
        if self.block_size < BLOCK_SIZE_MIN {
            return Err(ForestError::InvalidBlockSize {
                got: self.block_size,
                min: BLOCK_SIZE_MIN,
            });
        }
        if self.node_count == 0 || self.node_size < MANIFEST_ENTRY_SIZE {
            return Err(ForestError::InvalidNodePool {
                min: MANIFEST_ENTRY_SIZE,
            });
        }
        Ok(())
    }
}
