//! The pipeline's block pool and its per-bar partition.
//!
//! The pool is a fixed, pre-allocated array of block buffers plus parallel
//! read and write descriptor arrays, owned by the pipeline for its whole
//! life. Once per bar it is carved into pairwise-disjoint regions: two
//! single-block scratch ranges per queued compaction, a reservation for
//! input index blocks, and — per pipeline half — input data ranges for both
//! source levels and an output data range. The partition is computed from
//! derived quantities, never from fixed offsets; regions are disjoint by
//! construction because each begins where the previous one ends.

use std::ops::Range;

use crate::grid::BlockAddress;

use super::PIPELINE_SLOT_COUNT;

/// Number of blocks (and read/write descriptors) in the pipeline's pool.
pub const BLOCK_POOL_BLOCKS: usize = 1024;

/// Pipeline halves double-buffering the merge's data dependencies.
const PIPELINE_HALVES: usize = 2;

/// Source levels feeding one compaction.
const INPUT_LEVELS: usize = 2;

/// Bookkeeping slot for one in-flight grid read.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReadDescriptor {
    pub address: BlockAddress,
    pub pending: bool,
}

/// Bookkeeping slot for one in-flight grid write.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteDescriptor {
    pub address: BlockAddress,
    pub pending: bool,
}

/// The bar-wide partition of the block pool, as index ranges into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionBlocks {
    /// Index blocks of the input tables, both levels.
    pub input_index_blocks: Range<usize>,
    /// Input data blocks, by pipeline half and source level.
    pub input_data_blocks: [[Range<usize>; INPUT_LEVELS]; PIPELINE_HALVES],
    /// Output data blocks, by pipeline half.
    pub output_data_blocks: [Range<usize>; PIPELINE_HALVES],
}

impl CompactionBlocks {
    /// Every region of the partition, for disjointness checks.
    pub fn regions(&self) -> Vec<Range<usize>> {
        let mut regions = vec![self.input_index_blocks.clone()];
        for half in 0..PIPELINE_HALVES {
            regions.extend(self.input_data_blocks[half].iter().cloned());
            regions.push(self.output_data_blocks[half].clone());
        }
        regions
    }
}

/// Fewest pool blocks that can budget `compaction_count` compactions: two
/// scratch blocks each, at least two index blocks, and one input block per
/// level plus one output block for each pipeline half.
pub(crate) fn blocks_required(compaction_count: usize) -> usize {
    2 * compaction_count + 2 + PIPELINE_HALVES * (INPUT_LEVELS + 1)
}

pub(crate) struct BlockPool {
    blocks: Vec<Box<[u8]>>,
    reads: Vec<ReadDescriptor>,
    writes: Vec<WriteDescriptor>,
}

impl BlockPool {
    pub(crate) fn new(block_size: usize) -> Self {
        Self {
            blocks: (0..BLOCK_POOL_BLOCKS)
                .map(|_| vec![0; block_size].into_boxed_slice())
                .collect(),
            reads: vec![ReadDescriptor::default(); BLOCK_POOL_BLOCKS],
            writes: vec![WriteDescriptor::default(); BLOCK_POOL_BLOCKS],
        }
    }

    pub(crate) fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// The two single-block scratch ranges reserved to a queued compaction.
    pub(crate) fn scratch_for(&self, compaction_index: usize) -> [Range<usize>; 2] {
        let base = 2 * compaction_index;
        assert!(base + 2 <= self.blocks.len());
        [base..base + 1, base + 1..base + 2]
    }

    /// The read and write descriptor ranges for the slot at `slot_index`.
    pub(crate) fn descriptor_ranges_for_slot(
        &self,
        slot_index: usize,
    ) -> (Range<usize>, Range<usize>) {
        assert!(slot_index < PIPELINE_SLOT_COUNT);
        let per_slot_reads = self.reads.len() / PIPELINE_SLOT_COUNT;
        let per_slot_writes = self.writes.len() / PIPELINE_SLOT_COUNT;
        let reads = slot_index * per_slot_reads..(slot_index + 1) * per_slot_reads;
        let writes = slot_index * per_slot_writes..(slot_index + 1) * per_slot_writes;
        (reads, writes)
    }

    /// Partition the pool for a bar with `compaction_count` queued
    /// compactions.
    ///
    /// Covers the whole pool beyond the scratch region: the index
    /// reservation takes `max(2, growth_factor + 1)` blocks (the incoming
    /// level contributes up to `growth_factor` tables, the target level one
    /// more) plus the parity block if the data region would split unevenly;
    /// each half then splits a quarter to each input level with the
    /// remainder as output.
    pub(crate) fn divide_blocks(
        &self,
        compaction_count: usize,
        growth_factor: u64,
    ) -> CompactionBlocks {
        let total = self.blocks.len();
        let scratch = 2 * compaction_count;
        assert!(
            total >= blocks_required(compaction_count),
            "block pool of {total} blocks cannot budget {compaction_count} compactions",
        );

        let mut index_count = (growth_factor as usize + 1).max(2);
        index_count = index_count.min(total - scratch - PIPELINE_HALVES * (INPUT_LEVELS + 1));
        let mut data = total - scratch - index_count;
        index_count += data % PIPELINE_HALVES;
        data -= data % PIPELINE_HALVES;
        let half = data / PIPELINE_HALVES;
        let input = (half / 4).max(1);
        let output = half - INPUT_LEVELS * input;
        assert!(output >= 1);

        let mut cursor = scratch;
        let input_index_blocks = cursor..cursor + index_count;
        cursor = input_index_blocks.end;

        let mut input_data_blocks = [[0..0, 0..0], [0..0, 0..0]];
        let mut output_data_blocks = [0..0, 0..0];
        for half_index in 0..PIPELINE_HALVES {
            let level_a = cursor..cursor + input;
            let level_b = level_a.end..level_a.end + input;
            let out = level_b.end..level_b.end + output;
            cursor = out.end;
            input_data_blocks[half_index] = [level_a, level_b];
            output_data_blocks[half_index] = out;
        }
        assert_eq!(cursor, total);

        CompactionBlocks {
            input_index_blocks,
            input_data_blocks,
            output_data_blocks,
        }
    }
}
