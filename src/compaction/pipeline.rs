//! The three-stage compaction scheduler.
//!
//! Each beat, the pipeline walks the compactions queued for the bar in
//! ascending index order. The active compaction occupies up to three slots,
//! one per blip stage, so that a read, a merge, and a write of consecutive
//! rounds overlap. Scheduling is round-based: every in-flight blip must
//! rendezvous before the next decision, which keeps the slots aligned and
//! makes output-block reuse safe without per-slot dependency tracking. A
//! finer, memory-dependency-only barrier would admit more overlap; the
//! coarse round barrier is deliberate.
//!
//! Reads are issued ahead of the merge that consumes them: when a read
//! completes, the merge is held back until the end of the scheduling pass so
//! that the next read's latency is hidden behind it.
//!
//! The merge stage alone reports exhaustion. `beat_exhausted` stops the
//! current compaction for this beat; `bar_exhausted` additionally retires it
//! from the remaining beats of the bar. Exhaustion never abandons a round
//! mid-flight: a merge that has already run still advances to its write —
//! only speculative reads are discarded — and the compaction forfeits its
//! beat only once the whole round has settled.

use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

use roaring::RoaringBitmap;

use super::{
    blocks::BlockPool,
    interface::{BlipCallback, CompactionInterface, PipelineHost},
    metrics::CompactionMetrics,
    PIPELINE_SLOT_COUNT,
};
use crate::{grid::Grid, observability::log_debug};

/// The blip stage a slot most recently started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotOp {
    Read,
    Merge,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Filling,
    Full,
}

#[derive(Debug)]
struct PipelineSlot {
    compaction_index: usize,
    active_op: SlotOp,
}

pub(crate) struct CompactionPipeline {
    grid: Rc<RefCell<dyn Grid>>,
    host: Weak<RefCell<dyn PipelineHost>>,
    block_pool: BlockPool,
    growth_factor: u64,

    /// Compactions queued for the current bar, in bar-setup order.
    pub(crate) compactions: Vec<CompactionInterface>,

    /// Compactions still live within the current bar.
    bar_active: RoaringBitmap,
    /// Compactions still to progress within the current beat.
    beat_active: RoaringBitmap,
    /// Compactions holding a grid reservation for the current beat.
    beat_acquired: RoaringBitmap,
    /// Upper bound on queued compactions: every (tree, level) pair.
    bitset_capacity: u64,

    blocks_split: Option<super::blocks::CompactionBlocks>,
    slots: [Option<PipelineSlot>; PIPELINE_SLOT_COUNT],
    slot_filled_count: usize,
    slot_running_count: usize,
    state: PipelineState,
    beat_exhausted: bool,
    /// A beat is underway and its completion has not yet been delivered.
    beat_pending: bool,

    pub(crate) metrics: CompactionMetrics,
}

impl CompactionPipeline {
    pub(crate) fn new(
        grid: Rc<RefCell<dyn Grid>>,
        host: Weak<RefCell<dyn PipelineHost>>,
        block_size: usize,
        growth_factor: u64,
        bitset_capacity: u64,
    ) -> Self {
        Self {
            grid,
            host,
            block_pool: BlockPool::new(block_size),
            growth_factor,
            compactions: Vec::new(),
            bar_active: RoaringBitmap::new(),
            beat_active: RoaringBitmap::new(),
            beat_acquired: RoaringBitmap::new(),
            bitset_capacity,
            blocks_split: None,
            slots: [None, None, None],
            slot_filled_count: 0,
            slot_running_count: 0,
            state: PipelineState::Filling,
            beat_exhausted: false,
            beat_pending: false,
            metrics: CompactionMetrics::default(),
        }
    }

    /// Advance every queued compaction by one beat.
    ///
    /// The beat completes through the host: either directly via the
    /// next-tick path when nothing is queued, or after the last live
    /// compaction drains. Either way the completion arrives on a later
    /// tick, preserving the replica's tick discipline.
    pub(crate) fn beat(&mut self, op: u64, batch_multiple: u64) {
        self.slot_filled_count = 0;
        self.slot_running_count = 0;

        let first_beat = op % batch_multiple == 0;
        if first_beat {
            self.bar_active.clear();
            assert!(self.compactions.len() as u64 <= self.bitset_capacity);
            for index in 0..self.compactions.len() {
                self.bar_active.insert(index as u32);
                let scratch = self.block_pool.scratch_for(index);
                self.compactions[index].bar_setup_budget(batch_multiple, scratch);
            }
            self.blocks_split = Some(
                self.block_pool
                    .divide_blocks(self.compactions.len(), self.growth_factor),
            );
            self.metrics.bars_started += 1;
        }

        self.beat_active = self.bar_active.clone();
        assert!(self.slots.iter().all(Option::is_none));
        assert!(!self.beat_pending);
        assert!(!self.beat_exhausted);

        for index in self.bar_active.iter() {
            self.beat_acquired.insert(index);
            self.compactions[index as usize].beat_grid_acquire();
        }

        self.beat_pending = true;
        self.metrics.beats_started += 1;
        log_debug!(
            component = "pipeline",
            event = "beat_commence",
            op,
            first_beat,
            live = self.bar_active.len(),
        );

        if self.compactions.is_empty() {
            // The only path that short-circuits an empty beat; it stays
            // asynchronous so an empty compact still costs one tick.
            self.beat_finished_next_tick();
            return;
        }
        self.state = PipelineState::Filling;
        self.advance_pipeline();
    }

    /// One round of scheduling: advance every filled slot by one stage, fill
    /// a new slot while room remains, then start the held-back merge.
    fn advance_pipeline(&mut self) {
        assert_eq!(self.slot_running_count, 0);

        let Some(active) = self.beat_active.min() else {
            self.beat_finished_next_tick();
            return;
        };
        let active_index = active as usize;

        let mut merge_slot: Option<usize> = None;
        let mut slot_index = 0;
        while slot_index < self.slot_filled_count {
            let active_op = self.slots[slot_index]
                .as_ref()
                .expect("filled slot is vacant")
                .active_op;
            match active_op {
                SlotOp::Read => {
                    if !self.beat_exhausted {
                        assert!(merge_slot.is_none(), "two slots awaiting a merge");
                        merge_slot = Some(slot_index);
                    }
                    // Exhausted: the read is discarded; the compaction's own
                    // state machine progresses implicitly.
                }
                SlotOp::Merge => {
                    self.slots[slot_index].as_mut().unwrap().active_op = SlotOp::Write;
                    self.slot_running_count += 1;
                    self.metrics.blip_writes += 1;
                    let callback = self.blip_callback_for(slot_index);
                    self.compactions[active_index].blip_write(callback);
                }
                SlotOp::Write => {
                    if !self.beat_exhausted {
                        self.slots[slot_index].as_mut().unwrap().active_op = SlotOp::Read;
                        self.slot_running_count += 1;
                        self.metrics.blip_reads += 1;
                        let callback = self.blip_callback_for(slot_index);
                        self.compactions[active_index].blip_read(callback);
                    }
                    // Exhausted: nothing new starts from this slot; whether
                    // the compaction can forfeit its beat is decided once the
                    // whole round has been walked.
                }
            }
            slot_index += 1;
        }

        if self.beat_exhausted {
            // The round must settle before the beat is forfeited: any merge
            // transitioned to its write above still has to land.
            if self.slot_running_count > 0 {
                return;
            }
            let info = self.compactions[active_index].info();
            log_debug!(
                component = "pipeline",
                event = "compaction_drained",
                compaction = active_index,
                tree_id = info.tree_id,
                level_b = info.level_b,
            );
            self.beat_active.remove(active);
            self.beat_exhausted = false;
            self.slots = [None, None, None];
            self.slot_filled_count = 0;
            self.state = PipelineState::Filling;
            return self.advance_pipeline();
        }

        if self.state == PipelineState::Filling {
            let slot_index = self.slot_filled_count;
            self.slots[slot_index] = Some(PipelineSlot {
                compaction_index: active_index,
                active_op: SlotOp::Read,
            });
            let blocks = self
                .blocks_split
                .clone()
                .expect("bar block partition missing");
            let (reads, writes) = self.block_pool.descriptor_ranges_for_slot(slot_index);
            self.compactions[active_index].beat_blocks_assign(blocks, reads, writes);
            self.slot_running_count += 1;
            self.metrics.blip_reads += 1;
            let callback = self.blip_callback_for(slot_index);
            self.compactions[active_index].blip_read(callback);
            self.slot_filled_count += 1;
            if self.slot_filled_count == PIPELINE_SLOT_COUNT {
                self.state = PipelineState::Full;
            }
        }

        // Reads issued above come first; only then does the CPU stage start.
        if let Some(slot_index) = merge_slot {
            self.slots[slot_index].as_mut().unwrap().active_op = SlotOp::Merge;
            self.slot_running_count += 1;
            self.metrics.blip_merges += 1;
            let callback = self.blip_callback_for(slot_index);
            self.compactions[active_index].blip_merge(callback);
        }
    }

    /// Deliver a blip completion for the slot at `slot_index`.
    pub(crate) fn blip_callback(
        &mut self,
        slot_index: usize,
        beat_exhausted: Option<bool>,
        bar_exhausted: Option<bool>,
    ) {
        assert!(slot_index < PIPELINE_SLOT_COUNT);
        let (active_op, compaction_index) = {
            let slot = self.slots[slot_index]
                .as_ref()
                .expect("blip completion for a vacant slot");
            (slot.active_op, slot.compaction_index)
        };

        if beat_exhausted.is_some() || bar_exhausted.is_some() {
            assert_eq!(active_op, SlotOp::Merge, "only the merge stage reports exhaustion");
        }
        if let Some(exhausted) = beat_exhausted {
            if exhausted {
                self.metrics.beat_exhaustions += 1;
            }
            self.beat_exhausted = exhausted;
        }
        if bar_exhausted == Some(true) {
            assert_eq!(
                beat_exhausted,
                Some(true),
                "a bar cannot exhaust without exhausting the beat",
            );
            self.bar_active.remove(compaction_index as u32);
            self.metrics.bar_exhaustions += 1;
        }

        // Rendezvous: every in-flight blip finishes before the next round.
        assert!(self.slot_running_count > 0);
        self.slot_running_count -= 1;
        if self.slot_running_count > 0 {
            return;
        }
        self.advance_pipeline();
    }

    fn blip_callback_for(&self, slot_index: usize) -> BlipCallback {
        BlipCallback::new(self.host.clone(), slot_index)
    }

    fn beat_finished_next_tick(&mut self) {
        let host = self.host.clone();
        self.grid.borrow_mut().on_next_tick(Box::new(move || {
            let Some(host) = host.upgrade() else {
                return;
            };
            let follow_up = host.borrow_mut().beat_complete();
            if let Some(callback) = follow_up {
                callback();
            }
        }));
    }

    /// End-of-beat assertions, run when the next-tick completion arrives.
    pub(crate) fn beat_finished(&mut self) {
        assert!(self.beat_pending);
        assert!(self.beat_active.is_empty());
        assert_eq!(self.slot_filled_count, 0);
        assert_eq!(self.slot_running_count, 0);
        assert!(self.slots.iter().all(Option::is_none));
        self.beat_pending = false;
        self.metrics.beats_finished += 1;
    }

    /// Forfeit this beat's grid reservations, in reverse queue order.
    ///
    /// Called synchronously by the forest once all of the beat's
    /// sub-operations have completed, never from within the pipeline.
    /// Compactions that finished mid-beat forfeit too: acquire and forfeit
    /// always pair.
    pub(crate) fn beat_end(&mut self) {
        for index in (0..self.compactions.len()).rev() {
            if self.beat_acquired.contains(index as u32) {
                self.beat_acquired.remove(index as u32);
                self.compactions[index].beat_grid_forfeit();
            }
        }
        assert!(self.beat_acquired.is_empty());
    }

    /// Retire the bar's queue after the forest has finished every (tree,
    /// level) pair.
    pub(crate) fn bar_end(&mut self) {
        assert!(!self.beat_pending);
        assert!(
            self.bar_active.is_empty(),
            "compactions still live at the end of their bar",
        );
        self.compactions.clear();
        self.blocks_split = None;
        self.metrics.bars_finished += 1;
    }

    /// Drop all bar and beat state. Cumulative metrics survive.
    pub(crate) fn reset(&mut self) {
        self.compactions.clear();
        self.bar_active.clear();
        self.beat_active.clear();
        self.beat_acquired.clear();
        self.blocks_split = None;
        self.slots = [None, None, None];
        self.slot_filled_count = 0;
        self.slot_running_count = 0;
        self.state = PipelineState::Filling;
        self.beat_exhausted = false;
        self.beat_pending = false;
    }
}
