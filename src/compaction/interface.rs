//! Uniform handle over heterogeneous per-tree compaction state machines.

use std::{
    cell::RefCell,
    ops::Range,
    rc::{Rc, Weak},
};

use super::blocks::CompactionBlocks;
use crate::{
    grid::Callback,
    tree::{Tree, TreeId},
};

/// Work declared by a compaction for the upcoming bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionInfo {
    pub tree_id: TreeId,
    /// Destination level of the merge.
    pub level_b: u8,
    /// Tables participating across both levels.
    pub table_count: usize,
}

/// One per-(tree, level) compaction state machine.
///
/// Implementations live with their trees, outside this crate. The pipeline
/// drives them through this vocabulary and nothing else. Blip completions
/// must be deferred through the grid's event loop; invoking a
/// [`BlipCallback`] synchronously from within the blip call deadlocks the
/// forest.
pub trait Compaction {
    /// Declare whether this compaction has work in the bar starting at `op`.
    fn bar_setup(&mut self, tree: &Tree, op: u64) -> Option<CompactionInfo>;

    /// Distribute the bar's block budget over its beats.
    ///
    /// `scratch` is two single-block regions of the pipeline's pool, reserved
    /// to this compaction for the duration of the bar.
    fn bar_setup_budget(&mut self, beats_per_bar: u64, scratch: [Range<usize>; 2]);

    /// Finalise the bar; invoked for every (tree, level) pair, including
    /// those that declared no work.
    fn bar_finish(&mut self, op: u64, tree: &mut Tree);

    /// Reserve grid write capacity for the coming beat.
    fn beat_grid_acquire(&mut self);

    /// Return unused grid reservations; always paired with an acquire.
    fn beat_grid_forfeit(&mut self);

    /// Hand over the bar's block partition plus this slot's read and write
    /// descriptor ranges.
    fn beat_blocks_assign(
        &mut self,
        blocks: CompactionBlocks,
        reads: Range<usize>,
        writes: Range<usize>,
    );

    /// Start the read stage of one pipeline round.
    fn blip_read(&mut self, callback: BlipCallback);

    /// Start the merge stage; the only stage that reports exhaustion.
    fn blip_merge(&mut self, callback: BlipCallback);

    /// Start the write stage of one pipeline round.
    fn blip_write(&mut self, callback: BlipCallback);

    /// Drop all in-flight state; the replica is resetting.
    fn reset(&mut self);
}

/// Shared handle to a compaction state machine.
pub type CompactionRef = Rc<RefCell<dyn Compaction>>;

/// Receives pipeline completions; implemented by the forest.
pub(crate) trait PipelineHost {
    /// A blip finished for the slot at `slot_index`. Returns a continuation
    /// to run once the host borrow is released, if the completion finished a
    /// lifecycle operation.
    fn blip_complete(
        &mut self,
        slot_index: usize,
        beat_exhausted: Option<bool>,
        bar_exhausted: Option<bool>,
    ) -> Option<Callback>;

    /// The pipeline's end-of-beat tick fired.
    fn beat_complete(&mut self) -> Option<Callback>;
}

/// Completion token for one blip.
///
/// Consumed exactly once, from a later tick of the event loop. The merge
/// stage reports beat/bar exhaustion through the two flags; read and write
/// must pass `None` for both.
pub struct BlipCallback {
    host: Weak<RefCell<dyn PipelineHost>>,
    slot_index: usize,
}

impl BlipCallback {
    pub(crate) fn new(host: Weak<RefCell<dyn PipelineHost>>, slot_index: usize) -> Self {
        Self { host, slot_index }
    }

    /// Deliver the completion.
    pub fn complete(self, beat_exhausted: Option<bool>, bar_exhausted: Option<bool>) {
        let Some(host) = self.host.upgrade() else {
            // The forest was torn down with the blip in flight.
            return;
        };
        let follow_up =
            host.borrow_mut()
                .blip_complete(self.slot_index, beat_exhausted, bar_exhausted);
        if let Some(callback) = follow_up {
            callback();
        }
    }
}

/// A queued compaction: the work it declared plus the shared state machine.
pub(crate) struct CompactionInterface {
    info: CompactionInfo,
    compaction: CompactionRef,
}

impl CompactionInterface {
    pub(crate) fn new(info: CompactionInfo, compaction: CompactionRef) -> Self {
        Self { info, compaction }
    }

    pub(crate) fn info(&self) -> &CompactionInfo {
        &self.info
    }

    pub(crate) fn bar_setup_budget(&self, beats_per_bar: u64, scratch: [Range<usize>; 2]) {
        self.compaction
            .borrow_mut()
            .bar_setup_budget(beats_per_bar, scratch);
    }

    pub(crate) fn beat_grid_acquire(&self) {
        self.compaction.borrow_mut().beat_grid_acquire();
    }

    pub(crate) fn beat_grid_forfeit(&self) {
        self.compaction.borrow_mut().beat_grid_forfeit();
    }

    pub(crate) fn beat_blocks_assign(
        &self,
        blocks: CompactionBlocks,
        reads: Range<usize>,
        writes: Range<usize>,
    ) {
        self.compaction
            .borrow_mut()
            .beat_blocks_assign(blocks, reads, writes);
    }

    pub(crate) fn blip_read(&self, callback: BlipCallback) {
        self.compaction.borrow_mut().blip_read(callback);
    }

    pub(crate) fn blip_merge(&self, callback: BlipCallback) {
        self.compaction.borrow_mut().blip_merge(callback);
    }

    pub(crate) fn blip_write(&self, callback: BlipCallback) {
        self.compaction.borrow_mut().blip_write(callback);
    }
}
