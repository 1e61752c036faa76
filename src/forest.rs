//! The forest: top-level coordinator over grooves, manifest log, and the
//! compaction pipeline.
//!
//! A forest owns a fixed set of grooves, the node pool backing their
//! manifest levels, the scan buffer pool, and the pipeline. It sequences the
//! three lifecycle operations — `open`, `compact(op)`, `checkpoint` — which
//! are mutually exclusive; `compact` fans out into the pipeline's beat plus,
//! on the last beat of a bar, a manifest log compaction increment, and joins
//! both before reporting back.
//!
//! All state lives behind a single `RefCell`; completion callbacks minted
//! for the grid, the manifest log, and the compactions capture a weak handle
//! and re-enter through it on a later tick. A completion that finishes a
//! lifecycle operation returns the user callback out of the borrow and runs
//! it after release, so user callbacks may immediately start the next
//! operation.

use std::{
    cell::{Ref, RefCell, RefMut},
    collections::HashMap,
    rc::{Rc, Weak},
};

use crate::{
    compaction::{
        blocks_required, CompactionInterface, CompactionMetrics, CompactionPipeline,
        CompactionRef, PipelineHost, BLOCK_POOL_BLOCKS,
    },
    error::ForestError,
    grid::{BlockAddress, Callback, GridRef},
    groove::{Groove, GrooveOptions},
    manifest::{self, ManifestLogRef, TableEvent, TableEventFn, TableInfo},
    node_pool::NodePool,
    observability::{log_debug, log_info},
    option::ForestOptions,
    scan_buffer::ScanBufferPool,
    tree::{build_tree_infos, Tree, TreeId, TreeInfo},
};

/// The lifecycle operation currently in flight.
enum Progress {
    Open { callback: Callback },
    Checkpoint { callback: Callback },
    Compact { op: u64, callback: Callback },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManifestLogProgress {
    Idle,
    Compacting,
    Done,
}

/// Top-level handle to the LSM forest. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Forest {
    inner: Rc<RefCell<ForestInner>>,
}

struct ForestInner {
    options: ForestOptions,
    grid: GridRef,
    manifest_log: ManifestLogRef,

    grooves: Vec<Groove>,
    tree_infos: Vec<TreeInfo>,
    tree_id_min: TreeId,
    tree_id_max: TreeId,

    /// Every (tree, level) compaction state machine, level-major: the entry
    /// for `(level_b, tree)` sits at `level_b * tree_count + tree_offset`.
    compactions: Vec<CompactionRef>,
    pipeline: CompactionPipeline,

    node_pool: Rc<RefCell<NodePool>>,
    scan_buffer_pool: ScanBufferPool,

    progress: Option<Progress>,
    manifest_log_progress: ManifestLogProgress,
    /// Outstanding asynchronous sub-operations of the current compact call.
    compactions_running: usize,

    weak: Weak<RefCell<ForestInner>>,
}

impl Forest {
    /// Build a forest over an externally owned grid and manifest log.
    ///
    /// `compaction_factory` supplies the per-(tree, level) compaction state
    /// machine for each pair; it is called in level-major order. Groove
    /// descriptors are validated here — tree ids must be unique, nonzero,
    /// and contiguous — and the block pool must be able to budget the worst
    /// case of every pair compacting at once. Construction either returns a
    /// fully resourced forest or nothing; partially built state unwinds via
    /// drop.
    pub fn new(
        grid: GridRef,
        manifest_log: ManifestLogRef,
        options: ForestOptions,
        grooves: &[GrooveOptions],
        compaction_factory: &mut dyn FnMut(&TreeInfo, u8) -> CompactionRef,
    ) -> Result<Forest, ForestError> {
        options.validate()?;
        if grooves.is_empty() {
            return Err(ForestError::NoGrooves);
        }
        let tree_infos = build_tree_infos(grooves)?;
        let tree_id_min = tree_infos.first().unwrap().tree_id;
        let tree_id_max = tree_infos.last().unwrap().tree_id;

        let tree_count = tree_infos.len();
        let compactions_max = tree_count * options.lsm_levels as usize;
        let required = blocks_required(compactions_max);
        if BLOCK_POOL_BLOCKS < required {
            return Err(ForestError::BlockPoolTooSmall {
                available: BLOCK_POOL_BLOCKS,
                required,
                compactions: compactions_max,
            });
        }

        let node_pool = Rc::new(RefCell::new(NodePool::new(
            options.node_count,
            options.node_size,
        )));
        let groove_values: Vec<Groove> = grooves
            .iter()
            .map(|groove| Groove::new(groove, options.lsm_levels, &node_pool))
            .collect();

        let mut compactions = Vec::with_capacity(compactions_max);
        for level_b in 0..options.lsm_levels {
            for info in &tree_infos {
                compactions.push(compaction_factory(info, level_b));
            }
        }

        let scan_buffer_pool =
            ScanBufferPool::new(options.scan_buffer_count, options.scan_buffer_size);

        let inner = Rc::new_cyclic(|weak: &Weak<RefCell<ForestInner>>| {
            let host: Weak<RefCell<dyn PipelineHost>> = weak.clone();
            RefCell::new(ForestInner {
                pipeline: CompactionPipeline::new(
                    grid.clone(),
                    host,
                    options.block_size,
                    options.lsm_growth_factor,
                    compactions_max as u64,
                ),
                options,
                grid,
                manifest_log,
                grooves: groove_values,
                tree_infos,
                tree_id_min,
                tree_id_max,
                compactions,
                node_pool,
                scan_buffer_pool,
                progress: None,
                manifest_log_progress: ManifestLogProgress::Idle,
                compactions_running: 0,
                weak: weak.clone(),
            })
        });

        {
            let inner = inner.borrow();
            log_info!(
                component = "forest",
                event = "forest_init",
                grooves = inner.grooves.len(),
                trees = inner.tree_infos.len(),
                levels = inner.options.lsm_levels,
                tree_id_min = inner.tree_id_min,
                tree_id_max = inner.tree_id_max,
            );
        }
        Ok(Forest { inner })
    }

    /// Replay the manifest log into the grooves' trees.
    pub fn open(&self, callback: impl FnOnce() + 'static) {
        {
            let mut inner = self.inner.borrow_mut();
            assert!(
                inner.progress.is_none(),
                "forest lifecycle operation already in progress"
            );
            assert_eq!(inner.manifest_log_progress, ManifestLogProgress::Idle);
            inner.progress = Some(Progress::Open {
                callback: Box::new(callback),
            });
            for groove in &mut inner.grooves {
                groove.open_commence();
            }
            log_info!(
                component = "forest",
                event = "forest_open_commence",
                grooves = inner.grooves.len(),
            );
        }

        let weak_event = Rc::downgrade(&self.inner);
        let event: TableEventFn = Box::new(move |table: &TableInfo| {
            if let Some(forest) = weak_event.upgrade() {
                forest.borrow_mut().open_table_event(table);
            }
        });
        let weak_done = Rc::downgrade(&self.inner);
        let done: Callback = Box::new(move || {
            let follow_up = match weak_done.upgrade() {
                Some(forest) => forest.borrow_mut().open_done(),
                None => None,
            };
            if let Some(callback) = follow_up {
                callback();
            }
        });

        let manifest_log = self.inner.borrow().manifest_log.clone();
        manifest_log.borrow_mut().open(event, done);
    }

    /// Advance compaction by one beat for operation `op`.
    ///
    /// `op` is the monotonically increasing operation number supplied by the
    /// replica; `op % lsm_batch_multiple` locates the beat within its bar.
    pub fn compact(&self, callback: impl FnOnce() + 'static, op: u64) {
        let manifest_compact = self
            .inner
            .borrow_mut()
            .compact_commence(Box::new(callback), op);
        if let Some((manifest_log, done)) = manifest_compact {
            manifest_log.borrow_mut().compact(done, op);
        }
    }

    /// Durably checkpoint the manifest log, then verify recovery state.
    pub fn checkpoint(&self, callback: impl FnOnce() + 'static) {
        {
            let mut inner = self.inner.borrow_mut();
            assert!(
                inner.progress.is_none(),
                "forest lifecycle operation already in progress"
            );
            assert_eq!(inner.manifest_log_progress, ManifestLogProgress::Idle);
            inner.grid.borrow().assert_only_repairing();
            let batch_multiple = inner.options.lsm_batch_multiple;
            for groove in &inner.grooves {
                groove.assert_between_bars(batch_multiple);
            }
            inner.progress = Some(Progress::Checkpoint {
                callback: Box::new(callback),
            });
            log_info!(component = "forest", event = "checkpoint_commence");
        }

        let weak = Rc::downgrade(&self.inner);
        let done: Callback = Box::new(move || {
            let follow_up = match weak.upgrade() {
                Some(forest) => forest.borrow_mut().checkpoint_done(),
                None => None,
            };
            if let Some(callback) = follow_up {
                callback();
            }
        });
        let manifest_log = self.inner.borrow().manifest_log.clone();
        manifest_log.borrow_mut().checkpoint(done);
    }

    /// Drop all in-flight state after a replica reset.
    ///
    /// The pipeline resets fully — slots, bitsets, queue, and partition —
    /// along with progress tracking, grooves, trees, pools, and every
    /// compaction state machine. The grid is reset by the replica, not here.
    pub fn reset(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.progress = None;
        inner.compactions_running = 0;
        inner.manifest_log_progress = ManifestLogProgress::Idle;
        inner.pipeline.reset();
        for compaction in &inner.compactions {
            compaction.borrow_mut().reset();
        }
        for groove in &mut inner.grooves {
            groove.reset();
        }
        inner.scan_buffer_pool.reset();
        log_info!(component = "forest", event = "forest_reset");
    }

    /// Snapshot of the pipeline's cumulative counters.
    pub fn metrics(&self) -> CompactionMetrics {
        self.inner.borrow().pipeline.metrics
    }

    /// The tree with `tree_id`; panics if the id is not registered.
    ///
    /// This is the sole supported way to reach a tree from a raw id.
    pub fn tree_for_id(&self, tree_id: TreeId) -> Ref<'_, Tree> {
        Ref::map(self.inner.borrow(), |inner| inner.tree_for_id(tree_id))
    }

    /// Exclusive flavour of [`Forest::tree_for_id`].
    pub fn tree_for_id_mut(&self, tree_id: TreeId) -> RefMut<'_, Tree> {
        RefMut::map(self.inner.borrow_mut(), |inner| {
            inner.tree_for_id_mut(tree_id)
        })
    }

    /// The groove named `name`, if any.
    pub fn groove(&self, name: &str) -> Option<Ref<'_, Groove>> {
        Ref::filter_map(self.inner.borrow(), |inner| {
            inner.grooves.iter().find(|groove| groove.name() == name)
        })
        .ok()
    }

    /// The forest's scan buffer pool.
    pub fn scan_buffer_pool(&self) -> RefMut<'_, ScanBufferPool> {
        RefMut::map(self.inner.borrow_mut(), |inner| &mut inner.scan_buffer_pool)
    }
}

impl ForestInner {
    fn tree_info(&self, tree_id: TreeId) -> &TreeInfo {
        assert!(
            tree_id >= self.tree_id_min && tree_id <= self.tree_id_max,
            "unknown tree id {tree_id}",
        );
        let info = &self.tree_infos[(tree_id - self.tree_id_min) as usize];
        assert_eq!(info.tree_id, tree_id);
        info
    }

    fn tree_for_id(&self, tree_id: TreeId) -> &Tree {
        let info = self.tree_info(tree_id);
        self.grooves[info.groove].tree(info.kind)
    }

    fn tree_for_id_mut(&mut self, tree_id: TreeId) -> &mut Tree {
        let (groove, kind) = {
            let info = self.tree_info(tree_id);
            (info.groove, info.kind)
        };
        self.grooves[groove].tree_mut(kind)
    }

    fn open_table_event(&mut self, table: &TableInfo) {
        assert!(
            matches!(self.progress, Some(Progress::Open { .. })),
            "manifest replay outside of open",
        );
        self.tree_for_id_mut(table.tree_id).open_table(table);
    }

    fn open_done(&mut self) -> Option<Callback> {
        self.verify_tables_recovered();
        for groove in &mut self.grooves {
            groove.open_complete();
        }
        self.verify_table_extents();

        let tables: usize = self
            .grooves
            .iter()
            .flat_map(Groove::trees)
            .map(Tree::table_count)
            .sum();
        log_info!(
            component = "forest",
            event = "forest_open_complete",
            tables,
        );
        match self.progress.take() {
            Some(Progress::Open { callback }) => Some(callback),
            _ => panic!("open completion without open in progress"),
        }
    }

    fn compact_commence(
        &mut self,
        callback: Callback,
        op: u64,
    ) -> Option<(ManifestLogRef, Callback)> {
        assert!(
            self.progress.is_none(),
            "forest lifecycle operation already in progress"
        );
        assert_eq!(self.compactions_running, 0);

        let batch_multiple = self.options.lsm_batch_multiple;
        let beat = op % batch_multiple;
        let first_beat = beat == 0;
        let last_beat = beat == batch_multiple - 1;

        if first_beat {
            assert!(self.pipeline.compactions.is_empty());
            // The first bar of ops has nothing to compact; bar_finish still
            // runs at its last beat to compensate.
            if op >= batch_multiple {
                let tree_count = self.tree_infos.len();
                for level_b in 0..self.options.lsm_levels {
                    for offset in 0..tree_count {
                        let compaction =
                            self.compactions[level_b as usize * tree_count + offset].clone();
                        let info = {
                            let registered = &self.tree_infos[offset];
                            let tree = self.grooves[registered.groove].tree(registered.kind);
                            compaction.borrow_mut().bar_setup(tree, op)
                        };
                        if let Some(info) = info {
                            self.pipeline
                                .compactions
                                .push(CompactionInterface::new(info, compaction));
                        }
                    }
                }
            }
            log_debug!(
                component = "forest",
                event = "bar_commence",
                op,
                queued = self.pipeline.compactions.len(),
            );
        }

        self.progress = Some(Progress::Compact { op, callback });
        self.compactions_running += 1;
        self.pipeline.beat(op, batch_multiple);

        // The manifest log compacts alongside the last beat of every bar
        // except the first: the first bar has no preceding bar to compact.
        if last_beat && op > batch_multiple {
            assert_eq!(self.manifest_log_progress, ManifestLogProgress::Idle);
            self.manifest_log_progress = ManifestLogProgress::Compacting;
            self.compactions_running += 1;
            self.pipeline.metrics.manifest_log_compactions += 1;
            let weak = self.weak.clone();
            let done: Callback = Box::new(move || {
                let follow_up = match weak.upgrade() {
                    Some(forest) => forest.borrow_mut().manifest_log_compact_done(),
                    None => None,
                };
                if let Some(callback) = follow_up {
                    callback();
                }
            });
            return Some((self.manifest_log.clone(), done));
        }
        None
    }

    fn manifest_log_compact_done(&mut self) -> Option<Callback> {
        assert_eq!(self.manifest_log_progress, ManifestLogProgress::Compacting);
        self.manifest_log_progress = ManifestLogProgress::Done;
        self.compact_callback()
    }

    /// Join point for the beat's sub-operations; the last one through
    /// finishes the beat.
    fn compact_callback(&mut self) -> Option<Callback> {
        assert!(self.compactions_running > 0);
        self.compactions_running -= 1;
        if self.compactions_running > 0 {
            return None;
        }

        let op = match &self.progress {
            Some(Progress::Compact { op, .. }) => *op,
            _ => panic!("compaction completion without compact in progress"),
        };
        self.pipeline.beat_end();

        let batch_multiple = self.options.lsm_batch_multiple;
        let last_beat = op % batch_multiple == batch_multiple - 1;
        if last_beat {
            let tree_count = self.tree_infos.len();
            for level_b in 0..self.options.lsm_levels {
                for offset in 0..tree_count {
                    let compaction =
                        self.compactions[level_b as usize * tree_count + offset].clone();
                    let tree_id = self.tree_infos[offset].tree_id;
                    let tree = self.tree_for_id_mut(tree_id);
                    compaction.borrow_mut().bar_finish(op, tree);
                }
            }
            self.pipeline.bar_end();
            log_debug!(component = "forest", event = "bar_complete", op);
        }

        for groove in &mut self.grooves {
            groove.compact(op);
        }

        if last_beat {
            match self.manifest_log_progress {
                ManifestLogProgress::Idle => {}
                ManifestLogProgress::Compacting => {
                    unreachable!("manifest log compaction outlived its bar")
                }
                ManifestLogProgress::Done => {
                    self.manifest_log.borrow_mut().compact_end();
                    self.manifest_log_progress = ManifestLogProgress::Idle;
                }
            }
        }

        match self.progress.take() {
            Some(Progress::Compact { callback, .. }) => Some(callback),
            _ => unreachable!(),
        }
    }

    fn checkpoint_done(&mut self) -> Option<Callback> {
        self.verify_tables_recovered();
        self.verify_table_extents();
        log_info!(component = "forest", event = "checkpoint_complete");
        match self.progress.take() {
            Some(Progress::Checkpoint { callback }) => Some(callback),
            _ => panic!("checkpoint completion without checkpoint in progress"),
        }
    }

    /// Replay the manifest log chronologically and confirm it reconstructs
    /// exactly the tables the trees recovered, table for table.
    fn verify_tables_recovered(&self) {
        let manifest_log = self.manifest_log.borrow();
        let addresses = manifest_log.log_block_addresses();
        let checksums = manifest_log.log_block_checksums();
        assert_eq!(addresses.len(), checksums.len());

        let grid = self.grid.borrow();
        let mut tables_latest: HashMap<BlockAddress, TableInfo> = HashMap::new();
        for (address, checksum) in addresses.iter().zip(checksums.iter()) {
            let block = grid
                .grid_block(*address)
                .unwrap_or_else(|| panic!("manifest log block {address} missing from the grid"));
            assert_eq!(
                manifest::block_checksum(block),
                *checksum,
                "manifest log block {address} is corrupt",
            );
            let entries = manifest::decode_block(block)
                .unwrap_or_else(|error| panic!("manifest log block {address}: {error}"));
            for table in entries {
                match table.label.event {
                    TableEvent::Insert | TableEvent::Update => {
                        tables_latest.insert(table.address, table);
                    }
                    TableEvent::Remove => {
                        let removed = tables_latest.remove(&table.address);
                        assert!(
                            removed.is_some(),
                            "manifest log removes table {} before inserting it",
                            table.address,
                        );
                    }
                }
            }
        }

        let mut recovered = 0usize;
        for groove in &self.grooves {
            for tree in groove.trees() {
                for level in 0..tree.level_count() {
                    for table in tree.tables(level) {
                        let latest = tables_latest.get(&table.address).unwrap_or_else(|| {
                            panic!(
                                "tree {} recovered table {} absent from chronological replay",
                                tree.name(),
                                table.address,
                            )
                        });
                        assert_eq!(latest, table);
                        assert_eq!(latest.label.level as usize, level);
                        recovered += 1;
                    }
                }
            }
        }
        assert_eq!(
            recovered,
            tables_latest.len(),
            "forest recovered a different table set than the chronological replay",
        );
    }

    /// Every resident table is backed by exactly one manifest extent.
    fn verify_table_extents(&self) {
        let tables: usize = self
            .grooves
            .iter()
            .flat_map(Groove::trees)
            .map(Tree::table_count)
            .sum();
        let extents = self.manifest_log.borrow().table_extents().len();
        assert_eq!(tables, extents, "table extents diverge from forest tables");
    }
}

impl PipelineHost for ForestInner {
    fn blip_complete(
        &mut self,
        slot_index: usize,
        beat_exhausted: Option<bool>,
        bar_exhausted: Option<bool>,
    ) -> Option<Callback> {
        self.pipeline
            .blip_callback(slot_index, beat_exhausted, bar_exhausted);
        // Beats always complete through the next-tick path, never from a
        // blip completion.
        None
    }

    fn beat_complete(&mut self) -> Option<Callback> {
        self.pipeline.beat_finished();
        self.compact_callback()
    }
}
