//! Shared harness for forest integration tests.
//!
//! The engine is single-threaded and callback-driven, so the harness plays
//! the surrounding replica: a [`SimGrid`] queues every completion and a
//! driver loop delivers them tick by tick, a [`SimManifestLog`] replays
//! scripted manifest blocks, and [`StubCompaction`] state machines consume
//! scripted per-bar budgets while recording everything the pipeline does to
//! them.

#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    ops::Range,
    rc::Rc,
};

use rand::{rngs::StdRng, Rng, SeedableRng};

use canopy::{
    compaction::{BlipCallback, Compaction, CompactionBlocks, CompactionInfo, CompactionRef},
    grid::{BlockAddress, Callback, Grid, GridRead, GridRef, GridWrite},
    manifest::{
        block_checksum, Label, ManifestBlockBuilder, ManifestLog, ManifestLogRef, TableEvent,
        TableEventFn, TableExtent, TableInfo,
    },
    tree::{Tree, TreeId, TreeInfo},
    Forest, ForestOptions, GrooveOptions,
};

/// Block size shared by the forest options and the manifest block builder in
/// every test.
pub const TEST_BLOCK_SIZE: usize = 512;

/// Deterministic in-memory grid: completions queue up and a driver delivers
/// them.
pub struct SimGrid {
    queue: VecDeque<Callback>,
    storage: HashMap<BlockAddress, Vec<u8>>,
    pub reads: u64,
    pub writes: u64,
    pub next_ticks: u64,
}

impl SimGrid {
    pub fn new() -> Rc<RefCell<SimGrid>> {
        Rc::new(RefCell::new(SimGrid {
            queue: VecDeque::new(),
            storage: HashMap::new(),
            reads: 0,
            writes: 0,
            next_ticks: 0,
        }))
    }

    /// Make a block durable so `grid_block` can see it.
    pub fn install_block(&mut self, address: BlockAddress, block: Vec<u8>) {
        self.storage.insert(address, block);
    }

    /// Defer an arbitrary completion onto the grid's queue.
    pub fn enqueue(&mut self, callback: Callback) {
        self.queue.push_back(callback);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl Grid for SimGrid {
    fn read(&mut self, read: GridRead) {
        self.reads += 1;
        self.queue.push_back(read.completion);
    }

    fn write(&mut self, write: GridWrite) {
        self.writes += 1;
        self.queue.push_back(write.completion);
    }

    fn on_next_tick(&mut self, callback: Callback) {
        self.next_ticks += 1;
        self.queue.push_back(callback);
    }

    fn assert_only_repairing(&self) {}

    fn grid_block(&self, address: BlockAddress) -> Option<&[u8]> {
        self.storage.get(&address).map(Vec::as_slice)
    }
}

/// Deliver queued completions in FIFO order until the grid goes quiet.
pub fn run_until_idle(grid: &Rc<RefCell<SimGrid>>) {
    loop {
        let next = grid.borrow_mut().queue.pop_front();
        match next {
            Some(callback) => callback(),
            None => break,
        }
    }
}

/// Deliver queued completions in a seed-determined order. Completions of one
/// scheduling round are independent, so any interleaving must converge to
/// the same outcome.
pub fn run_shuffled(grid: &Rc<RefCell<SimGrid>>, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    loop {
        let next = {
            let mut grid = grid.borrow_mut();
            if grid.queue.is_empty() {
                break;
            }
            let at = rng.gen_range(0..grid.queue.len());
            grid.queue.remove(at)
        };
        if let Some(callback) = next {
            callback();
        }
    }
}

/// Everything the pipeline did to the stub compactions, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    BarSetup(TreeId, u8),
    Acquire(TreeId, u8),
    Assign(TreeId, u8),
    Read(TreeId, u8),
    Merge(TreeId, u8),
    Write(TreeId, u8),
    Forfeit(TreeId, u8),
    BarFinish(TreeId, u8),
}

pub type EventLog = Rc<RefCell<Vec<Event>>>;

/// Work a stub compaction declares for one bar.
#[derive(Debug, Clone, Copy)]
pub struct BarScript {
    /// Merge rounds available over the whole bar; zero means no work.
    pub rounds_total: u32,
    /// Merge rounds before the beat's budget runs out.
    pub rounds_per_beat: u32,
}

impl BarScript {
    pub fn idle() -> Self {
        BarScript {
            rounds_total: 0,
            rounds_per_beat: 0,
        }
    }

    pub fn work(rounds_total: u32, rounds_per_beat: u32) -> Self {
        assert!(rounds_per_beat > 0);
        BarScript {
            rounds_total,
            rounds_per_beat,
        }
    }
}

/// Scripted per-(tree, level) compaction state machine.
///
/// Reads and writes round-trip through the grid as real block I/O would;
/// merges defer through `on_next_tick` and report exhaustion from the
/// script: the beat exhausts after `rounds_per_beat` merges, the bar once
/// `rounds_total` is consumed.
pub struct StubCompaction {
    tree_id: TreeId,
    level_b: u8,
    grid: Rc<RefCell<SimGrid>>,
    log: EventLog,
    bars: VecDeque<BarScript>,

    rounds_remaining: u32,
    rounds_per_beat: u32,
    beat_rounds: u32,
    acquired: bool,

    pub acquires: u32,
    pub forfeits: u32,
    pub bar_setups: u32,
    pub bar_finishes: u32,
    pub budget_beats: Vec<u64>,
    pub scratch: Vec<[Range<usize>; 2]>,
    pub assigns: Vec<(CompactionBlocks, Range<usize>, Range<usize>)>,
    pub reads: u32,
    pub merges: u32,
    pub writes: u32,
}

impl StubCompaction {
    pub fn new(
        tree_id: TreeId,
        level_b: u8,
        grid: Rc<RefCell<SimGrid>>,
        log: EventLog,
        bars: Vec<BarScript>,
    ) -> Self {
        Self {
            tree_id,
            level_b,
            grid,
            log,
            bars: bars.into(),
            rounds_remaining: 0,
            rounds_per_beat: 0,
            beat_rounds: 0,
            acquired: false,
            acquires: 0,
            forfeits: 0,
            bar_setups: 0,
            bar_finishes: 0,
            budget_beats: Vec::new(),
            scratch: Vec::new(),
            assigns: Vec::new(),
            reads: 0,
            merges: 0,
            writes: 0,
        }
    }

    fn record(&self, event: Event) {
        self.log.borrow_mut().push(event);
    }
}

impl Compaction for StubCompaction {
    fn bar_setup(&mut self, _tree: &Tree, _op: u64) -> Option<CompactionInfo> {
        self.bar_setups += 1;
        assert_eq!(self.rounds_remaining, 0, "previous bar left work behind");
        let script = self.bars.pop_front().unwrap_or_else(BarScript::idle);
        if script.rounds_total == 0 {
            return None;
        }
        self.rounds_remaining = script.rounds_total;
        self.rounds_per_beat = script.rounds_per_beat;
        self.record(Event::BarSetup(self.tree_id, self.level_b));
        Some(CompactionInfo {
            tree_id: self.tree_id,
            level_b: self.level_b,
            table_count: script.rounds_total as usize,
        })
    }

    fn bar_setup_budget(&mut self, beats_per_bar: u64, scratch: [Range<usize>; 2]) {
        self.budget_beats.push(beats_per_bar);
        self.scratch.push(scratch);
    }

    fn bar_finish(&mut self, _op: u64, _tree: &mut Tree) {
        self.bar_finishes += 1;
        self.record(Event::BarFinish(self.tree_id, self.level_b));
    }

    fn beat_grid_acquire(&mut self) {
        assert!(!self.acquired, "acquire without forfeit");
        self.acquired = true;
        self.acquires += 1;
        self.beat_rounds = 0;
        self.record(Event::Acquire(self.tree_id, self.level_b));
    }

    fn beat_grid_forfeit(&mut self) {
        assert!(self.acquired, "forfeit without acquire");
        self.acquired = false;
        self.forfeits += 1;
        self.record(Event::Forfeit(self.tree_id, self.level_b));
    }

    fn beat_blocks_assign(
        &mut self,
        blocks: CompactionBlocks,
        reads: Range<usize>,
        writes: Range<usize>,
    ) {
        self.record(Event::Assign(self.tree_id, self.level_b));
        self.assigns.push((blocks, reads, writes));
    }

    fn blip_read(&mut self, callback: BlipCallback) {
        self.reads += 1;
        self.record(Event::Read(self.tree_id, self.level_b));
        self.grid.borrow_mut().read(GridRead {
            address: 0,
            block: 0,
            completion: Box::new(move || callback.complete(None, None)),
        });
    }

    fn blip_merge(&mut self, callback: BlipCallback) {
        self.merges += 1;
        assert!(self.rounds_remaining > 0, "merge scheduled without work");
        self.rounds_remaining -= 1;
        self.beat_rounds += 1;
        let bar_exhausted = self.rounds_remaining == 0;
        let beat_exhausted = bar_exhausted || self.beat_rounds >= self.rounds_per_beat;
        self.record(Event::Merge(self.tree_id, self.level_b));
        self.grid.borrow_mut().on_next_tick(Box::new(move || {
            callback.complete(Some(beat_exhausted), Some(bar_exhausted));
        }));
    }

    fn blip_write(&mut self, callback: BlipCallback) {
        self.writes += 1;
        self.record(Event::Write(self.tree_id, self.level_b));
        self.grid.borrow_mut().write(GridWrite {
            address: 0,
            block: 0,
            completion: Box::new(move || callback.complete(None, None)),
        });
    }

    fn reset(&mut self) {
        self.rounds_remaining = 0;
        self.rounds_per_beat = 0;
        self.beat_rounds = 0;
        self.acquired = false;
    }
}

/// Scripted manifest log, writing real blocks through the codec so the
/// forest's chronological verification re-reads them from the grid.
pub struct SimManifestLog {
    grid: Rc<RefCell<SimGrid>>,
    live: HashMap<BlockAddress, TableInfo>,
    extents: HashMap<BlockAddress, TableExtent>,
    block_addresses: Vec<BlockAddress>,
    block_checksums: Vec<u64>,

    /// Tables delivered on open beyond the live set, for verification
    /// failure tests.
    pub extra_open_tables: Vec<TableInfo>,
    /// When set, compaction completions wait for `deliver_compact_done`.
    pub manual_compact: bool,
    pending_compact: Option<Callback>,

    pub compacts: Vec<u64>,
    pub compact_ends: u32,
    pub checkpoints: u32,
}

impl SimManifestLog {
    pub fn new(grid: Rc<RefCell<SimGrid>>) -> Rc<RefCell<SimManifestLog>> {
        Rc::new(RefCell::new(SimManifestLog {
            grid,
            live: HashMap::new(),
            extents: HashMap::new(),
            block_addresses: Vec::new(),
            block_checksums: Vec::new(),
            extra_open_tables: Vec::new(),
            manual_compact: false,
            pending_compact: None,
            compacts: Vec::new(),
            compact_ends: 0,
            checkpoints: 0,
        }))
    }

    /// Append one manifest log block holding `entries`, chronologically
    /// after everything appended before it.
    pub fn append_block(&mut self, block_address: BlockAddress, entries: &[TableInfo]) {
        let mut builder = ManifestBlockBuilder::new(TEST_BLOCK_SIZE);
        for table in entries {
            builder.push(table);
        }
        let block = builder.build();
        self.block_checksums.push(block_checksum(&block));
        self.block_addresses.push(block_address);
        self.grid.borrow_mut().install_block(block_address, block);

        for (entry, table) in entries.iter().enumerate() {
            match table.label.event {
                TableEvent::Insert | TableEvent::Update => {
                    self.live.insert(table.address, *table);
                    self.extents.insert(
                        table.address,
                        TableExtent {
                            block: block_address,
                            entry,
                        },
                    );
                }
                TableEvent::Remove => {
                    self.live.remove(&table.address);
                    self.extents.remove(&table.address);
                }
            }
        }
    }

    /// Release a manually held compaction completion.
    pub fn deliver_compact_done(&mut self) {
        let done = self
            .pending_compact
            .take()
            .expect("no compaction completion pending");
        self.grid.borrow_mut().enqueue(done);
    }
}

impl ManifestLog for SimManifestLog {
    fn open(&mut self, mut event: TableEventFn, done: Callback) {
        let mut tables: Vec<TableInfo> = self.live.values().copied().collect();
        tables.sort_by_key(|table| table.address);
        tables.extend(self.extra_open_tables.iter().copied());
        self.grid.borrow_mut().enqueue(Box::new(move || {
            for table in &tables {
                event(table);
            }
            done();
        }));
    }

    fn compact(&mut self, done: Callback, op: u64) {
        self.compacts.push(op);
        if self.manual_compact {
            assert!(self.pending_compact.is_none());
            self.pending_compact = Some(done);
        } else {
            self.grid.borrow_mut().enqueue(done);
        }
    }

    fn compact_end(&mut self) {
        self.compact_ends += 1;
    }

    fn checkpoint(&mut self, done: Callback) {
        self.checkpoints += 1;
        self.grid.borrow_mut().enqueue(done);
    }

    fn table_extents(&self) -> &HashMap<BlockAddress, TableExtent> {
        &self.extents
    }

    fn log_block_addresses(&self) -> Vec<BlockAddress> {
        self.block_addresses.clone()
    }

    fn log_block_checksums(&self) -> Vec<u64> {
        self.block_checksums.clone()
    }
}

/// A forest wired to simulated collaborators and scripted compactions.
pub struct Harness {
    pub grid: Rc<RefCell<SimGrid>>,
    pub manifest: Rc<RefCell<SimManifestLog>>,
    pub forest: Forest,
    pub stubs: HashMap<(TreeId, u8), Rc<RefCell<StubCompaction>>>,
    pub log: EventLog,
}

impl Harness {
    pub fn new(
        options: ForestOptions,
        grooves: &[GrooveOptions],
        scripts: impl Fn(TreeId, u8) -> Vec<BarScript>,
    ) -> Harness {
        let options = options.block_size(TEST_BLOCK_SIZE);
        let grid = SimGrid::new();
        let manifest = SimManifestLog::new(grid.clone());
        let log: EventLog = Rc::new(RefCell::new(Vec::new()));

        let mut stubs = HashMap::new();
        let forest = {
            let mut factory = |info: &TreeInfo, level_b: u8| -> CompactionRef {
                let stub = Rc::new(RefCell::new(StubCompaction::new(
                    info.tree_id,
                    level_b,
                    grid.clone(),
                    log.clone(),
                    scripts(info.tree_id, level_b),
                )));
                stubs.insert((info.tree_id, level_b), stub.clone());
                let compaction: CompactionRef = stub;
                compaction
            };
            let grid_ref: GridRef = grid.clone();
            let manifest_ref: ManifestLogRef = manifest.clone();
            Forest::new(grid_ref, manifest_ref, options, grooves, &mut factory)
                .expect("harness forest construction")
        };

        Harness {
            grid,
            manifest,
            forest,
            stubs,
            log,
        }
    }

    pub fn stub(&self, tree_id: TreeId, level_b: u8) -> Rc<RefCell<StubCompaction>> {
        self.stubs[&(tree_id, level_b)].clone()
    }

    /// Open the forest and drive it to completion.
    pub fn open(&self) {
        let fired = Rc::new(Cell::new(0u32));
        let observer = fired.clone();
        self.forest.open(move || observer.set(observer.get() + 1));
        run_until_idle(&self.grid);
        assert_eq!(fired.get(), 1, "open callback fired once");
    }

    /// Run one compact beat to completion.
    pub fn compact(&self, op: u64) {
        let fired = Rc::new(Cell::new(0u32));
        let observer = fired.clone();
        self.forest
            .compact(move || observer.set(observer.get() + 1), op);
        run_until_idle(&self.grid);
        assert_eq!(fired.get(), 1, "compact callback fired once for op {op}");
    }

    /// Run a whole bar of beats, starting at `bar * lsm_batch_multiple`.
    pub fn compact_bar(&self, bar: u64, batch_multiple: u64) {
        for beat in 0..batch_multiple {
            self.compact(bar * batch_multiple + beat);
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.log.borrow().clone()
    }

    pub fn clear_events(&self) {
        self.log.borrow_mut().clear();
    }
}

/// Shorthand for a manifest table entry.
pub fn table(
    tree_id: TreeId,
    level: u8,
    event: TableEvent,
    address: BlockAddress,
    key_min: u128,
) -> TableInfo {
    TableInfo {
        checksum: u128::from(address) * 31,
        address,
        snapshot_min: 1,
        snapshot_max: u64::MAX,
        key_min,
        key_max: key_min + 9,
        tree_id,
        label: Label { level, event },
    }
}
