//! Trees and the forest-wide tree registry.
//!
//! Every groove decomposes into trees: the object tree, an optional id tree,
//! and one tree per secondary index. Each tree has a globally unique id in
//! `[1, 2^16)`; the set of ids across the whole forest is contiguous, which
//! lets the forest reach any tree from a raw id in constant time during
//! manifest replay. Both invariants are enforced when the registry is built.

use std::{cell::RefCell, rc::Rc};

use crate::{
    error::ForestError,
    groove::GrooveOptions,
    manifest::{TableInfo, MANIFEST_ENTRY_SIZE},
    node_pool::NodePool,
};

/// Globally unique tree identifier.
pub type TreeId = u16;

/// Which of a groove's trees an id names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    Objects,
    Ids,
    /// A secondary index, by position within the groove's index list.
    Index(usize),
}

/// Registry entry for one tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeInfo {
    pub tree_id: TreeId,
    pub tree_name: String,
    /// Index of the owning groove within the forest.
    pub groove: usize,
    pub kind: TreeKind,
}

/// In-memory manifest of one tree: its resident tables, per level.
///
/// Table contents and queries live outside this crate; a tree here is the
/// level-structured table metadata that manifest replay populates and the
/// recovery verifications inspect. Manifest level storage is accounted
/// against the forest's node pool.
pub struct Tree {
    tree_id: TreeId,
    name: String,
    levels: Vec<Vec<TableInfo>>,
    node_pool: Rc<RefCell<NodePool>>,
    nodes: Vec<usize>,
    tables_per_node: usize,
    compacted_op: Option<u64>,
}

impl Tree {
    pub(crate) fn new(
        tree_id: TreeId,
        name: String,
        lsm_levels: u8,
        node_pool: Rc<RefCell<NodePool>>,
    ) -> Self {
        let tables_per_node = node_pool.borrow().node_size() / MANIFEST_ENTRY_SIZE;
        assert!(tables_per_node > 0);
        Self {
            tree_id,
            name,
            levels: (0..lsm_levels).map(|_| Vec::new()).collect(),
            node_pool,
            nodes: Vec::new(),
            tables_per_node,
            compacted_op: None,
        }
    }

    pub fn tree_id(&self) -> TreeId {
        self.tree_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Tables resident in `level`, ascending by `key_min`.
    pub fn tables(&self, level: usize) -> &[TableInfo] {
        &self.levels[level]
    }

    /// Total resident tables across all levels.
    pub fn table_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Nodes currently held from the forest's node pool.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Admit a table replayed from the manifest log.
    pub(crate) fn open_table(&mut self, table: &TableInfo) {
        assert_eq!(table.tree_id, self.tree_id);
        let level = table.label.level as usize;
        assert!(
            level < self.levels.len(),
            "tree {}: table level {level} out of range",
            self.name,
        );
        let tables = &mut self.levels[level];
        let at = tables.partition_point(|resident| resident.key_min <= table.key_min);
        tables.insert(at, *table);
        self.reserve_nodes();
    }

    fn reserve_nodes(&mut self) {
        let needed = self.table_count().div_ceil(self.tables_per_node);
        while self.nodes.len() < needed {
            let node = self.node_pool.borrow_mut().acquire();
            self.nodes.push(node);
        }
    }

    /// Per-beat maintenance, run synchronously after the pipeline's beat.
    pub(crate) fn compact(&mut self, op: u64) {
        if let Some(previous) = self.compacted_op {
            assert!(op > previous, "tree {}: op regressed", self.name);
        }
        self.compacted_op = Some(op);
    }

    pub(crate) fn assert_between_bars(&self, batch_multiple: u64) {
        if let Some(op) = self.compacted_op {
            assert_eq!(
                (op + 1) % batch_multiple,
                0,
                "tree {} is mid-bar at op {op}",
                self.name,
            );
        }
    }

    pub(crate) fn reset(&mut self) {
        for level in &mut self.levels {
            level.clear();
        }
        let mut pool = self.node_pool.borrow_mut();
        for node in self.nodes.drain(..) {
            pool.release(node);
        }
        self.compacted_op = None;
    }
}

impl Drop for Tree {
    fn drop(&mut self) {
        let mut pool = self.node_pool.borrow_mut();
        for node in self.nodes.drain(..) {
            pool.release(node);
        }
    }
}

/// Build the dense tree registry from groove descriptors.
///
/// The result is indexed by `tree_id - tree_id_min`; uniqueness and
/// contiguity violations surface as construction errors.
pub(crate) fn build_tree_infos(grooves: &[GrooveOptions]) -> Result<Vec<TreeInfo>, ForestError> {
    let mut raw = Vec::new();
    for (groove_index, groove) in grooves.iter().enumerate() {
        raw.push(TreeInfo {
            tree_id: groove.objects_tree_id,
            tree_name: format!("{}.objects", groove.name),
            groove: groove_index,
            kind: TreeKind::Objects,
        });
        if let Some(tree_id) = groove.ids_tree_id {
            raw.push(TreeInfo {
                tree_id,
                tree_name: format!("{}.ids", groove.name),
                groove: groove_index,
                kind: TreeKind::Ids,
            });
        }
        for (position, index) in groove.indexes.iter().enumerate() {
            raw.push(TreeInfo {
                tree_id: index.tree_id,
                tree_name: format!("{}.{}", groove.name, index.name),
                groove: groove_index,
                kind: TreeKind::Index(position),
            });
        }
    }
    assert!(!raw.is_empty());

    if raw.iter().any(|info| info.tree_id == 0) {
        return Err(ForestError::ReservedTreeId);
    }
    let tree_id_min = raw.iter().map(|info| info.tree_id).min().unwrap();
    let tree_id_max = raw.iter().map(|info| info.tree_id).max().unwrap();
    let span = (tree_id_max - tree_id_min) as usize + 1;

    let mut dense: Vec<Option<TreeInfo>> = vec![None; span];
    for info in raw {
        let slot = &mut dense[(info.tree_id - tree_id_min) as usize];
        if slot.is_some() {
            return Err(ForestError::DuplicateTreeId(info.tree_id));
        }
        *slot = Some(info);
    }
    dense
        .into_iter()
        .enumerate()
        .map(|(offset, slot)| {
            slot.ok_or(ForestError::MissingTreeId(tree_id_min + offset as TreeId))
        })
        .collect()
}
