//! Grooves: named, typed object collections.
//!
//! A groove bundles the trees that store one object type: the object tree
//! itself, an optional id tree mapping ids to timestamps, and a fixed set of
//! named secondary-index trees. Grooves are described by [`GrooveOptions`]
//! values and materialised by the forest at construction; the descriptor
//! form is what a comptime-generated groove becomes in a runtime registry.

use std::{cell::RefCell, rc::Rc};

use crate::{
    node_pool::NodePool,
    tree::{Tree, TreeId, TreeKind},
};

/// Descriptor for one secondary index of a groove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexOptions {
    pub name: String,
    pub tree_id: TreeId,
}

/// Descriptor for one groove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrooveOptions {
    pub name: String,
    pub objects_tree_id: TreeId,
    pub ids_tree_id: Option<TreeId>,
    pub indexes: Vec<IndexOptions>,
}

impl GrooveOptions {
    pub fn new(name: impl Into<String>, objects_tree_id: TreeId) -> Self {
        Self {
            name: name.into(),
            objects_tree_id,
            ids_tree_id: None,
            indexes: Vec::new(),
        }
    }

    /// Give the groove an id tree.
    pub fn ids(mut self, tree_id: TreeId) -> Self {
        self.ids_tree_id = Some(tree_id);
        self
    }

    /// Add a named secondary index.
    pub fn index(mut self, name: impl Into<String>, tree_id: TreeId) -> Self {
        self.indexes.push(IndexOptions {
            name: name.into(),
            tree_id,
        });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GrooveState {
    Closed,
    Opening,
    Open,
}

/// A materialised groove: the object tree, the optional id tree, and the
/// secondary-index trees, in descriptor order.
pub struct Groove {
    name: String,
    state: GrooveState,
    objects: Tree,
    ids: Option<Tree>,
    indexes: Vec<Tree>,
}

impl Groove {
    pub(crate) fn new(
        options: &GrooveOptions,
        lsm_levels: u8,
        node_pool: &Rc<RefCell<NodePool>>,
    ) -> Self {
        let objects = Tree::new(
            options.objects_tree_id,
            format!("{}.objects", options.name),
            lsm_levels,
            node_pool.clone(),
        );
        let ids = options.ids_tree_id.map(|tree_id| {
            Tree::new(
                tree_id,
                format!("{}.ids", options.name),
                lsm_levels,
                node_pool.clone(),
            )
        });
        let indexes = options
            .indexes
            .iter()
            .map(|index| {
                Tree::new(
                    index.tree_id,
                    format!("{}.{}", options.name, index.name),
                    lsm_levels,
                    node_pool.clone(),
                )
            })
            .collect();
        Self {
            name: options.name.clone(),
            state: GrooveState::Closed,
            objects,
            ids,
            indexes,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn objects(&self) -> &Tree {
        &self.objects
    }

    pub fn ids(&self) -> Option<&Tree> {
        self.ids.as_ref()
    }

    /// Look up a secondary-index tree by name.
    pub fn index(&self, name: &str) -> Option<&Tree> {
        let tree_name = format!("{}.{}", self.name, name);
        self.indexes.iter().find(|tree| tree.name() == tree_name)
    }

    pub(crate) fn tree(&self, kind: TreeKind) -> &Tree {
        match kind {
            TreeKind::Objects => &self.objects,
            TreeKind::Ids => self.ids.as_ref().expect("groove has no id tree"),
            TreeKind::Index(position) => &self.indexes[position],
        }
    }

    pub(crate) fn tree_mut(&mut self, kind: TreeKind) -> &mut Tree {
        match kind {
            TreeKind::Objects => &mut self.objects,
            TreeKind::Ids => self.ids.as_mut().expect("groove has no id tree"),
            TreeKind::Index(position) => &mut self.indexes[position],
        }
    }

    pub(crate) fn trees(&self) -> impl Iterator<Item = &Tree> {
        std::iter::once(&self.objects)
            .chain(self.ids.as_ref())
            .chain(self.indexes.iter())
    }

    fn trees_mut(&mut self) -> impl Iterator<Item = &mut Tree> {
        std::iter::once(&mut self.objects)
            .chain(self.ids.as_mut())
            .chain(self.indexes.iter_mut())
    }

    /// Begin manifest replay into this groove's trees.
    pub(crate) fn open_commence(&mut self) {
        assert_eq!(self.state, GrooveState::Closed, "groove {} reopened", self.name);
        for tree in self.trees() {
            assert_eq!(tree.table_count(), 0);
        }
        self.state = GrooveState::Opening;
    }

    pub(crate) fn open_complete(&mut self) {
        assert_eq!(self.state, GrooveState::Opening);
        self.state = GrooveState::Open;
    }

    /// Synchronous per-beat maintenance, after the pipeline's beat completes.
    pub(crate) fn compact(&mut self, op: u64) {
        assert_eq!(self.state, GrooveState::Open);
        for tree in self.trees_mut() {
            tree.compact(op);
        }
    }

    pub(crate) fn assert_between_bars(&self, batch_multiple: u64) {
        for tree in self.trees() {
            tree.assert_between_bars(batch_multiple);
        }
    }

    pub(crate) fn reset(&mut self) {
        self.state = GrooveState::Closed;
        for tree in self.trees_mut() {
            tree.reset();
        }
    }
}
