//! Fixed arena backing the in-memory manifest levels.
//!
//! Nodes are pre-allocated at forest construction and handed out to trees as
//! their resident table counts grow. The pool is sized for the whole forest
//! up front; running out is a configuration bug, not a runtime condition, so
//! exhaustion aborts.

pub struct NodePool {
    node_size: usize,
    nodes: Vec<Box<[u8]>>,
    free: Vec<usize>,
    acquired: Vec<bool>,
}

impl NodePool {
    pub(crate) fn new(node_count: usize, node_size: usize) -> Self {
        assert!(node_count > 0);
        assert!(node_size > 0);
        Self {
            node_size,
            nodes: (0..node_count)
                .map(|_| vec![0; node_size].into_boxed_slice())
                .collect(),
            // Popped from the back, so ascending indices come out first.
            free: (0..node_count).rev().collect(),
            acquired: vec![false; node_count],
        }
    }

    pub fn node_size(&self) -> usize {
        self.node_size
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Take a node out of the pool.
    pub fn acquire(&mut self) -> usize {
        let index = self
            .free
            .pop()
            .unwrap_or_else(|| panic!("node pool of {} nodes exhausted", self.nodes.len()));
        assert!(!self.acquired[index]);
        self.acquired[index] = true;
        index
    }

    /// Return a node to the pool.
    pub fn release(&mut self, index: usize) {
        assert!(self.acquired[index], "node {index} released twice");
        self.acquired[index] = false;
        self.free.push(index);
    }

    pub fn node_mut(&mut self, index: usize) -> &mut [u8] {
        assert!(self.acquired[index], "node {index} is not acquired");
        &mut self.nodes[index]
    }
}
