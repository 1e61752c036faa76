//! Block-addressed storage interface.
//!
//! The grid is the unit-of-I/O boundary of the engine: fixed-size blocks,
//! addressed by a 64-bit address, read and written asynchronously. The forest
//! never owns a grid; one is supplied at construction and shared with the
//! pipeline.
//!
//! ## Completion discipline
//!
//! The engine is single-threaded and cooperative. Every completion callback
//! registered through this trait (including [`Grid::on_next_tick`]) must be
//! invoked from the event loop on a later tick, never synchronously from
//! within the registering call. Implementations that complete synchronously
//! will deadlock the forest.

use std::{cell::RefCell, rc::Rc};

/// Address of a block on the grid.
pub type BlockAddress = u64;

/// Deferred continuation used throughout the forest's callback surface.
pub type Callback = Box<dyn FnOnce()>;

/// An asynchronous block read.
///
/// `block` names the destination buffer in the pipeline's block pool.
pub struct GridRead {
    pub address: BlockAddress,
    pub block: usize,
    pub completion: Callback,
}

/// An asynchronous block write.
///
/// `block` names the source buffer in the pipeline's block pool.
pub struct GridWrite {
    pub address: BlockAddress,
    pub block: usize,
    pub completion: Callback,
}

/// Block-addressed storage, supplied by the surrounding replica.
pub trait Grid {
    /// Read a block; the completion fires on a later tick.
    fn read(&mut self, read: GridRead);

    /// Write a block; the completion fires on a later tick.
    fn write(&mut self, write: GridWrite);

    /// Run `callback` on the next tick of the event loop.
    fn on_next_tick(&mut self, callback: Callback);

    /// Abort unless the grid is idle apart from block repair traffic.
    fn assert_only_repairing(&self);

    /// Direct view of a block already durable on the grid, if present.
    ///
    /// Used by recovery verification to re-read manifest log blocks without
    /// scheduling asynchronous I/O.
    fn grid_block(&self, address: BlockAddress) -> Option<&[u8]>;
}

/// Shared handle to the externally owned grid.
pub type GridRef = Rc<RefCell<dyn Grid>>;
