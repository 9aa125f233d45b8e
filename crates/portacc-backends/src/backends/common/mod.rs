//! Common backend infrastructure
//!
//! Shared by the CPU accelerators and the emulated GPU:
//!
//! - `atomic` - hierarchical atomics behind one generic entry point
//! - `math` - kernel math behind one generic entry point per arity
//! - `block` - block-shared memory, block barriers and predicate barriers
//! - `exec` - panic capture and one-OS-thread-per-block-thread execution
//! - `worker` - FIFO worker thread used by asynchronous queues
//! - `host_mem` - aligned host allocations and host copy/set engines

pub mod atomic;
pub mod block;
pub(crate) mod exec;
pub(crate) mod host_mem;
pub mod math;
pub(crate) mod worker;

pub use atomic::{AtomicElem, AtomicImpl, AtomicOp, Hierarchy};
pub use block::{BarrierPoisoned, BlockBarrier, BlockContext, BlockSharedMem, BlockSync, BlockSyncOp, SharedSlice};
pub use math::{BinaryOp, Real, UnaryOp};
