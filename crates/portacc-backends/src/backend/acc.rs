//! Accelerator capability traits
//!
//! Kernel code is written against `A: Acc<D>` and only uses the capability
//! methods below, so the same closure runs unchanged on every accelerator.
//! Each accelerator is a concrete type; selecting one is a compile-time
//! choice.

use bytemuck::Pod;
use portacc_core::{AccDevProps, IdxVec, WorkDiv};

use super::traits::Device;
use crate::backends::common::{
    AtomicElem, AtomicImpl, AtomicOp, BinaryOp, BlockSharedMem, BlockSync, BlockSyncOp, Hierarchy, Real,
    SharedSlice, UnaryOp,
};
use crate::error::Result;
use crate::kernel::TaskKernel;

/// Index queries of the calling thread.
pub trait IdxProvider<const D: usize> {
    fn work_div(&self) -> &WorkDiv<D>;

    /// Index of the calling block within the grid.
    fn grid_block_idx(&self) -> IdxVec<D>;

    /// Index of the calling thread within its block.
    fn block_thread_idx(&self) -> IdxVec<D>;

    /// Index of the calling thread within the grid.
    fn grid_thread_idx(&self) -> IdxVec<D> {
        self.grid_block_idx() * self.work_div().block_thread_extent() + self.block_thread_idx()
    }

    /// First element handled by the calling thread.
    fn grid_elem_idx(&self) -> IdxVec<D> {
        self.grid_thread_idx() * self.work_div().thread_elem_extent()
    }

    fn grid_block_extent(&self) -> IdxVec<D> {
        self.work_div().grid_block_extent()
    }

    fn block_thread_extent(&self) -> IdxVec<D> {
        self.work_div().block_thread_extent()
    }

    fn thread_elem_extent(&self) -> IdxVec<D> {
        self.work_div().thread_elem_extent()
    }

    fn grid_thread_extent(&self) -> IdxVec<D> {
        self.work_div().grid_thread_extent()
    }
}

/// Atomic read-modify-write scoped to a hierarchy level.
pub trait AtomicProvider {
    /// How this accelerator implements `level`.
    fn atomic_impl(&self, level: Hierarchy) -> AtomicImpl;

    /// Apply `op` at `addr` and return the previous value.
    ///
    /// # Safety
    ///
    /// `addr` must be valid and aligned, and every thread that can reach it
    /// at `level` must access it through atomics only.
    unsafe fn atomic_op<T: AtomicElem>(&self, op: AtomicOp, level: Hierarchy, addr: *mut T, value: T) -> T {
        self.atomic_impl(level).rmw(addr, op, value)
    }

    /// Compare-and-swap; returns the previous value.
    ///
    /// # Safety
    ///
    /// Same contract as [`atomic_op`](Self::atomic_op).
    unsafe fn atomic_cas<T: AtomicElem>(&self, level: Hierarchy, addr: *mut T, compare: T, value: T) -> T {
        self.atomic_impl(level).cas(addr, compare, value)
    }
}

/// Block-shared memory.
pub trait SharedMemProvider {
    fn block_shared_mem(&self) -> &BlockSharedMem;

    /// One shared value, identified by `id` within the block.
    fn shared_var<T: Pod>(&self, id: u32) -> SharedSlice<T> {
        self.block_shared_mem().alloc_static(id, 1)
    }

    /// A shared array of `len` elements, identified by `id` within the block.
    fn shared_array<T: Pod>(&self, id: u32, len: usize) -> SharedSlice<T> {
        self.block_shared_mem().alloc_static(id, len)
    }

    /// The dynamic shared memory requested for this launch.
    fn shared_dyn<T: Pod>(&self) -> SharedSlice<T> {
        self.block_shared_mem().dyn_slice()
    }
}

/// Block-level barriers.
pub trait BlockSyncProvider {
    fn block_sync(&self) -> &BlockSync;

    /// Wait until every thread of the block arrived.
    fn sync_block_threads(&self) {
        self.block_sync().sync()
    }

    /// Barrier that also reduces one predicate per thread.
    fn sync_block_threads_predicate(&self, op: BlockSyncOp, predicate: bool) -> usize {
        self.block_sync().sync_predicate(op, predicate)
    }
}

/// Math functions.
pub trait MathProvider {
    fn math_unary<T: Real>(&self, op: UnaryOp, x: T) -> T {
        T::unary(op, x)
    }

    fn math_binary<T: Real>(&self, op: BinaryOp, x: T, y: T) -> T {
        T::binary(op, x, y)
    }

    fn sincos<T: Real>(&self, x: T) -> (T, T) {
        T::sincos(x)
    }
}

/// An accelerator: the full kernel-side capability set plus the host-side
/// entry points that run a kernel task on one device.
pub trait Acc<const D: usize>:
    IdxProvider<D> + AtomicProvider + SharedMemProvider + BlockSyncProvider + MathProvider + Sized + 'static
{
    type Dev: Device;

    /// Type name including the rank, e.g. `AccCpuSerial<2>`.
    fn acc_name() -> String;

    /// Limits of `dev` as seen by this accelerator.
    fn dev_props(dev: &Self::Dev) -> Result<AccDevProps<D>>;

    /// Run every thread of `task`'s grid to completion on the calling thread.
    ///
    /// The work division has already been validated against
    /// [`dev_props`](Self::dev_props).
    fn execute<F, Args>(dev: &Self::Dev, task: &TaskKernel<Self, D, F, Args>) -> Result<()>
    where
        F: Fn(&Self, Args) + Send + Sync + 'static,
        Args: Clone + Send + Sync + 'static;
}
