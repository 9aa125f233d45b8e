use std::sync::Arc;

use portacc_core::{AccDevProps, Idx, IdxVec, RuntimeConfig, WorkDiv};

use super::DevCpu;
use crate::backend::{Acc, AtomicProvider, BlockSyncProvider, IdxProvider, MathProvider, SharedMemProvider};
use crate::backends::common::exec::run_block_threads;
use crate::backends::common::{AtomicImpl, BlockContext, BlockSharedMem, BlockSync, Hierarchy};
use crate::error::Result;
use crate::kernel::{block_shared_bytes, TaskKernel};

/// One OS thread per block thread; blocks run one after the other.
///
/// Threads of a block share memory and synchronise on a real barrier.
pub struct AccCpuThreads<const D: usize> {
    work_div: WorkDiv<D>,
    grid_block_idx: IdxVec<D>,
    block_thread_idx: IdxVec<D>,
    block: Arc<BlockContext>,
}

impl<const D: usize> IdxProvider<D> for AccCpuThreads<D> {
    fn work_div(&self) -> &WorkDiv<D> {
        &self.work_div
    }

    fn grid_block_idx(&self) -> IdxVec<D> {
        self.grid_block_idx
    }

    fn block_thread_idx(&self) -> IdxVec<D> {
        self.block_thread_idx
    }
}

impl<const D: usize> AtomicProvider for AccCpuThreads<D> {
    fn atomic_impl(&self, level: Hierarchy) -> AtomicImpl {
        match level {
            Hierarchy::Grids | Hierarchy::Blocks => AtomicImpl::Native,
            Hierarchy::Threads => AtomicImpl::Unsync,
        }
    }
}

impl<const D: usize> SharedMemProvider for AccCpuThreads<D> {
    fn block_shared_mem(&self) -> &BlockSharedMem {
        &self.block.shared
    }
}

impl<const D: usize> BlockSyncProvider for AccCpuThreads<D> {
    fn block_sync(&self) -> &BlockSync {
        &self.block.sync
    }
}

impl<const D: usize> MathProvider for AccCpuThreads<D> {}

impl<const D: usize> Acc<D> for AccCpuThreads<D> {
    type Dev = DevCpu;

    fn acc_name() -> String {
        format!("AccCpuThreads<{D}>")
    }

    fn dev_props(_dev: &DevCpu) -> Result<AccDevProps<D>> {
        let config = RuntimeConfig::global();
        let block_threads = config.cpu_block_threads();
        Ok(AccDevProps {
            multi_processor_count: 1,
            grid_block_extent_max: IdxVec::all(Idx::MAX),
            grid_block_count_max: Idx::MAX,
            block_thread_extent_max: IdxVec::all(block_threads),
            block_thread_count_max: block_threads,
            thread_elem_extent_max: IdxVec::all(Idx::MAX),
            thread_elem_count_max: Idx::MAX,
            shared_mem_size_bytes: config.cpu_shared_mem_bytes,
        })
    }

    fn execute<F, Args>(dev: &DevCpu, task: &TaskKernel<Self, D, F, Args>) -> Result<()>
    where
        F: Fn(&Self, Args) + Send + Sync + 'static,
        Args: Clone + Send + Sync + 'static,
    {
        let props = Self::dev_props(dev)?;
        let (static_bytes, dyn_bytes) = block_shared_bytes(&props, task);
        let work_div = *task.work_div();
        let block_thread_extent = work_div.block_thread_extent();
        let block = Arc::new(BlockContext::new(block_thread_extent.prod(), static_bytes, dyn_bytes)?);
        let acc_name = Self::acc_name();

        for grid_block_idx in IdxVec::indices(work_div.grid_block_extent()) {
            block.reset();
            run_block_threads(task.kernel_name(), &acc_name, block_thread_extent, &block, |block_thread_idx| {
                let acc = AccCpuThreads {
                    work_div,
                    grid_block_idx,
                    block_thread_idx,
                    block: Arc::clone(&block),
                };
                task.invoke(&acc);
            })?;
        }
        Ok(())
    }
}
