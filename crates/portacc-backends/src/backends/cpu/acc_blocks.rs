use std::sync::Arc;

use portacc_core::{AccDevProps, IdxVec, RuntimeConfig, WorkDiv};
use rayon::prelude::*;

use super::DevCpu;
use crate::backend::{Acc, AtomicProvider, BlockSyncProvider, IdxProvider, MathProvider, SharedMemProvider};
use crate::backends::common::exec::run_guarded;
use crate::backends::common::{AtomicImpl, BlockContext, BlockSharedMem, BlockSync, Hierarchy};
use crate::error::{BackendError, Result};
use crate::kernel::{block_shared_bytes, TaskKernel};

/// One thread per block; blocks run in parallel on the rayon pool.
pub struct AccCpuBlocks<const D: usize> {
    work_div: WorkDiv<D>,
    grid_block_idx: IdxVec<D>,
    block: Arc<BlockContext>,
}

impl<const D: usize> IdxProvider<D> for AccCpuBlocks<D> {
    fn work_div(&self) -> &WorkDiv<D> {
        &self.work_div
    }

    fn grid_block_idx(&self) -> IdxVec<D> {
        self.grid_block_idx
    }

    fn block_thread_idx(&self) -> IdxVec<D> {
        IdxVec::zeros()
    }
}

impl<const D: usize> AtomicProvider for AccCpuBlocks<D> {
    fn atomic_impl(&self, level: Hierarchy) -> AtomicImpl {
        match level {
            Hierarchy::Grids => AtomicImpl::Native,
            Hierarchy::Blocks | Hierarchy::Threads => AtomicImpl::Unsync,
        }
    }
}

impl<const D: usize> SharedMemProvider for AccCpuBlocks<D> {
    fn block_shared_mem(&self) -> &BlockSharedMem {
        &self.block.shared
    }
}

impl<const D: usize> BlockSyncProvider for AccCpuBlocks<D> {
    fn block_sync(&self) -> &BlockSync {
        &self.block.sync
    }
}

impl<const D: usize> MathProvider for AccCpuBlocks<D> {}

impl<const D: usize> Acc<D> for AccCpuBlocks<D> {
    type Dev = DevCpu;

    fn acc_name() -> String {
        format!("AccCpuBlocks<{D}>")
    }

    fn dev_props(_dev: &DevCpu) -> Result<AccDevProps<D>> {
        Ok(AccDevProps::single_thread_blocks(
            rayon::current_num_threads(),
            RuntimeConfig::global().cpu_shared_mem_bytes,
        ))
    }

    fn execute<F, Args>(dev: &DevCpu, task: &TaskKernel<Self, D, F, Args>) -> Result<()>
    where
        F: Fn(&Self, Args) + Send + Sync + 'static,
        Args: Clone + Send + Sync + 'static,
    {
        let props = Self::dev_props(dev)?;
        let (static_bytes, dyn_bytes) = block_shared_bytes(&props, task);
        let work_div = *task.work_div();
        let grid_block_extent = work_div.grid_block_extent();
        let acc_name = Self::acc_name();

        // one block context per rayon worker, reused across its blocks
        (0..grid_block_extent.prod()).into_par_iter().try_for_each_init(
            || BlockContext::new(1, static_bytes, dyn_bytes).ok().map(Arc::new),
            |block, linear| {
                let block = block.as_ref().ok_or_else(|| BackendError::OutOfMemory {
                    bytes: static_bytes + dyn_bytes,
                    device: "block shared memory".to_string(),
                })?;
                block.reset();
                let acc = AccCpuBlocks {
                    work_div,
                    grid_block_idx: IdxVec::delinearize(linear, &grid_block_extent),
                    block: Arc::clone(block),
                };
                run_guarded(task.kernel_name(), &acc_name, || task.invoke(&acc))
            },
        )
    }
}
