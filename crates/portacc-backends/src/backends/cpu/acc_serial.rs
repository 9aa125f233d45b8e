use std::sync::Arc;

use portacc_core::{AccDevProps, IdxVec, RuntimeConfig, WorkDiv};

use super::DevCpu;
use crate::backend::{Acc, AtomicProvider, BlockSyncProvider, IdxProvider, MathProvider, SharedMemProvider};
use crate::backends::common::exec::run_guarded;
use crate::backends::common::{AtomicImpl, BlockContext, BlockSharedMem, BlockSync, Hierarchy};
use crate::error::Result;
use crate::kernel::{block_shared_bytes, TaskKernel};

/// Runs the whole grid on the calling thread, one block after the other,
/// with a single thread per block.
pub struct AccCpuSerial<const D: usize> {
    work_div: WorkDiv<D>,
    grid_block_idx: IdxVec<D>,
    block: Arc<BlockContext>,
}

impl<const D: usize> IdxProvider<D> for AccCpuSerial<D> {
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

impl<const D: usize> AtomicProvider for AccCpuSerial<D> {
    fn atomic_impl(&self, level: Hierarchy) -> AtomicImpl {
        match level {
            // other queues may run kernels on the same memory concurrently
            Hierarchy::Grids => AtomicImpl::Native,
            Hierarchy::Blocks | Hierarchy::Threads => AtomicImpl::Unsync,
        }
    }
}

impl<const D: usize> SharedMemProvider for AccCpuSerial<D> {
    fn block_shared_mem(&self) -> &BlockSharedMem {
        &self.block.shared
    }
}

impl<const D: usize> BlockSyncProvider for AccCpuSerial<D> {
    fn block_sync(&self) -> &BlockSync {
        &self.block.sync
    }
}

impl<const D: usize> MathProvider for AccCpuSerial<D> {}

impl<const D: usize> Acc<D> for AccCpuSerial<D> {
    type Dev = DevCpu;

    fn acc_name() -> String {
        format!("AccCpuSerial<{D}>")
    }

    fn dev_props(_dev: &DevCpu) -> Result<AccDevProps<D>> {
        Ok(AccDevProps::single_thread_blocks(
            1,
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
        let block = Arc::new(BlockContext::new(1, static_bytes, dyn_bytes)?);
        let work_div = *task.work_div();

        run_guarded(task.kernel_name(), &Self::acc_name(), || {
            for grid_block_idx in IdxVec::indices(work_div.grid_block_extent()) {
                block.reset();
                let acc = AccCpuSerial {
                    work_div,
                    grid_block_idx,
                    block: Arc::clone(&block),
                };
                task.invoke(&acc);
            }
        })
    }
}
