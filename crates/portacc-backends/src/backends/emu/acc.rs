use std::sync::Arc;

use portacc_core::{AccDevProps, IdxVec, WorkDiv};

use super::DevEmu;
use crate::backend::{Acc, AtomicProvider, BlockSyncProvider, IdxProvider, MathProvider, SharedMemProvider};
use crate::backends::common::exec::run_block_threads;
use crate::backends::common::{AtomicImpl, BlockContext, BlockSharedMem, BlockSync, Hierarchy};
use crate::error::Result;
use crate::kernel::{block_shared_bytes, TaskKernel};
use crate::rt_check;

/// GPU-style accelerator on an emulated device.
///
/// Limits come from the device properties; every block thread is an OS
/// thread and every atomic is a hardware atomic.
pub struct AccGpuEmu<const D: usize> {
    work_div: WorkDiv<D>,
    grid_block_idx: IdxVec<D>,
    block_thread_idx: IdxVec<D>,
    block: Arc<BlockContext>,
}

impl<const D: usize> IdxProvider<D> for AccGpuEmu<D> {
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

impl<const D: usize> AtomicProvider for AccGpuEmu<D> {
    fn atomic_impl(&self, _level: Hierarchy) -> AtomicImpl {
        AtomicImpl::Native
    }
}

impl<const D: usize> SharedMemProvider for AccGpuEmu<D> {
    fn block_shared_mem(&self) -> &BlockSharedMem {
        &self.block.shared
    }
}

impl<const D: usize> BlockSyncProvider for AccGpuEmu<D> {
    fn block_sync(&self) -> &BlockSync {
        &self.block.sync
    }
}

impl<const D: usize> MathProvider for AccGpuEmu<D> {}

impl<const D: usize> Acc<D> for AccGpuEmu<D> {
    type Dev = DevEmu;

    fn acc_name() -> String {
        format!("AccGpuEmu<{D}>")
    }

    fn dev_props(dev: &DevEmu) -> Result<AccDevProps<D>> {
        let props = rt_check!("emu", "device_props", dev.runtime().device_props(dev.id()))?;
        let [gx, gy, gz] = props.max_grid_size;
        let [bx, by, bz] = props.max_threads_dim;
        Ok(AccDevProps::from_hw3(
            props.multi_processor_count,
            IdxVec::new([gz, gy, gx]),
            IdxVec::new([bz, by, bx]),
            props.max_threads_per_block,
            props.shared_mem_per_block,
        ))
    }

    fn execute<F, Args>(dev: &DevEmu, task: &TaskKernel<Self, D, F, Args>) -> Result<()>
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
                task.invoke(&AccGpuEmu {
                    work_div,
                    grid_block_idx,
                    block_thread_idx,
                    block: Arc::clone(&block),
                });
            })?;
        }
        Ok(())
    }
}
