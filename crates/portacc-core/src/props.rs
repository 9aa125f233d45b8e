//! Accelerator device properties.

use std::fmt;

use crate::vec::{Idx, IdxVec};

/// Hardware limits of one device as seen by one accelerator type.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AccDevProps<const D: usize> {
    /// Number of independent block schedulers.
    pub multi_processor_count: Idx,
    pub grid_block_extent_max: IdxVec<D>,
    pub grid_block_count_max: Idx,
    pub block_thread_extent_max: IdxVec<D>,
    pub block_thread_count_max: Idx,
    pub thread_elem_extent_max: IdxVec<D>,
    pub thread_elem_count_max: Idx,
    /// Static plus dynamic block-shared memory available to one block.
    pub shared_mem_size_bytes: usize,
}

impl<const D: usize> AccDevProps<D> {
    /// Properties of an accelerator running one thread per block.
    pub fn single_thread_blocks(multi_processor_count: Idx, shared_mem_size_bytes: usize) -> Self {
        Self {
            multi_processor_count,
            grid_block_extent_max: IdxVec::all(Idx::MAX),
            grid_block_count_max: Idx::MAX,
            block_thread_extent_max: IdxVec::ones(),
            block_thread_count_max: 1,
            thread_elem_extent_max: IdxVec::all(Idx::MAX),
            thread_elem_count_max: Idx::MAX,
            shared_mem_size_bytes,
        }
    }

    /// Adapt three-axis hardware limits (given slowest axis first, i.e.
    /// `[z, y, x]`) to rank `D`.
    ///
    /// Ranks above three get a limit of 1 on the extra slow axes.
    pub fn from_hw3(
        multi_processor_count: Idx,
        grid_block_extent_max: IdxVec<3>,
        block_thread_extent_max: IdxVec<3>,
        block_thread_count_max: Idx,
        shared_mem_size_bytes: usize,
    ) -> Self {
        let grid_block_extent_max = grid_block_extent_max.vec_end::<D>(1);
        Self {
            multi_processor_count,
            grid_block_count_max: grid_block_extent_max.checked_prod().unwrap_or(Idx::MAX),
            grid_block_extent_max,
            block_thread_extent_max: block_thread_extent_max.vec_end::<D>(1),
            block_thread_count_max,
            thread_elem_extent_max: IdxVec::all(Idx::MAX),
            thread_elem_count_max: Idx::MAX,
            shared_mem_size_bytes,
        }
    }
}

impl<const D: usize> fmt::Debug for AccDevProps<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccDevProps")
            .field("multi_processor_count", &self.multi_processor_count)
            .field("grid_block_extent_max", &self.grid_block_extent_max)
            .field("grid_block_count_max", &self.grid_block_count_max)
            .field("block_thread_extent_max", &self.block_thread_extent_max)
            .field("block_thread_count_max", &self.block_thread_count_max)
            .field("thread_elem_extent_max", &self.thread_elem_extent_max)
            .field("thread_elem_count_max", &self.thread_elem_count_max)
            .field("shared_mem_size_bytes", &self.shared_mem_size_bytes)
            .finish()
    }
}
