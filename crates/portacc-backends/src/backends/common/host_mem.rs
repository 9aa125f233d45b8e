//! Aligned host allocations and the host copy/set engines.
//!
//! Both engines walk a pitched region as a set of contiguous chunks: the
//! longest run of fastest-varying axes whose rows follow each other without
//! a pitch gap is handled with one `copy`/`fill`, and the remaining slower
//! axes are iterated. A region that covers whole rows of a dense buffer is
//! one chunk; a region inside padded rows degrades to one chunk per row.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use portacc_core::{Idx, IdxVec};

use crate::mem::{TaskCopy, TaskSet};

/// Zero-initialised, aligned heap block.
pub(crate) struct HostAlloc {
    ptr: NonNull<u8>,
    layout: Layout,
    len: usize,
}

// SAFETY: HostAlloc owns its block exclusively; concurrent access goes
// through raw pointers whose users uphold the aliasing rules.
unsafe impl Send for HostAlloc {}
unsafe impl Sync for HostAlloc {}

impl HostAlloc {
    /// `None` when the layout is invalid or the allocator fails.
    pub(crate) fn zeroed(len: usize, align: usize) -> Option<Self> {
        let layout = Layout::from_size_align(len.max(1), align).ok()?;
        // SAFETY: layout has non-zero size.
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        Some(Self { ptr, layout, len })
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for HostAlloc {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for HostAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostAlloc")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("align", &self.layout.align())
            .finish()
    }
}

/// Byte strides of each axis of a buffer with the given pitch vector.
pub(crate) fn byte_strides<const D: usize>(pitches: &IdxVec<D>, elem_size: usize) -> IdxVec<D> {
    IdxVec::from_fn(|axis| if axis + 1 < D { pitches[axis + 1] } else { elem_size })
}

/// Number of fastest axes that form one gap-free run for every stride set.
fn contiguous_axes<const D: usize>(extent: &IdxVec<D>, strides: &[IdxVec<D>], elem_size: usize) -> usize {
    let mut axes = 1;
    let mut run = extent[D - 1] * elem_size;
    while axes < D {
        let axis = D - 1 - axes;
        if strides.iter().any(|s| s[axis] != run) {
            break;
        }
        run *= extent[axis];
        axes += 1;
    }
    axes
}

/// Walk the chunks of `extent`, calling `f` with each chunk's byte offsets
/// under every stride set and the chunk length in bytes.
fn for_each_chunk<const D: usize, const N: usize>(
    extent: IdxVec<D>,
    strides: [IdxVec<D>; N],
    elem_size: usize,
    mut f: impl FnMut([usize; N], usize),
) {
    let inner = contiguous_axes(&extent, &strides, elem_size);
    let chunk_bytes = extent.iter().skip(D - inner).product::<Idx>() * elem_size;
    let outer: IdxVec<D> = IdxVec::from_fn(|axis| if axis < D - inner { extent[axis] } else { 1 });

    for idx in IdxVec::indices(outer) {
        let offsets = strides.map(|s| (0..D).map(|axis| idx[axis] * s[axis]).sum::<usize>());
        f(offsets, chunk_bytes);
    }
}

/// Execute a copy whose both sides are host-addressable.
///
/// # Safety
///
/// The task's pointers must be valid for the described regions, which the
/// task's keep-alive handles guarantee while it is alive.
pub(crate) unsafe fn copy_host<const D: usize>(task: &TaskCopy<D>) {
    let extent = task.extent();
    if extent.prod() == 0 {
        return;
    }
    let elem = task.elem_size();
    let dst = task.dst().ptr.as_ptr();
    let src = task.src().ptr.as_ptr().cast_const();
    let strides = [
        byte_strides(&task.dst().pitches, elem),
        byte_strides(&task.src().pitches, elem),
    ];
    for_each_chunk(extent, strides, elem, |[d, s], bytes| {
        std::ptr::copy(src.add(s), dst.add(d), bytes);
    });
}

/// Execute a fill of host memory.
///
/// # Safety
///
/// Same contract as [`copy_host`].
pub(crate) unsafe fn set_host<const D: usize>(task: &TaskSet<D>) {
    let extent = task.extent();
    if extent.prod() == 0 {
        return;
    }
    let elem = task.elem_size();
    let dst = task.dst().ptr.as_ptr();
    let strides = [byte_strides(&task.dst().pitches, elem)];
    for_each_chunk(extent, strides, elem, |[d], bytes| {
        std::ptr::write_bytes(dst.add(d), task.value(), bytes);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_alloc_is_zeroed_and_aligned() {
        let block = HostAlloc::zeroed(100, 64).unwrap();
        assert_eq!(block.as_ptr() as usize % 64, 0);
        assert_eq!(block.len(), 100);
        let bytes = unsafe { std::slice::from_raw_parts(block.as_ptr(), 100) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_byte_strides_follow_pitches() {
        // [depth 2, height 3, width 5] u32 with a 32-byte row pitch
        let pitches = IdxVec::new([192, 96, 32]);
        assert_eq!(byte_strides(&pitches, 4), IdxVec::new([96, 32, 4]));
    }

    #[test]
    fn test_dense_region_is_one_chunk() {
        let extent = IdxVec::new([4, 8]);
        let strides = [IdxVec::new([32, 4])];
        let mut chunks = Vec::new();
        for_each_chunk(extent, strides, 4, |[o], b| chunks.push((o, b)));
        assert_eq!(chunks, vec![(0, 128)]);
    }

    #[test]
    fn test_padded_rows_split_per_row() {
        let extent = IdxVec::new([3, 8]);
        let strides = [IdxVec::new([64, 4])];
        let mut chunks = Vec::new();
        for_each_chunk(extent, strides, 4, |[o], b| chunks.push((o, b)));
        assert_eq!(chunks, vec![(0, 32), (64, 32), (128, 32)]);
    }

    #[test]
    fn test_full_rows_split_per_slice() {
        // rows are dense but the region covers 2 of 4 rows per slice
        let extent = IdxVec::new([2, 2, 8]);
        let strides = [IdxVec::new([128, 32, 4])];
        let mut chunks = Vec::new();
        for_each_chunk(extent, strides, 4, |[o], b| chunks.push((o, b)));
        assert_eq!(chunks, vec![(0, 64), (128, 64)]);
    }

    #[test]
    fn test_chunking_uses_both_sides() {
        let extent = IdxVec::new([2, 4]);
        let dense = IdxVec::new([16, 4]);
        let padded = IdxVec::new([64, 4]);
        let mut chunks = Vec::new();
        for_each_chunk(extent, [dense, padded], 4, |[d, s], b| chunks.push((d, s, b)));
        assert_eq!(chunks, vec![(0, 0, 16), (16, 64, 16)]);
    }
}
