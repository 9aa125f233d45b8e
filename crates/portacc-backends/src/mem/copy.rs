use std::fmt;

use bytemuck::Pod;
use portacc_core::IdxVec;

use super::{check_extent_fits, Region, View, ViewMut};
use crate::backend::{Enqueue, KeepAlive};
use crate::error::Result;

/// Immutable description of a pitched copy between two views.
pub struct TaskCopy<const D: usize> {
    dst: Region<D>,
    src: Region<D>,
    extent: IdxVec<D>,
    elem_size: usize,
    _keep_alive: [KeepAlive; 2],
}

/// Describe copying `extent` elements from `src` to `dst`.
///
/// Both views share the element type and rank by construction; `extent` must
/// fit into both on every axis.
pub fn create_task_copy<T, const D: usize, Dst, Src>(
    dst: &Dst,
    src: &Src,
    extent: impl Into<IdxVec<D>>,
) -> Result<TaskCopy<D>>
where
    T: Pod,
    Dst: ViewMut<T, D> + ?Sized,
    Src: View<T, D> + ?Sized,
{
    let extent = extent.into();
    check_extent_fits("copy extent (destination)", &extent, &dst.extent())?;
    check_extent_fits("copy extent (source)", &extent, &src.extent())?;

    let task = TaskCopy {
        dst: Region::of(dst, dst.ptr_native_mut()),
        src: Region::of(src, src.ptr_native().cast_mut()),
        extent,
        elem_size: std::mem::size_of::<T>(),
        _keep_alive: [dst.keep_alive(), src.keep_alive()],
    };
    task.debug_check();
    tracing::trace!(task = ?task, "created copy task");
    Ok(task)
}

/// Enqueue a copy of `extent` elements from `src` to `dst` on `queue`.
pub fn copy<Q, T, const D: usize, Dst, Src>(queue: &Q, dst: &Dst, src: &Src, extent: impl Into<IdxVec<D>>) -> Result<()>
where
    Q: Enqueue<TaskCopy<D>>,
    T: Pod,
    Dst: ViewMut<T, D> + ?Sized,
    Src: View<T, D> + ?Sized,
{
    queue.enqueue(create_task_copy(dst, src, extent)?)
}

impl<const D: usize> TaskCopy<D> {
    pub fn extent(&self) -> IdxVec<D> {
        self.extent
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Bytes per row of the copied region.
    pub fn width_bytes(&self) -> usize {
        self.extent[D - 1] * self.elem_size
    }

    /// Total bytes moved.
    pub fn bytes(&self) -> usize {
        self.extent.prod() * self.elem_size
    }

    pub(crate) fn dst(&self) -> &Region<D> {
        &self.dst
    }

    pub(crate) fn src(&self) -> &Region<D> {
        &self.src
    }

    fn debug_check(&self) {
        for axis in 0..D {
            debug_assert!(self.extent[axis] <= self.dst.extent[axis], "copy extent exceeds destination");
            debug_assert!(self.extent[axis] <= self.src.extent[axis], "copy extent exceeds source");
        }
        debug_assert!(self.width_bytes() <= self.dst.row_pitch(), "copy width exceeds destination pitch");
        debug_assert!(self.width_bytes() <= self.src.row_pitch(), "copy width exceeds source pitch");
    }
}

impl<const D: usize> fmt::Debug for TaskCopy<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCopy")
            .field("dst", &self.dst)
            .field("src", &self.src)
            .field("extent", &self.extent)
            .field("elem_size", &self.elem_size)
            .finish()
    }
}
