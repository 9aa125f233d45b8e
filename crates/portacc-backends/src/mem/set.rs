use std::fmt;

use bytemuck::Pod;
use portacc_core::IdxVec;

use super::{check_extent_fits, Region, ViewMut};
use crate::backend::{Enqueue, KeepAlive};
use crate::error::Result;

/// Immutable description of a byte fill of a view's sub-region.
pub struct TaskSet<const D: usize> {
    dst: Region<D>,
    value: u8,
    extent: IdxVec<D>,
    elem_size: usize,
    _keep_alive: KeepAlive,
}

/// Describe filling the first `extent` elements of `dst` with byte `value`.
///
/// Bytes outside `extent`, row padding included, are left untouched.
pub fn create_task_set<T, const D: usize, Dst>(dst: &Dst, value: u8, extent: impl Into<IdxVec<D>>) -> Result<TaskSet<D>>
where
    T: Pod,
    Dst: ViewMut<T, D> + ?Sized,
{
    let extent = extent.into();
    check_extent_fits("set extent", &extent, &dst.extent())?;

    let task = TaskSet {
        dst: Region::of(dst, dst.ptr_native_mut()),
        value,
        extent,
        elem_size: std::mem::size_of::<T>(),
        _keep_alive: dst.keep_alive(),
    };
    for axis in 0..D {
        debug_assert!(task.extent[axis] <= task.dst.extent[axis], "set extent exceeds destination");
    }
    debug_assert!(task.width_bytes() <= task.dst.row_pitch(), "set width exceeds destination pitch");
    tracing::trace!(task = ?task, "created set task");
    Ok(task)
}

/// Enqueue a fill of `extent` elements of `dst` with byte `value`.
pub fn set<Q, T, const D: usize, Dst>(queue: &Q, dst: &Dst, value: u8, extent: impl Into<IdxVec<D>>) -> Result<()>
where
    Q: Enqueue<TaskSet<D>>,
    T: Pod,
    Dst: ViewMut<T, D> + ?Sized,
{
    queue.enqueue(create_task_set(dst, value, extent)?)
}

impl<const D: usize> TaskSet<D> {
    pub fn value(&self) -> u8 {
        self.value
    }

    pub fn extent(&self) -> IdxVec<D> {
        self.extent
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    pub fn width_bytes(&self) -> usize {
        self.extent[D - 1] * self.elem_size
    }

    pub fn bytes(&self) -> usize {
        self.extent.prod() * self.elem_size
    }

    pub(crate) fn dst(&self) -> &Region<D> {
        &self.dst
    }
}

impl<const D: usize> fmt::Debug for TaskSet<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSet")
            .field("dst", &self.dst)
            .field("value", &self.value)
            .field("extent", &self.extent)
            .field("elem_size", &self.elem_size)
            .finish()
    }
}
