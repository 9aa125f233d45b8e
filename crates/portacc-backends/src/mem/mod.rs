//! Buffers, views, and the copy/set tasks that move data between them.
//!
//! # Pitches
//!
//! A view of rank `D` carries `D` pitches in bytes, ordered like its extent.
//! `pitches[D - 1]` is the row pitch (bytes from one row to the next) and
//! each slower entry is the next one times the allocated extent of its
//! axis, so `pitches[0]` is the size of the whole allocation. The byte
//! stride of axis `k < D - 1` is therefore `pitches[k + 1]`; the last axis
//! has a stride of one element.

mod buf;
mod copy;
mod set;
mod view;

use std::fmt;
use std::marker::PhantomData;

use bytemuck::Pod;
use portacc_core::IdxVec;

use crate::backend::{Device, DevPtr, KeepAlive, MemSpace};
use crate::backends::common::host_mem::byte_strides;

pub use buf::{alloc, Buf};
pub use copy::{copy, create_task_copy, TaskCopy};
pub use set::{create_task_set, set, TaskSet};
pub use view::ViewSubView;

/// Read access to a typed, dimensioned memory region.
pub trait View<T: Pod, const D: usize> {
    type Dev: Device;

    fn dev(&self) -> Self::Dev;

    /// Elements per axis.
    fn extent(&self) -> IdxVec<D>;

    /// Pitches of the underlying allocation; see the module docs.
    fn pitches(&self) -> IdxVec<D>;

    /// Pitch of `axis` in bytes.
    fn pitch_bytes(&self, axis: usize) -> usize {
        self.pitches()[axis]
    }

    /// Address of the view's first element.
    fn ptr_native(&self) -> *const T;

    /// Handle that keeps the underlying memory alive.
    fn keep_alive(&self) -> KeepAlive;

    fn mem_space(&self) -> MemSpace {
        self.dev().mem_space()
    }
}

/// Write access to a view.
///
/// Views alias shared, reference-counted memory; ordering writes against
/// other users is the caller's responsibility.
pub trait ViewMut<T: Pod, const D: usize>: View<T, D> {
    fn ptr_native_mut(&self) -> *mut T;

    /// Pitched pointer for use inside kernels.
    fn kernel_view(&self) -> KernelView<T, D> {
        KernelView {
            ptr: DevPtr::new(self.ptr_native_mut().cast()),
            extent: self.extent(),
            strides: byte_strides(&self.pitches(), std::mem::size_of::<T>()),
            _elem: PhantomData,
        }
    }
}

/// A pitched pointer handed to kernels.
///
/// Accessors do not check bounds; kernels compare indices against
/// [`extent`](Self::extent) themselves.
pub struct KernelView<T, const D: usize> {
    ptr: DevPtr,
    extent: IdxVec<D>,
    strides: IdxVec<D>,
    _elem: PhantomData<T>,
}

impl<T, const D: usize> Clone for KernelView<T, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, const D: usize> Copy for KernelView<T, D> {}

// SAFETY: a KernelView is an address plus layout; dereferencing is unsafe.
unsafe impl<T: Send, const D: usize> Send for KernelView<T, D> {}
unsafe impl<T: Send, const D: usize> Sync for KernelView<T, D> {}

impl<T: Pod, const D: usize> KernelView<T, D> {
    pub fn extent(&self) -> IdxVec<D> {
        self.extent
    }

    pub fn contains(&self, idx: &IdxVec<D>) -> bool {
        idx.all_lt(&self.extent)
    }

    /// Address of element `idx`, without bounds checks.
    pub fn elem_ptr(&self, idx: IdxVec<D>) -> *mut T {
        let offset: usize = (0..D).map(|axis| idx[axis] * self.strides[axis]).sum();
        self.ptr.byte_add(offset).as_ptr().cast()
    }

    /// # Safety
    ///
    /// `idx` must be inside the extent and not written concurrently.
    pub unsafe fn read(&self, idx: IdxVec<D>) -> T {
        self.elem_ptr(idx).read()
    }

    /// # Safety
    ///
    /// `idx` must be inside the extent and not accessed concurrently.
    pub unsafe fn write(&self, idx: IdxVec<D>, value: T) {
        self.elem_ptr(idx).write(value)
    }
}

impl<T, const D: usize> fmt::Debug for KernelView<T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelView")
            .field("ptr", &self.ptr)
            .field("extent", &self.extent)
            .field("strides", &self.strides)
            .finish()
    }
}

/// Address, layout and memory space of one side of a copy or set.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Region<const D: usize> {
    pub(crate) ptr: DevPtr,
    pub(crate) space: MemSpace,
    pub(crate) pitches: IdxVec<D>,
    pub(crate) extent: IdxVec<D>,
}

impl<const D: usize> Region<D> {
    pub(crate) fn of<T: Pod, V: View<T, D> + ?Sized>(view: &V, ptr: *mut T) -> Self {
        Self {
            ptr: DevPtr::new(ptr.cast()),
            space: view.mem_space(),
            pitches: view.pitches(),
            extent: view.extent(),
        }
    }

    /// Bytes from one row to the next.
    pub(crate) fn row_pitch(&self) -> usize {
        self.pitches[D - 1]
    }

    /// Allocated rows per slice; 1 below rank 3.
    pub(crate) fn rows_per_slice(&self) -> usize {
        if D >= 3 {
            self.pitches[D - 2] / self.pitches[D - 1].max(1)
        } else {
            1
        }
    }

    /// Byte stride of `axis` for elements of `elem_size` bytes.
    pub(crate) fn stride(&self, axis: usize, elem_size: usize) -> usize {
        byte_strides(&self.pitches, elem_size)[axis]
    }
}

/// Reject an `extent` that does not fit into a view's extent.
pub(crate) fn check_extent_fits<const D: usize>(
    what: &'static str,
    extent: &IdxVec<D>,
    available: &IdxVec<D>,
) -> portacc_core::Result<()> {
    for axis in 0..D {
        if extent[axis] > available[axis] {
            return Err(portacc_core::Error::ExtentOutOfRange {
                what,
                axis,
                requested: extent[axis],
                available: available[axis],
            });
        }
    }
    Ok(())
}
