use std::fmt;

use bytemuck::Pod;
use portacc_core::IdxVec;

use super::{check_extent_fits, View, ViewMut};
use crate::backend::KeepAlive;
use crate::backends::common::host_mem::byte_strides;
use crate::error::Result;

/// A rectangular sub-region of another view.
///
/// Shares the parent's allocation, pitches and reference count.
pub struct ViewSubView<V, T, const D: usize> {
    parent: V,
    offset: IdxVec<D>,
    extent: IdxVec<D>,
    _elem: std::marker::PhantomData<T>,
}

impl<V, T, const D: usize> ViewSubView<V, T, D>
where
    T: Pod,
    V: View<T, D>,
{
    /// View `extent` elements of `parent` starting at `offset`.
    ///
    /// Fails when the region reaches past the parent on any axis.
    pub fn new(parent: V, offset: impl Into<IdxVec<D>>, extent: impl Into<IdxVec<D>>) -> Result<Self> {
        let offset = offset.into();
        let extent = extent.into();
        let end = offset + extent;
        check_extent_fits("sub-view end", &end, &parent.extent())?;
        Ok(Self {
            parent,
            offset,
            extent,
            _elem: std::marker::PhantomData,
        })
    }

    pub fn offset(&self) -> IdxVec<D> {
        self.offset
    }

    fn byte_offset(&self) -> usize {
        let strides = byte_strides(&self.parent.pitches(), std::mem::size_of::<T>());
        (0..D).map(|axis| self.offset[axis] * strides[axis]).sum()
    }
}

impl<V, T, const D: usize> View<T, D> for ViewSubView<V, T, D>
where
    T: Pod,
    V: View<T, D>,
{
    type Dev = V::Dev;

    fn dev(&self) -> V::Dev {
        self.parent.dev()
    }

    fn extent(&self) -> IdxVec<D> {
        self.extent
    }

    fn pitches(&self) -> IdxVec<D> {
        self.parent.pitches()
    }

    fn ptr_native(&self) -> *const T {
        self.parent.ptr_native().cast::<u8>().wrapping_add(self.byte_offset()).cast()
    }

    fn keep_alive(&self) -> KeepAlive {
        self.parent.keep_alive()
    }
}

impl<V, T, const D: usize> ViewMut<T, D> for ViewSubView<V, T, D>
where
    T: Pod,
    V: ViewMut<T, D>,
{
    fn ptr_native_mut(&self) -> *mut T {
        self.parent.ptr_native_mut().cast::<u8>().wrapping_add(self.byte_offset()).cast()
    }
}

impl<V, T, const D: usize> fmt::Debug for ViewSubView<V, T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewSubView")
            .field("offset", &self.offset)
            .field("extent", &self.extent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::cpu::DevCpu;
    use crate::mem::alloc;

    #[test]
    fn test_sub_view_offsets_pointer() {
        let buf = alloc::<u32, 2, _>(&DevCpu::get(), [4, 6]).unwrap();
        let sub = ViewSubView::new(buf.clone(), [1, 2], [2, 3]).unwrap();
        let expected = buf.ptr_native() as usize + buf.pitch_bytes(1) + 2 * 4;
        assert_eq!(sub.ptr_native() as usize, expected);
        assert_eq!(sub.pitches(), buf.pitches());
        assert_eq!(sub.extent(), IdxVec::new([2, 3]));
    }

    #[test]
    fn test_sub_view_must_fit() {
        let buf = alloc::<u32, 1, _>(&DevCpu::get(), [8]).unwrap();
        assert!(ViewSubView::new(buf.clone(), [4], [4]).is_ok());
        assert!(ViewSubView::new(buf, [5], [4]).is_err());
    }

    #[test]
    fn test_sub_view_keeps_buffer_alive() {
        let buf = alloc::<u8, 1, _>(&DevCpu::get(), [16]).unwrap();
        let sub = ViewSubView::new(buf.clone(), [0], [8]).unwrap();
        let keep = sub.keep_alive();
        assert_eq!(buf.handle_count(), 3);
        drop(keep);
        assert_eq!(buf.handle_count(), 2);
    }
}
