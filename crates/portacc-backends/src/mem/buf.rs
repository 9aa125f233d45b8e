use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use bytemuck::Pod;
use portacc_core::{Error, IdxVec};
use portacc_tracing::performance::record_allocation;

use super::{View, ViewMut};
use crate::backend::{Device, DeviceMemory, KeepAlive};
use crate::backends::cpu::DevCpu;
use crate::error::Result;

struct BufInner<const D: usize, Dev: Device> {
    dev: Dev,
    extent: IdxVec<D>,
    pitches: IdxVec<D>,
    mem: Dev::Memory,
}

/// An owned, typed, dimensioned allocation on one device.
///
/// Clones share the allocation; it is freed when the last clone, view or
/// in-flight task referencing it is dropped.
pub struct Buf<T: Pod, const D: usize, Dev: Device> {
    inner: Arc<BufInner<D, Dev>>,
    _elem: PhantomData<T>,
}

impl<T: Pod, const D: usize, Dev: Device> Clone for Buf<T, D, Dev> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _elem: PhantomData,
        }
    }
}

/// Allocate a buffer of `extent` elements on `dev`.
///
/// Rank-1 and host allocations are dense; multi-dimensional allocations on
/// devices with a pitched allocator may pad every row.
pub fn alloc<T: Pod, const D: usize, Dev: Device>(dev: &Dev, extent: impl Into<IdxVec<D>>) -> Result<Buf<T, D, Dev>> {
    let extent = extent.into();
    extent.ensure_positive("buffer extent")?;

    let row_bytes = extent[D - 1]
        .checked_mul(std::mem::size_of::<T>())
        .ok_or(Error::IndexOverflow { what: "buffer row size" })?;
    let rows = extent.iter().take(D - 1).try_fold(1usize, |acc, &e| acc.checked_mul(e));
    let rows = rows.ok_or(Error::IndexOverflow { what: "buffer row count" })?;

    let start = Instant::now();
    let mem = dev.allocate(row_bytes, rows, D >= 2)?;
    let pitch = mem.pitch_bytes();
    record_allocation(mem.size_bytes(), &dev.name(), pitch, start.elapsed().as_micros() as u64);

    let mut pitches = IdxVec::all(pitch);
    for axis in (0..D - 1).rev() {
        pitches[axis] = pitches[axis + 1] * extent[axis];
    }
    tracing::debug!(
        device = %dev.name(),
        %extent,
        %pitches,
        elem = std::any::type_name::<T>(),
        "allocated buffer"
    );

    Ok(Buf {
        inner: Arc::new(BufInner {
            dev: dev.clone(),
            extent,
            pitches,
            mem,
        }),
        _elem: PhantomData,
    })
}

impl<T: Pod, const D: usize, Dev: Device> Buf<T, D, Dev> {
    /// Number of live handles (buffer clones, views, pending tasks).
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl<T: Pod, const D: usize, Dev: Device> View<T, D> for Buf<T, D, Dev> {
    type Dev = Dev;

    fn dev(&self) -> Dev {
        self.inner.dev.clone()
    }

    fn extent(&self) -> IdxVec<D> {
        self.inner.extent
    }

    fn pitches(&self) -> IdxVec<D> {
        self.inner.pitches
    }

    fn ptr_native(&self) -> *const T {
        self.inner.mem.as_mut_ptr().cast_const().cast()
    }

    fn keep_alive(&self) -> KeepAlive {
        Arc::clone(&self.inner) as KeepAlive
    }
}

impl<T: Pod, const D: usize, Dev: Device> ViewMut<T, D> for Buf<T, D, Dev> {
    fn ptr_native_mut(&self) -> *mut T {
        self.inner.mem.as_mut_ptr().cast()
    }
}

impl<T: Pod, const D: usize> Buf<T, D, DevCpu> {
    /// Elements in row-major order.
    pub fn to_vec(&self) -> Vec<T> {
        let len = self.inner.extent.prod();
        // SAFETY: host buffers are dense and hold `len` initialised elements.
        unsafe { std::slice::from_raw_parts(self.ptr_native(), len) }.to_vec()
    }

    /// Overwrite every element from `data` in row-major order.
    pub fn copy_from_slice(&self, data: &[T]) -> Result<()> {
        let len = self.inner.extent.prod();
        if data.len() != len {
            return Err(Error::ExtentOutOfRange {
                what: "host slice length",
                axis: 0,
                requested: data.len(),
                available: len,
            }
            .into());
        }
        // SAFETY: dense host allocation of `len` elements; `data` cannot
        // alias it because it is borrowed from elsewhere.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr_native_mut(), len) };
        Ok(())
    }
}

impl<T: Pod, const D: usize, Dev: Device> fmt::Debug for Buf<T, D, Dev> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buf")
            .field("elem", &std::any::type_name::<T>())
            .field("dev", &self.inner.dev)
            .field("extent", &self.inner.extent)
            .field("pitches", &self.inner.pitches)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_buffers_are_dense_and_zeroed() {
        let buf = alloc::<u16, 3, _>(&DevCpu::get(), [2, 3, 5]).unwrap();
        assert_eq!(buf.pitches(), IdxVec::new([60, 30, 10]));
        assert_eq!(buf.pitch_bytes(2), 10);
        assert!(buf.to_vec().iter().all(|&v| v == 0));
        assert_eq!(buf.ptr_native() as usize % 64, 0);
    }

    #[test]
    fn test_zero_extent_is_rejected() {
        let err = alloc::<u32, 2, _>(&DevCpu::get(), [4, 0]).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_clones_share_memory() {
        let buf = alloc::<u32, 1, _>(&DevCpu::get(), [4]).unwrap();
        let alias = buf.clone();
        alias.copy_from_slice(&[1, 2, 3, 4]).unwrap();
        assert_eq!(buf.to_vec(), vec![1, 2, 3, 4]);
        assert_eq!(buf.handle_count(), 2);
        assert_eq!(buf.ptr_native(), alias.ptr_native());
    }

    #[test]
    fn test_copy_from_slice_checks_length() {
        let buf = alloc::<u8, 2, _>(&DevCpu::get(), [2, 2]).unwrap();
        assert!(buf.copy_from_slice(&[0; 3]).is_err());
    }
}
