//! Device-level entry points: enumeration, accelerator limits and work
//! division for a concrete accelerator on a concrete device.

use portacc_core::{AccDevProps, GridBlockExtentSubDivRestrictions, IdxVec, WorkDiv};

use crate::backend::{Acc, Platform};
use crate::error::Result;

pub fn get_dev_count<P: Platform>() -> Result<usize> {
    P::dev_count()
}

pub fn get_dev_by_idx<P: Platform>(index: usize) -> Result<P::Dev> {
    P::dev_by_idx(index)
}

/// Limits of `dev` as seen by accelerator `A`.
pub fn get_acc_dev_props<A: Acc<D>, const D: usize>(dev: &A::Dev) -> Result<AccDevProps<D>> {
    A::dev_props(dev)
}

/// Work division for running `A` over `grid_elem_extent` on `dev`.
///
/// ```
/// use portacc_backends::{get_valid_work_div, AccCpuThreads, DevCpu, GridBlockExtentSubDivRestrictions, IdxVec};
///
/// # fn main() -> portacc_backends::Result<()> {
/// let wd = get_valid_work_div::<AccCpuThreads<1>, 1>(
///     &DevCpu::get(),
///     IdxVec::new([1025]),
///     IdxVec::ones(),
///     false,
///     GridBlockExtentSubDivRestrictions::Unrestricted,
/// )?;
/// assert!(wd.covers(&IdxVec::new([1025])));
/// # Ok(())
/// # }
/// ```
pub fn get_valid_work_div<A: Acc<D>, const D: usize>(
    dev: &A::Dev,
    grid_elem_extent: IdxVec<D>,
    thread_elem_extent: IdxVec<D>,
    block_thread_must_divide_grid_thread_extent: bool,
    restrictions: GridBlockExtentSubDivRestrictions,
) -> Result<WorkDiv<D>> {
    let props = A::dev_props(dev)?;
    let work_div = portacc_core::get_valid_work_div(
        &props,
        grid_elem_extent,
        thread_elem_extent,
        block_thread_must_divide_grid_thread_extent,
        restrictions,
    )?;
    tracing::debug!(acc = %A::acc_name(), %grid_elem_extent, %work_div, "work division");
    Ok(work_div)
}

/// False when `work_div` breaks one of `A`'s limits on `dev`, or the limits
/// cannot be queried.
pub fn is_valid_work_div<A: Acc<D>, const D: usize>(dev: &A::Dev, work_div: &WorkDiv<D>) -> bool {
    A::dev_props(dev).is_ok_and(|props| portacc_core::is_valid_work_div(&props, work_div))
}
