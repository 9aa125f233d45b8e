//! Work division: grid blocks × block threads × thread elements.
//!
//! ```text
//!  grid (grid_block_extent blocks)
//!  ┌─────────┬─────────┬─────────┐
//!  │ block   │ block   │ block   │   each block: block_thread_extent threads
//!  │ ▪▪▪▪    │ ▪▪▪▪    │ ▪▪▪▪    │   each thread: thread_elem_extent elements
//!  └─────────┴─────────┴─────────┘
//! ```
//!
//! [`get_valid_work_div`] derives a legal division from a problem extent and
//! the device limits in [`AccDevProps`]; [`validate_work_div`] and
//! [`is_valid_work_div`] re-check any division against those limits.

use std::fmt;

use crate::error::{Error, Limit, Result};
use crate::props::AccDevProps;
use crate::vec::{Idx, IdxVec};

/// An immutable hierarchical decomposition of an index space.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkDiv<const D: usize> {
    grid_block_extent: IdxVec<D>,
    block_thread_extent: IdxVec<D>,
    thread_elem_extent: IdxVec<D>,
}

impl<const D: usize> WorkDiv<D> {
    pub fn new(
        grid_block_extent: impl Into<IdxVec<D>>,
        block_thread_extent: impl Into<IdxVec<D>>,
        thread_elem_extent: impl Into<IdxVec<D>>,
    ) -> Self {
        Self {
            grid_block_extent: grid_block_extent.into(),
            block_thread_extent: block_thread_extent.into(),
            thread_elem_extent: thread_elem_extent.into(),
        }
    }

    pub fn grid_block_extent(&self) -> IdxVec<D> {
        self.grid_block_extent
    }

    pub fn block_thread_extent(&self) -> IdxVec<D> {
        self.block_thread_extent
    }

    pub fn thread_elem_extent(&self) -> IdxVec<D> {
        self.thread_elem_extent
    }

    /// Threads along each axis of the whole grid.
    pub fn grid_thread_extent(&self) -> IdxVec<D> {
        self.grid_block_extent * self.block_thread_extent
    }

    /// Elements along each axis of one block.
    pub fn block_elem_extent(&self) -> IdxVec<D> {
        self.block_thread_extent * self.thread_elem_extent
    }

    /// Elements along each axis covered by the whole grid.
    pub fn grid_elem_extent(&self) -> IdxVec<D> {
        self.grid_thread_extent() * self.thread_elem_extent
    }

    pub fn grid_block_count(&self) -> Idx {
        self.grid_block_extent.prod()
    }

    pub fn block_thread_count(&self) -> Idx {
        self.block_thread_extent.prod()
    }

    /// True iff the division covers `extent` on every axis.
    pub fn covers(&self, extent: &IdxVec<D>) -> bool {
        extent.all_le(&self.grid_elem_extent())
    }
}

impl<const D: usize> fmt::Debug for WorkDiv<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkDiv{self}")
    }
}

impl<const D: usize> fmt::Display for WorkDiv<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{gridBlockExtent: {}, blockThreadExtent: {}, threadElemExtent: {}}}",
            self.grid_block_extent, self.block_thread_extent, self.thread_elem_extent
        )
    }
}

/// Shape constraints on the block-thread extent chosen by [`get_valid_work_div`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum GridBlockExtentSubDivRestrictions {
    /// Every block-thread axis has the same length.
    EqualExtent,
    /// Shrink the largest axis first so axes stay close to each other.
    CloseToEqualExtent,
    /// Fill the fastest axis first to maximise threads per block.
    #[default]
    Unrestricted,
}

// ============================================================================
// Calculator
// ============================================================================

/// Compute a work division covering `grid_elem_extent`.
///
/// `thread_elem_extent` is respected exactly; only the grid and block extents
/// are derived. With `block_thread_must_divide_grid_thread_extent` set, every
/// block-thread axis divides the grid-thread extent so no block is partial.
///
/// Fails with a configuration error when an extent has a zero component,
/// when `thread_elem_extent` exceeds the per-thread limits, or when covering
/// the problem would need more grid blocks than the device allows.
pub fn get_valid_work_div<const D: usize>(
    props: &AccDevProps<D>,
    grid_elem_extent: IdxVec<D>,
    thread_elem_extent: IdxVec<D>,
    block_thread_must_divide_grid_thread_extent: bool,
    restrictions: GridBlockExtentSubDivRestrictions,
) -> Result<WorkDiv<D>> {
    grid_elem_extent.ensure_positive("grid element extent")?;
    thread_elem_extent.ensure_positive("thread element extent")?;
    check_extent(Limit::ThreadElemExtent, &thread_elem_extent, &props.thread_elem_extent_max)?;
    check_count(Limit::ThreadElemCount, &thread_elem_extent, props.thread_elem_count_max)?;

    let grid_thread_extent = grid_elem_extent.ceil_div(thread_elem_extent);
    let count_max = props.block_thread_count_max.max(1);
    let mut block_thread_extent = grid_thread_extent.min(props.block_thread_extent_max).map(|c| c.max(1));

    match restrictions {
        GridBlockExtentSubDivRestrictions::EqualExtent => {
            let edge = equal_edge::<D>(block_thread_extent.min_elem(), count_max);
            block_thread_extent = IdxVec::all(edge);
        }
        GridBlockExtentSubDivRestrictions::CloseToEqualExtent => {
            while block_thread_extent.checked_prod().is_none_or(|p| p > count_max) {
                let axis = block_thread_extent.max_axis();
                block_thread_extent[axis] = (block_thread_extent[axis] / 2).max(1);
            }
        }
        GridBlockExtentSubDivRestrictions::Unrestricted => {
            let mut budget = count_max;
            for axis in (0..D).rev() {
                block_thread_extent[axis] = block_thread_extent[axis].min(budget).max(1);
                budget /= block_thread_extent[axis];
            }
        }
    }

    if block_thread_must_divide_grid_thread_extent {
        if restrictions == GridBlockExtentSubDivRestrictions::EqualExtent {
            let mut edge = block_thread_extent[0];
            while edge > 1 && grid_thread_extent.iter().any(|&t| t % edge != 0) {
                edge -= 1;
            }
            block_thread_extent = IdxVec::all(edge);
        } else {
            block_thread_extent =
                grid_thread_extent.zip_map(block_thread_extent, largest_divisor_at_most);
        }
    }

    let grid_block_extent = grid_thread_extent.ceil_div(block_thread_extent);
    check_extent(Limit::GridBlockExtent, &grid_block_extent, &props.grid_block_extent_max)?;
    check_count(Limit::GridBlockCount, &grid_block_extent, props.grid_block_count_max)?;

    let work_div = WorkDiv {
        grid_block_extent,
        block_thread_extent,
        thread_elem_extent,
    };
    tracing::trace!(%grid_elem_extent, %work_div, ?restrictions, "computed work division");
    debug_assert!(is_valid_work_div(props, &work_div));
    debug_assert!(work_div.covers(&grid_elem_extent));
    Ok(work_div)
}

/// Check `work_div` against every limit in `props`, naming the first violation.
pub fn validate_work_div<const D: usize>(props: &AccDevProps<D>, work_div: &WorkDiv<D>) -> Result<()> {
    work_div.grid_block_extent.ensure_positive("grid block extent")?;
    work_div.block_thread_extent.ensure_positive("block thread extent")?;
    work_div.thread_elem_extent.ensure_positive("thread element extent")?;

    check_extent(Limit::GridBlockExtent, &work_div.grid_block_extent, &props.grid_block_extent_max)?;
    check_count(Limit::GridBlockCount, &work_div.grid_block_extent, props.grid_block_count_max)?;
    check_extent(Limit::BlockThreadExtent, &work_div.block_thread_extent, &props.block_thread_extent_max)?;
    check_count(Limit::BlockThreadCount, &work_div.block_thread_extent, props.block_thread_count_max)?;
    check_extent(Limit::ThreadElemExtent, &work_div.thread_elem_extent, &props.thread_elem_extent_max)?;
    check_count(Limit::ThreadElemCount, &work_div.thread_elem_extent, props.thread_elem_count_max)?;
    Ok(())
}

/// Boolean form of [`validate_work_div`].
pub fn is_valid_work_div<const D: usize>(props: &AccDevProps<D>, work_div: &WorkDiv<D>) -> bool {
    validate_work_div(props, work_div).is_ok()
}

fn check_extent<const D: usize>(limit: Limit, value: &IdxVec<D>, max: &IdxVec<D>) -> Result<()> {
    for axis in 0..D {
        if value[axis] > max[axis] {
            return Err(Error::limit(limit, Some(axis), value[axis], max[axis]));
        }
    }
    Ok(())
}

fn check_count<const D: usize>(limit: Limit, value: &IdxVec<D>, max: Idx) -> Result<()> {
    match value.checked_prod() {
        Some(count) if count <= max => Ok(()),
        Some(count) => Err(Error::limit(limit, None, count, max)),
        None => Err(Error::limit(limit, None, Idx::MAX, max)),
    }
}

/// Largest `e <= limit` with `e^D <= count_max`, at least 1.
fn equal_edge<const D: usize>(limit: Idx, count_max: Idx) -> Idx {
    let fits = |e: Idx| e.checked_pow(D as u32).is_some_and(|p| p <= count_max);
    let estimate = (count_max as f64).powf(1.0 / D as f64).floor() as Idx;
    let mut edge = estimate.clamp(1, limit.max(1));
    while edge < limit && fits(edge + 1) {
        edge += 1;
    }
    while edge > 1 && !fits(edge) {
        edge -= 1;
    }
    edge
}

fn largest_divisor_at_most(n: Idx, at_most: Idx) -> Idx {
    (1..=at_most.min(n)).rev().find(|d| n % d == 0).unwrap_or(1)
}
