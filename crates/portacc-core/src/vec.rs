//! Rank-checked index and extent vectors.
//!
//! Axes are ordered slowest to fastest: the last component is the one that
//! varies fastest in memory (the "width"), the one before it is the
//! "height", the one before that the "depth".
//!
//! ```text
//!   IdxVec<3>([depth, height, width])
//!              axis 0  axis 1  axis 2 (fastest)
//! ```
//!
//! The rank `D` is a const generic restricted to `1..=4`; using any other rank
//! fails to compile as soon as a vector of that rank is constructed.

use std::fmt;
use std::ops::{Add, Div, Index, IndexMut, Mul, Rem, Sub};

use crate::error::{Error, Result};

/// Index type used for every extent, index and pitch.
pub type Idx = usize;

/// Maximum supported rank.
pub const MAX_DIM: usize = 4;

/// An ordered tuple of `D` unsigned indices.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdxVec<const D: usize>([Idx; D]);

impl<const D: usize> IdxVec<D> {
    const RANK_OK: () = assert!(D >= 1 && D <= MAX_DIM, "IdxVec rank must be within 1..=4");

    /// Number of axes.
    pub const DIM: usize = D;

    pub const fn new(components: [Idx; D]) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::RANK_OK;
        Self(components)
    }

    /// Vector with every component set to `value`.
    pub const fn all(value: Idx) -> Self {
        Self::new([value; D])
    }

    pub const fn zeros() -> Self {
        Self::all(0)
    }

    pub const fn ones() -> Self {
        Self::all(1)
    }

    pub fn from_fn(f: impl FnMut(usize) -> Idx) -> Self {
        Self::new(std::array::from_fn(f))
    }

    pub const fn as_array(&self) -> &[Idx; D] {
        &self.0
    }

    pub const fn into_array(self) -> [Idx; D] {
        self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Idx> {
        self.0.iter()
    }

    pub fn map(self, mut f: impl FnMut(Idx) -> Idx) -> Self {
        Self::from_fn(|i| f(self.0[i]))
    }

    pub fn zip_map(self, other: Self, mut f: impl FnMut(Idx, Idx) -> Idx) -> Self {
        Self::from_fn(|i| f(self.0[i], other.0[i]))
    }

    /// Product of all components (the volume of an extent).
    pub fn prod(&self) -> Idx {
        self.0.iter().product()
    }

    /// Product of all components, `None` on overflow.
    pub fn checked_prod(&self) -> Option<Idx> {
        self.0.iter().try_fold(1usize, |acc, &c| acc.checked_mul(c))
    }

    pub fn sum(&self) -> Idx {
        self.0.iter().sum()
    }

    pub fn min_elem(&self) -> Idx {
        self.0.iter().copied().min().unwrap_or(0)
    }

    pub fn max_elem(&self) -> Idx {
        self.0.iter().copied().max().unwrap_or(0)
    }

    /// Index of the largest component; ties resolve to the slowest axis.
    pub fn max_axis(&self) -> usize {
        let mut best = 0;
        for axis in 1..D {
            if self.0[axis] > self.0[best] {
                best = axis;
            }
        }
        best
    }

    /// Element-wise minimum.
    pub fn min(self, other: Self) -> Self {
        self.zip_map(other, Idx::min)
    }

    /// Element-wise maximum.
    pub fn max(self, other: Self) -> Self {
        self.zip_map(other, Idx::max)
    }

    /// Element-wise `ceil(self / other)`.
    pub fn ceil_div(self, other: Self) -> Self {
        self.zip_map(other, Idx::div_ceil)
    }

    /// True iff every component is `<=` the matching component of `other`.
    pub fn all_le(&self, other: &Self) -> bool {
        self.0.iter().zip(other.0.iter()).all(|(a, b)| a <= b)
    }

    /// True iff every component is `<` the matching component of `other`.
    pub fn all_lt(&self, other: &Self) -> bool {
        self.0.iter().zip(other.0.iter()).all(|(a, b)| a < b)
    }

    /// First axis whose component is zero.
    pub fn zero_axis(&self) -> Option<usize> {
        self.0.iter().position(|&c| c == 0)
    }

    /// Error unless every component is positive.
    pub fn ensure_positive(&self, what: &'static str) -> Result<()> {
        match self.zero_axis() {
            Some(axis) => Err(Error::ZeroExtent { what, axis }),
            None => Ok(()),
        }
    }

    /// Fastest-varying component.
    pub fn width(&self) -> Idx {
        self.0[D - 1]
    }

    /// Second-fastest component, 1 for rank 1.
    pub fn height(&self) -> Idx {
        if D >= 2 {
            self.0[D - 2]
        } else {
            1
        }
    }

    /// Third-fastest component, 1 for ranks below 3.
    pub fn depth(&self) -> Idx {
        if D >= 3 {
            self.0[D - 3]
        } else {
            1
        }
    }

    /// Project onto the last `N` axes.
    ///
    /// Shrinking keeps the fastest `N` components. Growing keeps every
    /// component and prepends `pad` on the new slow axes, so an extent is
    /// extended with `1` and an offset or index with `0`.
    pub fn vec_end<const N: usize>(&self, pad: Idx) -> IdxVec<N> {
        IdxVec::<N>::from_fn(|i| {
            // Position `i` of the result lines up with axis `i + D - N` here.
            match (i + D).checked_sub(N) {
                Some(src) => self.0[src],
                None => pad,
            }
        })
    }

    /// Reverse axis order, converting between slowest-first and x-first.
    pub fn reversed(self) -> Self {
        Self::from_fn(|i| self.0[D - 1 - i])
    }

    /// Row-major linear index of `self` inside `extent`.
    pub fn linearize(&self, extent: &Self) -> Idx {
        self.0
            .iter()
            .zip(extent.0.iter())
            .fold(0, |acc, (&idx, &ext)| acc * ext + idx)
    }

    /// Inverse of [`linearize`](Self::linearize).
    pub fn delinearize(mut linear: Idx, extent: &Self) -> Self {
        let mut out = [0; D];
        for axis in (0..D).rev() {
            let ext = extent.0[axis].max(1);
            out[axis] = linear % ext;
            linear /= ext;
        }
        Self::new(out)
    }

    /// Iterate every index inside `extent` in row-major order.
    pub fn indices(extent: Self) -> IdxIter<D> {
        IdxIter {
            extent,
            next: 0,
            total: if extent.zero_axis().is_some() { 0 } else { extent.prod() },
        }
    }
}

impl<const D: usize> Default for IdxVec<D> {
    fn default() -> Self {
        Self::zeros()
    }
}

impl<const D: usize> From<[Idx; D]> for IdxVec<D> {
    fn from(components: [Idx; D]) -> Self {
        Self::new(components)
    }
}

impl From<Idx> for IdxVec<1> {
    fn from(value: Idx) -> Self {
        Self::new([value])
    }
}

impl<const D: usize> Index<usize> for IdxVec<D> {
    type Output = Idx;

    fn index(&self, axis: usize) -> &Idx {
        &self.0[axis]
    }
}

impl<const D: usize> IndexMut<usize> for IdxVec<D> {
    fn index_mut(&mut self, axis: usize) -> &mut Idx {
        &mut self.0[axis]
    }
}

macro_rules! elementwise_op {
    ($trait:ident, $method:ident, $op:tt) => {
        impl<const D: usize> $trait for IdxVec<D> {
            type Output = Self;

            fn $method(self, rhs: Self) -> Self {
                self.zip_map(rhs, |a, b| a $op b)
            }
        }
    };
}

elementwise_op!(Add, add, +);
elementwise_op!(Sub, sub, -);
elementwise_op!(Mul, mul, *);
elementwise_op!(Div, div, /);
elementwise_op!(Rem, rem, %);

impl<const D: usize> fmt::Debug for IdxVec<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdxVec{self}")
    }
}

impl<const D: usize> fmt::Display for IdxVec<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (axis, c) in self.0.iter().enumerate() {
            if axis > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{c}")?;
        }
        f.write_str(")")
    }
}

/// Row-major iterator over an extent, see [`IdxVec::indices`].
#[derive(Clone, Debug)]
pub struct IdxIter<const D: usize> {
    extent: IdxVec<D>,
    next: Idx,
    total: Idx,
}

impl<const D: usize> Iterator for IdxIter<D> {
    type Item = IdxVec<D>;

    fn next(&mut self) -> Option<IdxVec<D>> {
        if self.next >= self.total {
            return None;
        }
        let idx = IdxVec::delinearize(self.next, &self.extent);
        self.next += 1;
        Some(idx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.next;
        (remaining, Some(remaining))
    }
}

impl<const D: usize> ExactSizeIterator for IdxIter<D> {}
