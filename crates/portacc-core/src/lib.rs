//! Backend-independent core of portacc.
//!
//! This crate provides:
//! - **Index model**: rank-checked [`IdxVec`] extent/index vectors
//! - **Device limits**: [`AccDevProps`]
//! - **Work division**: [`WorkDiv`], [`get_valid_work_div`], [`is_valid_work_div`]
//! - **Configuration**: [`RuntimeConfig`] and the backend [`FailurePolicy`]
//!
//! # Usage
//!
//! ```rust
//! use portacc_core::{get_valid_work_div, AccDevProps, GridBlockExtentSubDivRestrictions, IdxVec};
//!
//! # fn main() -> portacc_core::Result<()> {
//! let props = AccDevProps::<2>::from_hw3(
//!     1,
//!     IdxVec::new([1, 65_535, 65_535]),
//!     IdxVec::new([1, 32, 32]),
//!     1024,
//!     0,
//! );
//! let wd = get_valid_work_div(
//!     &props,
//!     IdxVec::new([100, 300]),
//!     IdxVec::ones(),
//!     false,
//!     GridBlockExtentSubDivRestrictions::Unrestricted,
//! )?;
//! assert!(wd.covers(&IdxVec::new([100, 300])));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod props;
pub mod vec;
pub mod workdiv;

pub use config::{FailurePolicy, RuntimeConfig};
pub use error::{Error, Limit, Result};
pub use props::AccDevProps;
pub use vec::{Idx, IdxIter, IdxVec, MAX_DIM};
pub use workdiv::{
    get_valid_work_div, is_valid_work_div, validate_work_div, GridBlockExtentSubDivRestrictions, WorkDiv,
};
