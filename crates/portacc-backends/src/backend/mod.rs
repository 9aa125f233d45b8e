//! Backend abstraction
//!
//! Devices, platforms, queues and accelerators implement the traits defined
//! here; generic code (buffers, copies, kernels) is written against them.

pub mod acc;
pub mod traits;
pub mod types;

pub use acc::{Acc, AtomicProvider, BlockSyncProvider, IdxProvider, MathProvider, SharedMemProvider};
pub use traits::{Device, DeviceMemory, Enqueue, Platform, Queue, WaitEvent};
pub use types::{DevPtr, Dim3, KeepAlive, MemSpace, TaskHost};
