//! Accelerators, queues and memory for portable parallel kernels
//!
//! This crate provides:
//! - **Devices and platforms**: the host CPU and the devices of an emulated GPU runtime
//! - **Accelerators**: kernel execution contexts with one capability surface
//!   (indices, atomics, math, block-shared memory, block synchronisation)
//! - **Queues**: synchronous and asynchronous FIFO task sequences per device, plus events
//! - **Memory**: pitched buffers, sub-views, and copy/set tasks across devices
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │        kernel closure  |acc: &A, args| { ... }          │
//! │   written once against IdxProvider / AtomicProvider /   │
//! │   SharedMemProvider / BlockSyncProvider / MathProvider  │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ create_task_kernel(work_div, ..)
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │          Queue: Enqueue<TaskKernel | TaskCopy |         │
//! │               TaskSet | TaskHost | Event>               │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┬─────────────┐
//!         ▼             ▼             ▼             ▼
//!   ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────┐
//!   │ CpuSerial│  │ CpuBlocks│  │CpuThreads│  │  GpuEmu  │
//!   │  (host)  │  │ (rayon)  │  │(OS thds) │  │ (streams)│
//!   └──────────┘  └──────────┘  └──────────┘  └──────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use portacc_backends::{
//!     alloc, create_task_kernel, get_valid_work_div, set, AccCpuBlocks, DevCpu, Enqueue,
//!     GridBlockExtentSubDivRestrictions, IdxProvider, IdxVec, Queue, QueueCpuSync, ViewMut,
//! };
//!
//! # fn main() -> portacc_backends::Result<()> {
//! let dev = DevCpu::get();
//! let queue = QueueCpuSync::new(&dev);
//!
//! let buf = alloc::<u32, 1, _>(&dev, IdxVec::new([64]))?;
//! set(&queue, &buf, 0, IdxVec::new([64]))?;
//!
//! let extent = IdxVec::new([64]);
//! let work_div = get_valid_work_div::<AccCpuBlocks<1>, 1>(
//!     &dev,
//!     extent,
//!     IdxVec::ones(),
//!     false,
//!     GridBlockExtentSubDivRestrictions::Unrestricted,
//! )?;
//! let out = buf.kernel_view();
//! queue.enqueue(create_task_kernel(
//!     work_div,
//!     |acc: &AccCpuBlocks<1>, out| {
//!         let i = acc.grid_thread_idx();
//!         if out.contains(&i) {
//!             // SAFETY: every thread writes its own element.
//!             unsafe { out.write(i, i[0] as u32 * 2) };
//!         }
//!     },
//!     out,
//! ))?;
//! queue.wait()?;
//!
//! assert_eq!(buf.to_vec()[10], 20);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod backends;
pub mod error;
pub mod event;
pub mod kernel;
pub mod mem;
pub mod workdiv;

// Re-export public API
pub use backend::{
    Acc, AtomicProvider, BlockSyncProvider, DevPtr, Device, DeviceMemory, Dim3, Enqueue, IdxProvider, KeepAlive,
    MathProvider, MemSpace, Platform, Queue, SharedMemProvider, TaskHost, WaitEvent,
};
pub use backends::common::{AtomicElem, AtomicOp, BinaryOp, BlockSyncOp, Hierarchy, Real, SharedSlice, UnaryOp};
pub use backends::{
    AccCpuBlocks, AccCpuSerial, AccCpuThreads, AccGpuEmu, DevCpu, DevEmu, EmuRuntime, PltfCpu, PltfEmu,
    QueueCpuAsync, QueueCpuSync, QueueEmuAsync, QueueEmuSync,
};
pub use error::{BackendError, Result};
pub use event::Event;
pub use kernel::{create_task_kernel, TaskKernel};
pub use mem::{
    alloc, copy, create_task_copy, create_task_set, set, Buf, KernelView, TaskCopy, TaskSet, View, ViewMut,
    ViewSubView,
};
pub use portacc_core::{
    AccDevProps, FailurePolicy, GridBlockExtentSubDivRestrictions, Idx, IdxVec, RuntimeConfig, WorkDiv,
};
pub use workdiv::{get_acc_dev_props, get_dev_by_idx, get_dev_count, get_valid_work_div, is_valid_work_div};
