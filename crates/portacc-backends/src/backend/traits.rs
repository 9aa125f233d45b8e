//! Device, platform and queue traits
//!
//! ```text
//! ┌───────────────┐   dev_by_idx    ┌──────────────┐   bound to   ┌──────────────────┐
//! │  Platform     │ ──────────────▶ │   Device     │ ◀─────────── │  Queue           │
//! │ PltfCpu       │                 │ DevCpu       │              │ QueueCpuSync     │
//! │ PltfEmu       │                 │ DevEmu       │              │ QueueCpuAsync    │
//! └───────────────┘                 └──────┬───────┘              │ QueueEmuSync     │
//!                                          │ allocate             │ QueueEmuAsync    │
//!                                          ▼                      └────────┬─────────┘
//!                                   DeviceMemory                           │ Enqueue<T>
//!                                   (owned by Buf)          kernels, copies, sets, host tasks, events
//! ```

use std::fmt;
use std::time::Duration;

use portacc_core::FailurePolicy;

use super::types::MemSpace;
use crate::error::Result;
use crate::event::Event;

/// A compute device: the host CPU or one emulated GPU.
///
/// Device handles are cheap to clone and compare equal when they refer to
/// the same physical or logical device.
pub trait Device: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Memory owned by one allocation on this device.
    type Memory: DeviceMemory;

    /// Human-readable device name.
    fn name(&self) -> String;

    /// Backend-native device index.
    fn native_id(&self) -> usize;

    /// Address space of memory allocated on this device.
    fn mem_space(&self) -> MemSpace;

    /// Allocate `rows` rows of `row_bytes` bytes each.
    ///
    /// With `pitched` set the allocator may pad each row for alignment; the
    /// chosen row pitch is reported by [`DeviceMemory::pitch_bytes`].
    fn allocate(&self, row_bytes: usize, rows: usize, pitched: bool) -> Result<Self::Memory>;

    /// Block until every queue bound to this device has drained.
    fn wait_all(&self) -> Result<()>;
}

/// One allocation; freed on drop.
pub trait DeviceMemory: Send + Sync + 'static {
    fn as_mut_ptr(&self) -> *mut u8;

    /// Row pitch in bytes, at least the requested row size.
    fn pitch_bytes(&self) -> usize;

    /// Total allocated bytes, padding included.
    fn size_bytes(&self) -> usize;
}

/// Enumerates the devices of one backend.
pub trait Platform {
    type Dev: Device;

    fn name() -> &'static str;

    fn dev_count() -> Result<usize>;

    fn dev_by_idx(index: usize) -> Result<Self::Dev>;
}

/// An ordered task sequence bound to one device.
///
/// Handles are `Clone`; clones alias the same execution context and compare
/// equal.
pub trait Queue: Clone + PartialEq + Send + Sync + 'static {
    type Dev: Device;

    fn dev(&self) -> Self::Dev;

    /// True iff every enqueued task has completed, as of the call.
    fn empty(&self) -> bool;

    /// Block until every enqueued task has completed.
    ///
    /// Reports a fault recorded by an earlier task when the queue runs under
    /// [`FailurePolicy::Propagate`].
    fn wait(&self) -> Result<()>;

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    ///
    /// Returns `Ok(false)` when the queue has not drained in time; the
    /// pending work keeps running.
    fn wait_timeout(&self, timeout: Duration) -> Result<bool>;

    /// True for queues whose `enqueue` returns after the task completed.
    fn is_blocking(&self) -> bool;

    fn failure_policy(&self) -> FailurePolicy;
}

/// Submission of one task type to a queue.
pub trait Enqueue<T>: Queue {
    /// Append `task` to the queue.
    fn enqueue(&self, task: T) -> Result<()>;
}

/// Cross-queue ordering.
pub trait WaitEvent: Queue {
    /// Make every task enqueued after this call wait until `event`'s most
    /// recent recording has completed.
    fn wait_for(&self, event: &Event) -> Result<()>;
}
