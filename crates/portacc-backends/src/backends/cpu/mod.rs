//! CPU backend
//!
//! One host device, three accelerators and two queue kinds:
//!
//! | Accelerator     | Threads per block | Blocks                  |
//! |-----------------|-------------------|-------------------------|
//! | `AccCpuSerial`  | 1                 | sequential              |
//! | `AccCpuBlocks`  | 1                 | parallel on rayon pool  |
//! | `AccCpuThreads` | one OS thread each| sequential              |
//!
//! `QueueCpuSync` runs each task on the caller's thread; `QueueCpuAsync`
//! hands tasks to a dedicated FIFO worker thread.

mod acc_blocks;
mod acc_serial;
mod acc_threads;
mod queue;

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::backend::{Device, DeviceMemory, MemSpace, Platform};
use crate::backends::common::host_mem::HostAlloc;
use crate::error::{BackendError, Result};

pub use acc_blocks::AccCpuBlocks;
pub use acc_serial::AccCpuSerial;
pub use acc_threads::AccCpuThreads;
pub use queue::{QueueCpuAsync, QueueCpuSync};

/// Host allocations are aligned to a cache line.
const HOST_ALIGN: usize = 64;

/// A queue the device can drain in [`Device::wait_all`].
pub(crate) trait DrainQueue: Send + Sync {
    fn drain(&self) -> Result<()>;
}

struct DevCpuInner {
    name: String,
    queues: Mutex<Vec<Weak<dyn DrainQueue>>>,
}

/// The host CPU.
#[derive(Clone)]
pub struct DevCpu {
    inner: Arc<DevCpuInner>,
}

impl DevCpu {
    /// The process-wide host device.
    pub fn get() -> DevCpu {
        static DEV: OnceLock<DevCpu> = OnceLock::new();
        DEV.get_or_init(|| DevCpu {
            inner: Arc::new(DevCpuInner {
                name: format!("host CPU ({} hardware threads)", Self::cores()),
                queues: Mutex::new(Vec::new()),
            }),
        })
        .clone()
    }

    /// Hardware threads available to the process.
    pub fn cores() -> usize {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    }

    pub(crate) fn register_queue(&self, queue: Weak<dyn DrainQueue>) {
        let mut queues = self.inner.queues.lock();
        queues.retain(|q| q.strong_count() > 0);
        queues.push(queue);
    }
}

impl PartialEq for DevCpu {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for DevCpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevCpu").field("name", &self.inner.name).finish()
    }
}

/// One host allocation.
#[derive(Debug)]
pub struct CpuMemory {
    block: HostAlloc,
    pitch_bytes: usize,
}

impl DeviceMemory for CpuMemory {
    fn as_mut_ptr(&self) -> *mut u8 {
        self.block.as_ptr()
    }

    fn pitch_bytes(&self) -> usize {
        self.pitch_bytes
    }

    fn size_bytes(&self) -> usize {
        self.block.len()
    }
}

impl Device for DevCpu {
    type Memory = CpuMemory;

    fn name(&self) -> String {
        self.inner.name.clone()
    }

    fn native_id(&self) -> usize {
        0
    }

    fn mem_space(&self) -> MemSpace {
        MemSpace::Host
    }

    fn allocate(&self, row_bytes: usize, rows: usize, _pitched: bool) -> Result<CpuMemory> {
        let bytes = row_bytes.checked_mul(rows).ok_or_else(|| BackendError::OutOfMemory {
            bytes: usize::MAX,
            device: self.name(),
        })?;
        let block = HostAlloc::zeroed(bytes, HOST_ALIGN).ok_or_else(|| BackendError::OutOfMemory {
            bytes,
            device: self.name(),
        })?;
        Ok(CpuMemory {
            block,
            pitch_bytes: row_bytes,
        })
    }

    fn wait_all(&self) -> Result<()> {
        let queues: Vec<_> = {
            let mut queues = self.inner.queues.lock();
            queues.retain(|q| q.strong_count() > 0);
            queues.iter().filter_map(Weak::upgrade).collect()
        };
        portacc_tracing::perf_event!("wait_all", device = "cpu", queues = queues.len());
        let mut first_err = None;
        for queue in queues {
            if let Err(err) = queue.drain() {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Platform exposing the single host device.
pub struct PltfCpu;

impl Platform for PltfCpu {
    type Dev = DevCpu;

    fn name() -> &'static str {
        "cpu"
    }

    fn dev_count() -> Result<usize> {
        Ok(1)
    }

    fn dev_by_idx(index: usize) -> Result<DevCpu> {
        if index != 0 {
            return Err(BackendError::InvalidDeviceIndex {
                platform: Self::name(),
                index,
                count: 1,
            });
        }
        Ok(DevCpu::get())
    }
}
