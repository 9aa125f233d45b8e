//! Emulated GPU backend
//!
//! [`EmuRuntime`] is a software runtime with the shape of a vendor GPU API:
//! numbered devices behind a per-thread current device, streams, pitched
//! device memory and host callbacks. [`DevEmu`], [`AccGpuEmu`] and the two
//! queue kinds put the portable abstraction on top of it, issuing every
//! operation as a runtime call and converting failed statuses with
//! [`rt_check!`](crate::rt_check).

mod acc;
mod bridge;
mod memory;
mod queue;
mod runtime;
mod stream;
mod transfer;

use std::fmt;
use std::sync::Arc;

use crate::backend::{DevPtr, Device, DeviceMemory, MemSpace, Platform};
use crate::error::{BackendError, Result};
use crate::rt_check;

pub use acc::AccGpuEmu;
pub use memory::{Extent3D, Memcpy3DParams, Memcpy3DPeerParams, MemcpyKind, PitchedPtr};
pub use queue::{QueueEmuAsync, QueueEmuSync};
pub use runtime::{EmuDeviceProps, EmuError, EmuResult, EmuRuntime};
pub use stream::{Stream, StreamCallback};

use runtime::ScopedDevice;

/// One logical device of an [`EmuRuntime`].
#[derive(Clone)]
pub struct DevEmu {
    runtime: Arc<EmuRuntime>,
    id: usize,
}

impl DevEmu {
    /// Device `id` of `runtime`; platforms use the global runtime, tests
    /// may bring their own.
    pub fn from_runtime(runtime: &Arc<EmuRuntime>, id: usize) -> Result<Self> {
        let count = rt_check!("emu", "device_count", runtime.device_count())?;
        if id >= count {
            return Err(BackendError::InvalidDeviceIndex {
                platform: PltfEmu::name(),
                index: id,
                count,
            });
        }
        Ok(Self {
            runtime: Arc::clone(runtime),
            id,
        })
    }

    pub fn runtime(&self) -> &Arc<EmuRuntime> {
        &self.runtime
    }

    pub fn id(&self) -> usize {
        self.id
    }
}

impl PartialEq for DevEmu {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.runtime, &other.runtime) && self.id == other.id
    }
}

impl fmt::Debug for DevEmu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevEmu").field("id", &self.id).finish()
    }
}

/// One device allocation; returned to the runtime on drop.
pub struct EmuMemory {
    runtime: Arc<EmuRuntime>,
    ptr: DevPtr,
    pitch_bytes: usize,
    size_bytes: usize,
}

impl DeviceMemory for EmuMemory {
    fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn pitch_bytes(&self) -> usize {
        self.pitch_bytes
    }

    fn size_bytes(&self) -> usize {
        self.size_bytes
    }
}

impl Drop for EmuMemory {
    fn drop(&mut self) {
        if let Err(err) = self.runtime.release(self.ptr) {
            tracing::warn!(error = %err, ptr = %self.ptr, "failed to free device memory");
        }
    }
}

impl fmt::Debug for EmuMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmuMemory")
            .field("ptr", &self.ptr)
            .field("pitch_bytes", &self.pitch_bytes)
            .field("size_bytes", &self.size_bytes)
            .finish()
    }
}

impl Device for DevEmu {
    type Memory = EmuMemory;

    fn name(&self) -> String {
        self.runtime.devices[self.id].name.clone()
    }

    fn native_id(&self) -> usize {
        self.id
    }

    fn mem_space(&self) -> MemSpace {
        MemSpace::Emu(self.id)
    }

    fn allocate(&self, row_bytes: usize, rows: usize, pitched: bool) -> Result<EmuMemory> {
        let rt = &self.runtime;
        let _scope = rt_check!("emu", "set_device", ScopedDevice::new(rt, self.id))?;
        let allocated = if pitched {
            rt.malloc_pitch(row_bytes, rows)
        } else {
            row_bytes
                .checked_mul(rows)
                .ok_or(EmuError::InvalidValue(format!("{rows} rows of {row_bytes} bytes overflow")))
                .and_then(|bytes| rt.malloc(bytes))
                .map(|ptr| (ptr, row_bytes))
        };
        let (ptr, pitch_bytes) = allocated.map_err(|err| match err {
            EmuError::MemoryAllocation { requested, .. } => BackendError::OutOfMemory {
                bytes: requested,
                device: self.name(),
            },
            other => BackendError::runtime("emu", "malloc", other, file!(), line!()),
        })?;
        Ok(EmuMemory {
            runtime: Arc::clone(rt),
            ptr,
            pitch_bytes,
            size_bytes: pitch_bytes * rows,
        })
    }

    fn wait_all(&self) -> Result<()> {
        let _scope = rt_check!("emu", "set_device", ScopedDevice::new(&self.runtime, self.id))?;
        let (synced, duration_us) = portacc_tracing::timed_block!("device_synchronize", {
            rt_check!("emu", "device_synchronize", self.runtime.device_synchronize())
        });
        portacc_tracing::perf_event!("wait_all", device = self.id, duration_us = duration_us);
        synced
    }
}

/// Platform over the process-wide [`EmuRuntime`].
pub struct PltfEmu;

impl Platform for PltfEmu {
    type Dev = DevEmu;

    fn name() -> &'static str {
        "emu"
    }

    fn dev_count() -> Result<usize> {
        rt_check!("emu", "device_count", EmuRuntime::global().device_count())
    }

    fn dev_by_idx(index: usize) -> Result<DevEmu> {
        DevEmu::from_runtime(EmuRuntime::global(), index)
    }
}
