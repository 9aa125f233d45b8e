//! Emulated GPU runtime
//!
//! A software implementation of a CUDA/HIP-style runtime API: N logical
//! devices selected through per-thread "current device" state, stream-ordered
//! asynchronous execution, pitched allocations, host callbacks and
//! launch-time hardware limit checks. Calls return [`EmuResult`] status
//! values; accelerator code converts them with [`rt_check!`](crate::rt_check).
//!
//! The memory API lives in `memory.rs` and the stream API in `stream.rs`;
//! both extend [`EmuRuntime`].

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use portacc_core::RuntimeConfig;

use super::memory::MemoryRegistry;
use super::stream::{Stream, StreamOp, StreamShared};
use crate::backend::Dim3;

/// Status of a failed runtime call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmuError {
    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid device ordinal {0}")]
    InvalidDevice(usize),

    #[error("out of memory: {requested} bytes requested, {available} available")]
    MemoryAllocation { requested: usize, available: usize },

    #[error("invalid device pointer {0:#x}")]
    InvalidDevicePointer(usize),

    #[error("invalid pitch value: width {width} exceeds pitch {pitch}")]
    InvalidPitchValue { width: usize, pitch: usize },

    #[error("invalid memcpy direction: {0}")]
    InvalidMemcpyDirection(String),

    #[error("invalid configuration argument: {0}")]
    InvalidConfiguration(String),

    #[error("invalid resource handle: {0}")]
    InvalidResourceHandle(String),

    #[error("operation not permitted inside a stream callback")]
    NotPermitted,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("unspecified launch failure: {0}")]
    LaunchFailure(String),
}

pub type EmuResult<T> = std::result::Result<T, EmuError>;

/// Hardware description of one emulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmuDeviceProps {
    pub name: String,
    /// Maximum grid size as `[x, y, z]`.
    pub max_grid_size: [usize; 3],
    /// Maximum block size as `[x, y, z]`.
    pub max_threads_dim: [usize; 3],
    pub max_threads_per_block: usize,
    pub multi_processor_count: usize,
    pub shared_mem_per_block: usize,
    pub total_global_mem: usize,
    pub texture_pitch_alignment: usize,
}

impl EmuDeviceProps {
    fn from_config(index: usize, config: &RuntimeConfig) -> Self {
        let threads = config.emu_max_threads_per_block;
        Self {
            name: format!("portacc emulated GPU {index}"),
            max_grid_size: [i32::MAX as usize, 65_535, 65_535],
            max_threads_dim: [threads, threads, threads.min(64)],
            max_threads_per_block: threads,
            multi_processor_count: 8,
            shared_mem_per_block: config.emu_shared_mem_bytes,
            total_global_mem: config.emu_global_mem_bytes,
            texture_pitch_alignment: config.emu_pitch_alignment,
        }
    }
}

thread_local! {
    static CURRENT_DEVICE: Cell<usize> = const { Cell::new(0) };
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// Run `f` with the calling thread marked as a stream callback.
pub(crate) fn in_callback<R>(f: impl FnOnce() -> R) -> R {
    IN_CALLBACK.with(|flag| flag.set(true));
    let result = f();
    IN_CALLBACK.with(|flag| flag.set(false));
    result
}

pub(crate) fn set_thread_device(device: usize) {
    CURRENT_DEVICE.with(|current| current.set(device));
}

/// One emulated runtime instance with its devices, memory and streams.
pub struct EmuRuntime {
    pub(crate) devices: Vec<EmuDeviceProps>,
    pub(crate) pitch_alignment: usize,
    pub(crate) memory: Mutex<MemoryRegistry>,
    pub(crate) streams: Mutex<Vec<Weak<StreamShared>>>,
    pub(crate) next_stream_id: AtomicU64,
}

impl EmuRuntime {
    pub fn new(config: &RuntimeConfig) -> Arc<Self> {
        let devices: Vec<_> = (0..config.emu_device_count)
            .map(|index| EmuDeviceProps::from_config(index, config))
            .collect();
        tracing::debug!(devices = devices.len(), "initialised emulated runtime");
        Arc::new(Self {
            memory: Mutex::new(MemoryRegistry::new(devices.len())),
            devices,
            pitch_alignment: config.emu_pitch_alignment,
            streams: Mutex::new(Vec::new()),
            next_stream_id: AtomicU64::new(1),
        })
    }

    /// The process-wide runtime, configured from [`RuntimeConfig::global`].
    pub fn global() -> &'static Arc<EmuRuntime> {
        static GLOBAL: OnceLock<Arc<EmuRuntime>> = OnceLock::new();
        GLOBAL.get_or_init(|| Self::new(RuntimeConfig::global()))
    }

    /// Runtime calls are not allowed from inside a stream callback.
    pub(crate) fn check_callback(&self) -> EmuResult<()> {
        if IN_CALLBACK.with(Cell::get) {
            return Err(EmuError::NotPermitted);
        }
        Ok(())
    }

    pub(crate) fn check_device(&self, device: usize) -> EmuResult<()> {
        if device >= self.devices.len() {
            return Err(EmuError::InvalidDevice(device));
        }
        Ok(())
    }

    pub fn device_count(&self) -> EmuResult<usize> {
        self.check_callback()?;
        Ok(self.devices.len())
    }

    pub fn device_props(&self, device: usize) -> EmuResult<EmuDeviceProps> {
        self.check_callback()?;
        self.check_device(device)?;
        Ok(self.devices[device].clone())
    }

    /// Select the calling thread's current device.
    pub fn set_device(&self, device: usize) -> EmuResult<()> {
        self.check_callback()?;
        self.check_device(device)?;
        set_thread_device(device);
        Ok(())
    }

    pub fn get_device(&self) -> EmuResult<usize> {
        self.check_callback()?;
        Ok(CURRENT_DEVICE.with(Cell::get))
    }

    /// Wait for every stream of the current device; reports the first
    /// sticky error.
    pub fn device_synchronize(&self) -> EmuResult<()> {
        let device = self.get_device()?;
        let streams: Vec<_> = {
            let mut streams = self.streams.lock();
            streams.retain(|s| s.strong_count() > 0);
            streams.iter().filter_map(Weak::upgrade).filter(|s| s.device() == device).collect()
        };
        let mut first_err = None;
        for stream in streams {
            if let Err(err) = stream.wait_idle() {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Validate a launch against the current device's limits and queue
    /// `body` on `stream`.
    ///
    /// `body` runs the grid; its error becomes the stream's sticky error.
    pub fn launch_kernel(
        &self,
        stream: &Stream,
        grid: Dim3,
        block: Dim3,
        shared_mem_bytes: usize,
        body: Box<dyn FnOnce() -> EmuResult<()> + Send>,
    ) -> EmuResult<()> {
        let device = self.get_device()?;
        if stream.device() != device {
            return Err(EmuError::InvalidResourceHandle(format!(
                "stream {} belongs to device {}, current device is {device}",
                stream.id(),
                stream.device()
            )));
        }
        let props = &self.devices[device];

        if grid.total() == 0 || block.total() == 0 {
            return Err(EmuError::InvalidConfiguration(format!("empty launch grid {grid} block {block}")));
        }
        let block_dims = [block.x, block.y, block.z];
        let grid_dims = [grid.x, grid.y, grid.z];
        for axis in 0..3 {
            if block_dims[axis] > props.max_threads_dim[axis] {
                return Err(EmuError::InvalidConfiguration(format!(
                    "block {block} exceeds the maximum block dimension {} on axis {axis}",
                    props.max_threads_dim[axis]
                )));
            }
            if grid_dims[axis] > props.max_grid_size[axis] {
                return Err(EmuError::InvalidConfiguration(format!(
                    "grid {grid} exceeds the maximum grid dimension {} on axis {axis}",
                    props.max_grid_size[axis]
                )));
            }
        }
        if block.total() > props.max_threads_per_block {
            return Err(EmuError::InvalidConfiguration(format!(
                "{} threads per block exceed the maximum of {}",
                block.total(),
                props.max_threads_per_block
            )));
        }
        if shared_mem_bytes > props.shared_mem_per_block {
            return Err(EmuError::InvalidConfiguration(format!(
                "{shared_mem_bytes} bytes of dynamic shared memory exceed the maximum of {}",
                props.shared_mem_per_block
            )));
        }

        tracing::trace!(device, stream = stream.id(), %grid, %block, shared_mem_bytes, "launch");
        stream.push(StreamOp::Work(body));
        Ok(())
    }

    /// Queue host work on `stream`, ordered with device work.
    pub(crate) fn stream_push_work(
        &self,
        stream: &Stream,
        work: Box<dyn FnOnce() -> EmuResult<()> + Send>,
    ) -> EmuResult<()> {
        self.check_callback()?;
        stream.push(StreamOp::Work(work));
        Ok(())
    }
}

impl fmt::Debug for EmuRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmuRuntime")
            .field("devices", &self.devices.len())
            .field("pitch_alignment", &self.pitch_alignment)
            .finish()
    }
}

/// Makes a device current for the lifetime of the guard.
pub(crate) struct ScopedDevice<'a> {
    runtime: &'a EmuRuntime,
    previous: usize,
}

impl<'a> ScopedDevice<'a> {
    pub(crate) fn new(runtime: &'a EmuRuntime, device: usize) -> EmuResult<Self> {
        let previous = runtime.get_device()?;
        runtime.set_device(device)?;
        Ok(Self { runtime, previous })
    }
}

impl Drop for ScopedDevice<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.runtime.set_device(self.previous) {
            tracing::warn!(error = %err, "failed to restore the current device");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(devices: usize) -> Arc<EmuRuntime> {
        EmuRuntime::new(&RuntimeConfig {
            emu_device_count: devices,
            emu_max_threads_per_block: 64,
            ..RuntimeConfig::default()
        })
    }

    #[test]
    fn test_current_device_is_per_thread() {
        let rt = runtime(3);
        rt.set_device(2).unwrap();
        assert_eq!(rt.get_device().unwrap(), 2);
        let other = std::thread::spawn({
            let rt = Arc::clone(&rt);
            move || rt.get_device().unwrap()
        });
        assert_eq!(other.join().unwrap(), 0);
        assert_eq!(rt.set_device(3), Err(EmuError::InvalidDevice(3)));
        rt.set_device(0).unwrap();
    }

    #[test]
    fn test_scoped_device_restores_previous() {
        let rt = runtime(2);
        rt.set_device(0).unwrap();
        {
            let _scope = ScopedDevice::new(&rt, 1).unwrap();
            assert_eq!(rt.get_device().unwrap(), 1);
        }
        assert_eq!(rt.get_device().unwrap(), 0);
    }

    #[test]
    fn test_props_follow_config() {
        let rt = runtime(1);
        let props = rt.device_props(0).unwrap();
        assert_eq!(props.max_threads_per_block, 64);
        assert_eq!(props.max_threads_dim, [64, 64, 64]);
        assert_eq!(props.texture_pitch_alignment, 256);
        assert!(rt.device_props(1).is_err());
    }

    #[test]
    fn test_launch_limits_are_checked() {
        let rt = runtime(1);
        rt.set_device(0).unwrap();
        let stream = rt.stream_create().unwrap();
        let body = || -> Box<dyn FnOnce() -> EmuResult<()> + Send> { Box::new(|| Ok(())) };

        let too_many = rt.launch_kernel(&stream, Dim3::new(1, 1, 1), Dim3::new(16, 8, 1), 0, body());
        assert!(matches!(too_many, Err(EmuError::InvalidConfiguration(_))));

        let empty = rt.launch_kernel(&stream, Dim3::new(0, 1, 1), Dim3::new(1, 1, 1), 0, body());
        assert!(matches!(empty, Err(EmuError::InvalidConfiguration(_))));

        let shared = rt.launch_kernel(&stream, Dim3::new(1, 1, 1), Dim3::new(1, 1, 1), 1 << 20, body());
        assert!(matches!(shared, Err(EmuError::InvalidConfiguration(_))));

        rt.launch_kernel(&stream, Dim3::new(4, 2, 1), Dim3::new(64, 1, 1), 0, body()).unwrap();
        rt.stream_synchronize(&stream).unwrap();
    }

    #[test]
    fn test_launch_on_foreign_stream_is_rejected() {
        let rt = runtime(2);
        rt.set_device(1).unwrap();
        let stream = rt.stream_create().unwrap();
        rt.set_device(0).unwrap();
        let result = rt.launch_kernel(&stream, Dim3::new(1, 1, 1), Dim3::new(1, 1, 1), 0, Box::new(|| Ok(())));
        assert!(matches!(result, Err(EmuError::InvalidResourceHandle(_))));
    }
}
