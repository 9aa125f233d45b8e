//! Backend implementations
//!
//! This module contains:
//! - `common` - Shared backend infrastructure (atomics, math, block-shared memory and barriers, execution helpers, workers)
//! - `cpu` - Host device with serial, rayon-parallel and thread-per-block-thread accelerators
//! - `emu` - Emulated GPU runtime, its devices, accelerator and stream-backed queues

pub mod common;
pub mod cpu;
pub mod emu;

// Re-export backends
pub use cpu::{AccCpuBlocks, AccCpuSerial, AccCpuThreads, CpuMemory, DevCpu, PltfCpu, QueueCpuAsync, QueueCpuSync};
pub use emu::{AccGpuEmu, DevEmu, EmuMemory, EmuRuntime, PltfEmu, QueueEmuAsync, QueueEmuSync};
