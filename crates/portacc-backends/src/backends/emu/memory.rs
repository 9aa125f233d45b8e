//! Device memory and the memcpy/memset family of the emulated runtime.
//!
//! Every allocation is registered by base address, so a pointer handed to a
//! transfer call can be classified as host or device memory and its byte
//! range checked against the allocation it falls into. All copies and sets
//! reduce to a pitched 3D walk over `(width bytes, height rows, depth
//! slices)`.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use portacc_tracing::performance::record_transfer;

use super::runtime::{EmuError, EmuResult, EmuRuntime};
use super::stream::{Stream, StreamOp};
use crate::backend::DevPtr;
use crate::backends::common::host_mem::HostAlloc;

/// Direction of a same-device transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemcpyKind {
    HostToHost,
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
}

impl MemcpyKind {
    fn label(self) -> &'static str {
        match self {
            MemcpyKind::HostToHost => "host_to_host",
            MemcpyKind::HostToDevice => "host_to_device",
            MemcpyKind::DeviceToHost => "device_to_host",
            MemcpyKind::DeviceToDevice => "device_to_device",
        }
    }

    fn src_side(self) -> Side {
        match self {
            MemcpyKind::HostToHost | MemcpyKind::HostToDevice => Side::Host,
            MemcpyKind::DeviceToHost | MemcpyKind::DeviceToDevice => Side::Device(None),
        }
    }

    fn dst_side(self) -> Side {
        match self {
            MemcpyKind::HostToHost | MemcpyKind::DeviceToHost => Side::Host,
            MemcpyKind::HostToDevice | MemcpyKind::DeviceToDevice => Side::Device(None),
        }
    }
}

impl fmt::Display for MemcpyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Pointer into a pitched 3D region: `pitch` bytes per row and `ysize`
/// rows per slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PitchedPtr {
    pub ptr: DevPtr,
    pub pitch: usize,
    pub ysize: usize,
}

impl PitchedPtr {
    pub fn new(ptr: DevPtr, pitch: usize, ysize: usize) -> Self {
        Self { ptr, pitch, ysize }
    }

    fn at(&self, row: usize, slice: usize) -> DevPtr {
        self.ptr.byte_add(slice * self.pitch * self.ysize + row * self.pitch)
    }
}

/// Transfer extent: `width` in bytes, `height` in rows, `depth` in slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent3D {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl Extent3D {
    pub fn new(width: usize, height: usize, depth: usize) -> Self {
        Self { width, height, depth }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.depth == 0
    }

    pub fn bytes(&self) -> usize {
        self.width * self.height * self.depth
    }

    /// Bytes between the first and one past the last touched byte.
    fn span(&self, p: &PitchedPtr) -> usize {
        if self.is_empty() {
            return 0;
        }
        p.pitch * p.ysize * (self.depth - 1) + p.pitch * (self.height - 1) + self.width
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Memcpy3DParams {
    pub dst: PitchedPtr,
    pub src: PitchedPtr,
    pub extent: Extent3D,
    pub kind: MemcpyKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Memcpy3DPeerParams {
    pub dst: PitchedPtr,
    pub dst_device: usize,
    pub src: PitchedPtr,
    pub src_device: usize,
    pub extent: Extent3D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Host,
    /// Device memory, optionally of one specific device.
    Device(Option<usize>),
}

struct DeviceAllocation {
    device: usize,
    block: HostAlloc,
}

pub(crate) struct MemoryRegistry {
    allocations: BTreeMap<usize, DeviceAllocation>,
    used: Vec<usize>,
}

impl MemoryRegistry {
    pub(crate) fn new(devices: usize) -> Self {
        Self {
            allocations: BTreeMap::new(),
            used: vec![0; devices],
        }
    }

    fn find(&self, addr: usize) -> Option<(usize, &DeviceAllocation)> {
        let (&base, alloc) = self.allocations.range(..=addr).next_back()?;
        (addr < base + alloc.block.len().max(1)).then_some((base, alloc))
    }
}

// SAFETY contract shared by the two walkers: every touched byte was checked
// against a live allocation (device side) or is the caller's host memory.
unsafe fn copy_pitched(dst: PitchedPtr, src: PitchedPtr, extent: Extent3D) {
    let dense = |p: &PitchedPtr| p.pitch == extent.width && (extent.depth == 1 || p.ysize == extent.height);
    if dense(&dst) && dense(&src) {
        std::ptr::copy(src.ptr.as_ptr(), dst.ptr.as_ptr(), extent.bytes());
        return;
    }
    for slice in 0..extent.depth {
        for row in 0..extent.height {
            std::ptr::copy(src.at(row, slice).as_ptr(), dst.at(row, slice).as_ptr(), extent.width);
        }
    }
}

unsafe fn fill_pitched(dst: PitchedPtr, value: u8, extent: Extent3D) {
    for slice in 0..extent.depth {
        for row in 0..extent.height {
            std::ptr::write_bytes(dst.at(row, slice).as_ptr(), value, extent.width);
        }
    }
}

impl EmuRuntime {
    /// Allocate `bytes` bytes on the current device.
    pub fn malloc(&self, bytes: usize) -> EmuResult<DevPtr> {
        self.check_callback()?;
        let device = self.get_device()?;
        self.allocate(device, bytes)
    }

    /// Allocate `height` rows of at least `width` bytes on the current
    /// device; returns the pointer and the row pitch.
    pub fn malloc_pitch(&self, width: usize, height: usize) -> EmuResult<(DevPtr, usize)> {
        self.check_callback()?;
        let device = self.get_device()?;
        let align = self.pitch_alignment;
        let pitch = width
            .checked_next_multiple_of(align)
            .ok_or_else(|| EmuError::InvalidValue(format!("row width {width} overflows")))?;
        let bytes = pitch
            .checked_mul(height)
            .ok_or_else(|| EmuError::InvalidValue(format!("{height} rows of {pitch} bytes overflow")))?;
        Ok((self.allocate(device, bytes)?, pitch))
    }

    fn allocate(&self, device: usize, bytes: usize) -> EmuResult<DevPtr> {
        if bytes == 0 {
            return Err(EmuError::InvalidValue("zero-byte allocation".to_string()));
        }
        let total = self.devices[device].total_global_mem;
        let mut registry = self.memory.lock();
        let available = total.saturating_sub(registry.used[device]);
        if bytes > available {
            return Err(EmuError::MemoryAllocation { requested: bytes, available });
        }
        let block = HostAlloc::zeroed(bytes, self.pitch_alignment)
            .ok_or(EmuError::MemoryAllocation { requested: bytes, available })?;
        let ptr = DevPtr::new(block.as_ptr());
        registry.used[device] += bytes;
        registry.allocations.insert(ptr.addr(), DeviceAllocation { device, block });
        tracing::trace!(device, bytes, %ptr, "device allocation");
        Ok(ptr)
    }

    pub fn free(&self, ptr: DevPtr) -> EmuResult<()> {
        self.check_callback()?;
        self.release(ptr)
    }

    /// Free without the callback restriction; used when a buffer's last
    /// handle is dropped on a stream thread.
    pub(crate) fn release(&self, ptr: DevPtr) -> EmuResult<()> {
        let mut registry = self.memory.lock();
        let alloc = registry
            .allocations
            .remove(&ptr.addr())
            .ok_or(EmuError::InvalidDevicePointer(ptr.addr()))?;
        registry.used[alloc.device] -= alloc.block.len();
        Ok(())
    }

    /// Bytes currently allocated on `device`.
    pub fn mem_used(&self, device: usize) -> EmuResult<usize> {
        self.check_device(device)?;
        Ok(self.memory.lock().used[device])
    }

    /// Device owning the allocation `ptr` points into.
    pub fn pointer_device(&self, ptr: DevPtr) -> Option<usize> {
        self.memory.lock().find(ptr.addr()).map(|(_, alloc)| alloc.device)
    }

    pub fn memcpy(&self, dst: DevPtr, src: DevPtr, bytes: usize, kind: MemcpyKind, stream: Option<&Stream>) -> EmuResult<()> {
        self.memcpy_2d(dst, bytes, src, bytes, bytes, 1, kind, stream)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn memcpy_2d(
        &self,
        dst: DevPtr,
        dst_pitch: usize,
        src: DevPtr,
        src_pitch: usize,
        width: usize,
        height: usize,
        kind: MemcpyKind,
        stream: Option<&Stream>,
    ) -> EmuResult<()> {
        self.memcpy_3d(
            &Memcpy3DParams {
                dst: PitchedPtr::new(dst, dst_pitch, height),
                src: PitchedPtr::new(src, src_pitch, height),
                extent: Extent3D::new(width, height, 1),
                kind,
            },
            stream,
        )
    }

    pub fn memcpy_3d(&self, params: &Memcpy3DParams, stream: Option<&Stream>) -> EmuResult<()> {
        self.transfer(
            params.dst,
            params.kind.dst_side(),
            params.src,
            params.kind.src_side(),
            params.extent,
            params.kind.label(),
            stream,
        )
    }

    pub fn memcpy_peer(
        &self,
        dst: DevPtr,
        dst_device: usize,
        src: DevPtr,
        src_device: usize,
        bytes: usize,
        stream: Option<&Stream>,
    ) -> EmuResult<()> {
        self.memcpy_3d_peer(
            &Memcpy3DPeerParams {
                dst: PitchedPtr::new(dst, bytes, 1),
                dst_device,
                src: PitchedPtr::new(src, bytes, 1),
                src_device,
                extent: Extent3D::new(bytes, 1, 1),
            },
            stream,
        )
    }

    pub fn memcpy_3d_peer(&self, params: &Memcpy3DPeerParams, stream: Option<&Stream>) -> EmuResult<()> {
        self.check_device(params.dst_device)?;
        self.check_device(params.src_device)?;
        self.transfer(
            params.dst,
            Side::Device(Some(params.dst_device)),
            params.src,
            Side::Device(Some(params.src_device)),
            params.extent,
            "peer",
            stream,
        )
    }

    pub fn memset(&self, dst: DevPtr, value: u8, bytes: usize, stream: Option<&Stream>) -> EmuResult<()> {
        self.memset_3d(PitchedPtr::new(dst, bytes, 1), value, Extent3D::new(bytes, 1, 1), stream)
    }

    pub fn memset_2d(
        &self,
        dst: DevPtr,
        pitch: usize,
        value: u8,
        width: usize,
        height: usize,
        stream: Option<&Stream>,
    ) -> EmuResult<()> {
        self.memset_3d(PitchedPtr::new(dst, pitch, height), value, Extent3D::new(width, height, 1), stream)
    }

    pub fn memset_3d(&self, dst: PitchedPtr, value: u8, extent: Extent3D, stream: Option<&Stream>) -> EmuResult<()> {
        self.check_callback()?;
        self.check_access("destination", &dst, &extent, Side::Device(None))?;
        if extent.is_empty() {
            return Ok(());
        }
        self.dispatch(
            stream,
            Box::new(move || {
                // SAFETY: range validated against a live allocation above.
                unsafe { fill_pitched(dst, value, extent) };
                Ok(())
            }),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn transfer(
        &self,
        dst: PitchedPtr,
        dst_side: Side,
        src: PitchedPtr,
        src_side: Side,
        extent: Extent3D,
        direction: &'static str,
        stream: Option<&Stream>,
    ) -> EmuResult<()> {
        self.check_callback()?;
        self.check_access("destination", &dst, &extent, dst_side)?;
        self.check_access("source", &src, &extent, src_side)?;
        if extent.is_empty() {
            return Ok(());
        }
        self.dispatch(
            stream,
            Box::new(move || {
                let start = Instant::now();
                // SAFETY: both ranges validated above.
                unsafe { copy_pitched(dst, src, extent) };
                record_transfer(extent.bytes(), direction, start.elapsed().as_micros() as u64);
                Ok(())
            }),
        )
    }

    /// Run `op` now, or in order on `stream`.
    fn dispatch(&self, stream: Option<&Stream>, op: Box<dyn FnOnce() -> EmuResult<()> + Send>) -> EmuResult<()> {
        match stream {
            Some(stream) => {
                stream.push(StreamOp::Work(op));
                Ok(())
            }
            None => op(),
        }
    }

    fn check_access(&self, what: &str, p: &PitchedPtr, extent: &Extent3D, side: Side) -> EmuResult<()> {
        if extent.is_empty() {
            return Ok(());
        }
        if p.ptr.is_null() {
            return Err(EmuError::InvalidValue(format!("{what} pointer is null")));
        }
        if extent.width > p.pitch {
            return Err(EmuError::InvalidPitchValue {
                width: extent.width,
                pitch: p.pitch,
            });
        }
        if extent.depth > 1 && extent.height > p.ysize {
            return Err(EmuError::InvalidValue(format!(
                "{what} height {} exceeds its slice height {}",
                extent.height, p.ysize
            )));
        }

        let addr = p.ptr.addr();
        let registry = self.memory.lock();
        match (side, registry.find(addr)) {
            (Side::Host, None) => Ok(()),
            (Side::Host, Some(_)) => Err(EmuError::InvalidMemcpyDirection(format!(
                "{what} {} is device memory",
                p.ptr
            ))),
            (Side::Device(_), None) => Err(EmuError::InvalidDevicePointer(addr)),
            (Side::Device(expected), Some((base, alloc))) => {
                if let Some(device) = expected {
                    if device != alloc.device {
                        return Err(EmuError::InvalidValue(format!(
                            "{what} {} belongs to device {}, not device {device}",
                            p.ptr, alloc.device
                        )));
                    }
                }
                if addr + extent.span(p) > base + alloc.block.len() {
                    return Err(EmuError::InvalidValue(format!(
                        "{what} range of {} bytes at {} exceeds its allocation",
                        extent.span(p),
                        p.ptr
                    )));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portacc_core::RuntimeConfig;
    use std::sync::Arc;

    fn runtime() -> Arc<EmuRuntime> {
        EmuRuntime::new(&RuntimeConfig {
            emu_device_count: 2,
            emu_global_mem_bytes: 1 << 20,
            ..RuntimeConfig::default()
        })
    }

    fn upload(rt: &EmuRuntime, host: &[u8]) -> DevPtr {
        let ptr = rt.malloc(host.len()).unwrap();
        rt.memcpy(ptr, DevPtr::new(host.as_ptr() as *mut u8), host.len(), MemcpyKind::HostToDevice, None)
            .unwrap();
        ptr
    }

    fn download(rt: &EmuRuntime, ptr: DevPtr, len: usize) -> Vec<u8> {
        let mut host = vec![0u8; len];
        rt.memcpy(DevPtr::new(host.as_mut_ptr()), ptr, len, MemcpyKind::DeviceToHost, None)
            .unwrap();
        host
    }

    #[test]
    fn test_malloc_accounting_and_free() {
        let rt = runtime();
        rt.set_device(0).unwrap();
        let ptr = rt.malloc(1000).unwrap();
        assert_eq!(rt.mem_used(0).unwrap(), 1000);
        assert_eq!(rt.pointer_device(ptr.byte_add(999)), Some(0));
        assert_eq!(rt.pointer_device(ptr.byte_add(1000)), None);
        rt.free(ptr).unwrap();
        assert_eq!(rt.mem_used(0).unwrap(), 0);
        assert_eq!(rt.free(ptr), Err(EmuError::InvalidDevicePointer(ptr.addr())));
    }

    #[test]
    fn test_malloc_pitch_rounds_rows() {
        let rt = runtime();
        rt.set_device(1).unwrap();
        let (ptr, pitch) = rt.malloc_pitch(300, 4).unwrap();
        assert_eq!(pitch, 512);
        assert_eq!(ptr.addr() % 256, 0);
        assert_eq!(rt.mem_used(1).unwrap(), 2048);
        rt.free(ptr).unwrap();
        rt.set_device(0).unwrap();
    }

    #[test]
    fn test_out_of_memory() {
        let rt = runtime();
        rt.set_device(0).unwrap();
        let err = rt.malloc(2 << 20).unwrap_err();
        assert_eq!(
            err,
            EmuError::MemoryAllocation {
                requested: 2 << 20,
                available: 1 << 20
            }
        );
    }

    #[test]
    fn test_round_trip() {
        let rt = runtime();
        rt.set_device(0).unwrap();
        let data: Vec<u8> = (0..=255).collect();
        let ptr = upload(&rt, &data);
        assert_eq!(download(&rt, ptr, data.len()), data);
    }

    #[test]
    fn test_direction_is_checked() {
        let rt = runtime();
        rt.set_device(0).unwrap();
        let ptr = rt.malloc(16).unwrap();
        let mut host = [0u8; 16];
        let host_ptr = DevPtr::new(host.as_mut_ptr());

        let err = rt.memcpy(host_ptr, ptr, 16, MemcpyKind::HostToDevice, None).unwrap_err();
        assert!(matches!(err, EmuError::InvalidDevicePointer(_)));
        let err = rt.memcpy(host_ptr, ptr, 16, MemcpyKind::HostToHost, None).unwrap_err();
        assert!(matches!(err, EmuError::InvalidMemcpyDirection(_)));
    }

    #[test]
    fn test_range_beyond_allocation_is_rejected() {
        let rt = runtime();
        rt.set_device(0).unwrap();
        let ptr = rt.malloc(16).unwrap();
        let err = rt.memset(ptr.byte_add(8), 0, 9, None).unwrap_err();
        assert!(matches!(err, EmuError::InvalidValue(_)));
        rt.memset(ptr.byte_add(8), 7, 8, None).unwrap();
        assert_eq!(download(&rt, ptr, 16)[8..], [7; 8]);
    }

    #[test]
    fn test_memset_2d_leaves_padding() {
        let rt = runtime();
        rt.set_device(0).unwrap();
        let (ptr, pitch) = rt.malloc_pitch(10, 3).unwrap();
        rt.memset_2d(ptr, pitch, 0xAB, 10, 3, None).unwrap();
        let bytes = download(&rt, ptr, pitch * 3);
        for row in bytes.chunks(pitch) {
            assert_eq!(row[..10], [0xAB; 10]);
            assert!(row[10..].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_memcpy_3d_between_pitched_regions() {
        let rt = runtime();
        rt.set_device(0).unwrap();
        // 2 slices of 3 rows of 4 bytes
        let host: Vec<u8> = (0..24).collect();
        let (dev, pitch) = rt.malloc_pitch(4, 6).unwrap();
        rt.memcpy_3d(
            &Memcpy3DParams {
                dst: PitchedPtr::new(dev, pitch, 3),
                src: PitchedPtr::new(DevPtr::new(host.as_ptr() as *mut u8), 4, 3),
                extent: Extent3D::new(4, 3, 2),
                kind: MemcpyKind::HostToDevice,
            },
            None,
        )
        .unwrap();
        let raw = download(&rt, dev, pitch * 6);
        assert_eq!(raw[..4], [0, 1, 2, 3]);
        assert_eq!(raw[pitch * 3..pitch * 3 + 4], [12, 13, 14, 15]);
        assert_eq!(raw[4], 0);
    }

    #[test]
    fn test_peer_copy_checks_devices() {
        let rt = runtime();
        rt.set_device(0).unwrap();
        let a = upload(&rt, &[5u8; 32]);
        rt.set_device(1).unwrap();
        let b = rt.malloc(32).unwrap();

        let err = rt.memcpy_peer(b, 0, a, 0, 32, None).unwrap_err();
        assert!(matches!(err, EmuError::InvalidValue(_)));
        assert_eq!(rt.memcpy_peer(b, 1, a, 2, 32, None), Err(EmuError::InvalidDevice(2)));

        rt.memcpy_peer(b, 1, a, 0, 32, None).unwrap();
        assert_eq!(download(&rt, b, 32), vec![5u8; 32]);
        rt.set_device(0).unwrap();
    }

    #[test]
    fn test_width_beyond_pitch_is_rejected() {
        let rt = runtime();
        rt.set_device(0).unwrap();
        let ptr = rt.malloc(64).unwrap();
        assert_eq!(
            rt.memset_2d(ptr, 8, 0, 9, 2, None),
            Err(EmuError::InvalidPitchValue { width: 9, pitch: 8 })
        );
    }
}
