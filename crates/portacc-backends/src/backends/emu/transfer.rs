//! Mapping of copy and set tasks onto the runtime's memcpy/memset calls.
//!
//! | rank | same device / host      | across devices        |
//! |------|-------------------------|-----------------------|
//! | 1    | `memcpy`                | `memcpy_peer`         |
//! | 2    | `memcpy_2d`             | `memcpy_3d_peer`      |
//! | 3    | `memcpy_3d`             | `memcpy_3d_peer`      |
//! | 4    | one `memcpy_3d` per slab| one peer call per slab|

use super::memory::{Extent3D, Memcpy3DParams, Memcpy3DPeerParams, MemcpyKind, PitchedPtr};
use super::runtime::{EmuResult, EmuRuntime};
use super::stream::Stream;
use crate::backend::MemSpace;
use crate::mem::{Region, TaskCopy, TaskSet};

fn memcpy_kind(dst: MemSpace, src: MemSpace) -> MemcpyKind {
    match (dst, src) {
        (MemSpace::Host, MemSpace::Host) => MemcpyKind::HostToHost,
        (MemSpace::Emu(_), MemSpace::Host) => MemcpyKind::HostToDevice,
        (MemSpace::Host, MemSpace::Emu(_)) => MemcpyKind::DeviceToHost,
        (MemSpace::Emu(_), MemSpace::Emu(_)) => MemcpyKind::DeviceToDevice,
    }
}

/// `(width bytes, rows, slices)` of the three fastest axes.
fn extent3<const D: usize>(task_extent: portacc_core::IdxVec<D>, elem_size: usize) -> Extent3D {
    let e = task_extent.vec_end::<3>(1);
    Extent3D::new(e[2] * elem_size, e[1], e[0])
}

/// Slabs of the slowest axis for rank 4, one slab otherwise.
fn slabs<const D: usize>(task_extent: portacc_core::IdxVec<D>) -> usize {
    if D == 4 {
        task_extent[0]
    } else {
        1
    }
}

fn pitched<const D: usize>(region: &Region<D>, slab: usize, elem_size: usize) -> PitchedPtr {
    let base = if D == 4 {
        region.ptr.byte_add(slab * region.stride(0, elem_size))
    } else {
        region.ptr
    };
    PitchedPtr::new(base, region.row_pitch(), region.rows_per_slice())
}

pub(crate) fn issue_copy<const D: usize>(rt: &EmuRuntime, stream: &Stream, task: &TaskCopy<D>) -> EmuResult<()> {
    let (dst, src) = (task.dst(), task.src());
    let extent = task.extent();
    let elem = task.elem_size();
    let width = task.width_bytes();
    let peer = match (dst.space, src.space) {
        (MemSpace::Emu(d), MemSpace::Emu(s)) if d != s => Some((d, s)),
        _ => None,
    };
    let kind = memcpy_kind(dst.space, src.space);

    match (D, peer) {
        (1, None) => rt.memcpy(dst.ptr, src.ptr, width, kind, Some(stream)),
        (1, Some((d, s))) => rt.memcpy_peer(dst.ptr, d, src.ptr, s, width, Some(stream)),
        (2, None) => rt.memcpy_2d(
            dst.ptr,
            dst.row_pitch(),
            src.ptr,
            src.row_pitch(),
            width,
            extent[0],
            kind,
            Some(stream),
        ),
        (_, peer) => {
            let extent3 = extent3(extent, elem);
            for slab in 0..slabs(extent) {
                let (dst3, src3) = (pitched(dst, slab, elem), pitched(src, slab, elem));
                match peer {
                    None => rt.memcpy_3d(
                        &Memcpy3DParams {
                            dst: dst3,
                            src: src3,
                            extent: extent3,
                            kind,
                        },
                        Some(stream),
                    )?,
                    Some((dst_device, src_device)) => rt.memcpy_3d_peer(
                        &Memcpy3DPeerParams {
                            dst: dst3,
                            dst_device,
                            src: src3,
                            src_device,
                            extent: extent3,
                        },
                        Some(stream),
                    )?,
                }
            }
            Ok(())
        }
    }
}

pub(crate) fn issue_set<const D: usize>(rt: &EmuRuntime, stream: &Stream, task: &TaskSet<D>) -> EmuResult<()> {
    let dst = task.dst();
    let extent = task.extent();
    let elem = task.elem_size();
    match D {
        1 => rt.memset(dst.ptr, task.value(), task.width_bytes(), Some(stream)),
        2 => rt.memset_2d(
            dst.ptr,
            dst.row_pitch(),
            task.value(),
            task.width_bytes(),
            extent[0],
            Some(stream),
        ),
        _ => {
            for slab in 0..slabs(extent) {
                rt.memset_3d(pitched(dst, slab, elem), task.value(), extent3(extent, elem), Some(stream))?;
            }
            Ok(())
        }
    }
}
