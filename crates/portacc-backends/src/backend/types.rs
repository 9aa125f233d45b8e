//! Shared handle and descriptor types

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use portacc_core::IdxVec;

/// Address space a pointer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemSpace {
    /// Host memory, reachable from every CPU accelerator.
    Host,
    /// Memory of one emulated GPU device.
    Emu(usize),
}

impl fmt::Display for MemSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemSpace::Host => f.write_str("host"),
            MemSpace::Emu(id) => write!(f, "emu:{id}"),
        }
    }
}

/// Raw byte pointer that may cross threads.
///
/// Tasks carry pointers into buffers they keep alive through a
/// [`KeepAlive`]; this wrapper only lifts the `Send`/`Sync` restriction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevPtr(*mut u8);

// SAFETY: DevPtr is an address; every dereference is an explicit unsafe
// operation whose caller guarantees validity.
unsafe impl Send for DevPtr {}
unsafe impl Sync for DevPtr {}

impl DevPtr {
    pub const fn new(ptr: *mut u8) -> Self {
        Self(ptr)
    }

    pub const fn null() -> Self {
        Self(std::ptr::null_mut())
    }

    pub const fn as_ptr(self) -> *mut u8 {
        self.0
    }

    pub fn addr(self) -> usize {
        self.0 as usize
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    /// Pointer `bytes` further on, without dereferencing.
    pub fn byte_add(self, bytes: usize) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl fmt::Display for DevPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.0)
    }
}

/// Type-erased owner that keeps a buffer's memory alive while a task runs.
pub type KeepAlive = Arc<dyn Any + Send + Sync>;

/// Three hardware axes, fastest first, as used by GPU-style launch APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dim3 {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl Dim3 {
    pub const fn new(x: usize, y: usize, z: usize) -> Self {
        Self { x, y, z }
    }

    /// Map the three fastest axes of `v` onto `x`, `y`, `z`.
    ///
    /// Axes slower than `z` are dropped; callers validate that they are 1.
    pub fn from_vec<const D: usize>(v: IdxVec<D>) -> Self {
        let v3 = v.vec_end::<3>(1);
        Self::new(v3[2], v3[1], v3[0])
    }

    pub fn total(&self) -> usize {
        self.x.saturating_mul(self.y).saturating_mul(self.z)
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// A generic deferred callable enqueued like any other task.
pub struct TaskHost {
    name: &'static str,
    func: Box<dyn FnOnce() + Send + 'static>,
}

impl TaskHost {
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            name: std::any::type_name::<F>(),
            func: Box::new(func),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn run(self) {
        (self.func)()
    }
}

impl fmt::Debug for TaskHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHost").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_dim3_from_vec() {
        assert_eq!(Dim3::from_vec(IdxVec::new([7])), Dim3::new(7, 1, 1));
        assert_eq!(Dim3::from_vec(IdxVec::new([2, 3, 4])), Dim3::new(4, 3, 2));
        assert_eq!(Dim3::from_vec(IdxVec::new([1, 2, 3, 4])), Dim3::new(4, 3, 2));
        assert_eq!(Dim3::new(2, 3, 4).total(), 24);
    }

    #[test]
    fn test_mem_space_display() {
        assert_eq!(MemSpace::Host.to_string(), "host");
        assert_eq!(MemSpace::Emu(1).to_string(), "emu:1");
    }

    #[test]
    fn test_dev_ptr_offsets() {
        let mut bytes = [0u8; 8];
        let base = DevPtr::new(bytes.as_mut_ptr());
        assert_eq!(base.byte_add(3).addr(), base.addr() + 3);
        assert!(DevPtr::null().is_null());
    }

    #[test]
    fn test_task_host_runs_once() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let task = TaskHost::new(move || flag.store(true, Ordering::SeqCst));
        assert!(task.name().contains("closure"));
        task.run();
        assert!(ran.load(Ordering::SeqCst));
    }
}
