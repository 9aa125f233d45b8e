//! Per-block state shared by the threads of one block: shared memory and
//! the block barrier.

use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic;

use bytemuck::Pod;
use parking_lot::{Condvar, Mutex};

use super::host_mem::HostAlloc;
use crate::error::{BackendError, Result};

const SHARED_MEM_ALIGN: usize = 64;

/// Typed window into block-shared memory.
///
/// Every thread of a block that asks for the same id receives a slice over
/// the same bytes. Accesses from different threads must be ordered by a
/// block barrier or go through atomics.
pub struct SharedSlice<T> {
    ptr: *mut T,
    len: usize,
    _elem: PhantomData<T>,
}

impl<T> Clone for SharedSlice<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SharedSlice<T> {}

// SAFETY: the slice is a view into block-shared memory whose lifetime spans
// the block; data races are excluded by the unsafe accessors' contract.
unsafe impl<T: Send> Send for SharedSlice<T> {}
unsafe impl<T: Send> Sync for SharedSlice<T> {}

impl<T: Pod> SharedSlice<T> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pointer to element `i`, suitable for the atomic capability.
    ///
    /// # Panics
    ///
    /// When `i` is out of bounds.
    pub fn ptr_at(&self, i: usize) -> *mut T {
        assert!(i < self.len, "shared memory index {i} out of bounds (len {})", self.len);
        self.ptr.wrapping_add(i)
    }

    /// # Safety
    ///
    /// No other thread may write element `i` concurrently.
    pub unsafe fn get(&self, i: usize) -> T {
        self.ptr_at(i).read()
    }

    /// # Safety
    ///
    /// No other thread may access element `i` concurrently.
    pub unsafe fn set(&self, i: usize, value: T) {
        self.ptr_at(i).write(value)
    }
}

struct Slot {
    offset: usize,
    len: usize,
    type_id: TypeId,
}

#[derive(Default)]
struct StaticSlots {
    next: usize,
    by_id: HashMap<u32, Slot>,
}

/// Shared memory of one block.
///
/// Static allocations are bump-allocated by id from a fixed arena; the
/// dynamic region is sized per launch.
pub struct BlockSharedMem {
    arena: HostAlloc,
    slots: Mutex<StaticSlots>,
    dyn_mem: HostAlloc,
}

impl BlockSharedMem {
    pub(crate) fn new(static_bytes: usize, dyn_bytes: usize) -> Result<Self> {
        let alloc = |bytes: usize| {
            HostAlloc::zeroed(bytes, SHARED_MEM_ALIGN).ok_or_else(|| BackendError::OutOfMemory {
                bytes,
                device: "block shared memory".to_string(),
            })
        };
        Ok(Self {
            arena: alloc(static_bytes)?,
            slots: Mutex::new(StaticSlots::default()),
            dyn_mem: alloc(dyn_bytes)?,
        })
    }

    /// Static shared array `id` with `len` elements.
    ///
    /// # Panics
    ///
    /// When the arena is exhausted, or when `id` was already declared in this
    /// block with another type or length.
    pub fn alloc_static<T: Pod>(&self, id: u32, len: usize) -> SharedSlice<T> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.by_id.get(&id) {
            assert!(
                slot.type_id == TypeId::of::<T>() && slot.len == len,
                "shared variable {id} redeclared with a different type or length"
            );
            return self.slice_at(slot.offset, len);
        }

        let align = std::mem::align_of::<T>();
        let offset = slots.next.next_multiple_of(align);
        let end = offset + len * std::mem::size_of::<T>();
        assert!(
            end <= self.arena.len(),
            "block shared memory exhausted: {end} bytes requested, {} available",
            self.arena.len()
        );
        slots.by_id.insert(
            id,
            Slot {
                offset,
                len,
                type_id: TypeId::of::<T>(),
            },
        );
        slots.next = end;
        self.slice_at(offset, len)
    }

    /// The launch's dynamic shared memory viewed as `T`s.
    pub fn dyn_slice<T: Pod>(&self) -> SharedSlice<T> {
        SharedSlice {
            ptr: self.dyn_mem.as_ptr().cast(),
            len: self.dyn_mem.len() / std::mem::size_of::<T>().max(1),
            _elem: PhantomData,
        }
    }

    /// Forget all static declarations before the next block runs.
    pub(crate) fn reset(&self) {
        let mut slots = self.slots.lock();
        slots.next = 0;
        slots.by_id.clear();
    }

    fn slice_at<T>(&self, offset: usize, len: usize) -> SharedSlice<T> {
        SharedSlice {
            ptr: self.arena.as_ptr().wrapping_add(offset).cast(),
            len,
            _elem: PhantomData,
        }
    }
}

/// Panic payload raised in threads blocked on a barrier whose block failed.
#[derive(Debug, Clone, Copy)]
pub struct BarrierPoisoned;

#[derive(Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    poisoned: bool,
}

/// Reusable barrier for the threads of one block.
pub struct BlockBarrier {
    threads: usize,
    state: Mutex<BarrierState>,
    cv: Condvar,
}

impl BlockBarrier {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
            state: Mutex::new(BarrierState::default()),
            cv: Condvar::new(),
        }
    }

    /// Block until all threads arrived. Returns true on exactly one thread.
    ///
    /// Unwinds with [`BarrierPoisoned`] when the barrier was poisoned.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        if state.poisoned {
            drop(state);
            panic::resume_unwind(Box::new(BarrierPoisoned));
        }
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.threads {
            state.arrived = 0;
            state.generation = generation.wrapping_add(1);
            self.cv.notify_all();
            return true;
        }
        while state.generation == generation && !state.poisoned {
            self.cv.wait(&mut state);
        }
        if state.generation == generation {
            drop(state);
            panic::resume_unwind(Box::new(BarrierPoisoned));
        }
        false
    }

    /// Release every waiter with [`BarrierPoisoned`]; later waits unwind too.
    pub fn poison(&self) {
        self.state.lock().poisoned = true;
        self.cv.notify_all();
    }

    pub(crate) fn reset(&self) {
        *self.state.lock() = BarrierState::default();
    }
}

/// Reduction applied by a predicate barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockSyncOp {
    /// Number of threads whose predicate is true.
    Count,
    /// 1 iff every predicate is true.
    And,
    /// 1 iff any predicate is true.
    Or,
}

impl BlockSyncOp {
    fn identity(self) -> usize {
        match self {
            BlockSyncOp::Count | BlockSyncOp::Or => 0,
            BlockSyncOp::And => 1,
        }
    }

    fn fold(self, acc: usize, predicate: bool) -> usize {
        match self {
            BlockSyncOp::Count => acc + usize::from(predicate),
            BlockSyncOp::And => acc & usize::from(predicate),
            BlockSyncOp::Or => acc | usize::from(predicate),
        }
    }
}

/// Barrier plus the accumulator used by predicate barriers.
pub struct BlockSync {
    barrier: BlockBarrier,
    reduction: Mutex<usize>,
}

impl BlockSync {
    pub fn new(threads: usize) -> Self {
        Self {
            barrier: BlockBarrier::new(threads),
            reduction: Mutex::new(0),
        }
    }

    pub fn barrier(&self) -> &BlockBarrier {
        &self.barrier
    }

    pub fn sync(&self) {
        self.barrier.wait();
    }

    pub fn sync_predicate(&self, op: BlockSyncOp, predicate: bool) -> usize {
        // the previous reduction has been read by everyone once all arrive
        if self.barrier.wait() {
            *self.reduction.lock() = op.identity();
        }
        self.barrier.wait();
        {
            let mut acc = self.reduction.lock();
            *acc = op.fold(*acc, predicate);
        }
        self.barrier.wait();
        *self.reduction.lock()
    }
}

/// Everything the threads of one block share.
pub struct BlockContext {
    pub(crate) shared: BlockSharedMem,
    pub(crate) sync: BlockSync,
}

impl BlockContext {
    pub(crate) fn new(threads: usize, static_bytes: usize, dyn_bytes: usize) -> Result<Self> {
        Ok(Self {
            shared: BlockSharedMem::new(static_bytes, dyn_bytes)?,
            sync: BlockSync::new(threads),
        })
    }

    /// Prepare for the next block of the same launch.
    pub(crate) fn reset(&self) {
        self.shared.reset();
        self.sync.barrier.reset();
    }
}
