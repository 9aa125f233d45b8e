//! Hierarchical atomics.
//!
//! Every operation goes through one entry point parameterised by an
//! [`AtomicOp`] and a [`Hierarchy`] level. Each accelerator maps a level to
//! an [`AtomicImpl`]: real hardware atomics, or a plain read-modify-write for
//! levels whose memory only one thread can touch at a time on that backend.

use std::sync::atomic::{
    AtomicI32, AtomicI64, AtomicIsize, AtomicU32, AtomicU64, AtomicUsize, Ordering,
};

/// Read-modify-write operation.
///
/// `Inc` and `Dec` wrap like their GPU counterparts:
/// `inc(old, v) = old >= v ? 0 : old + 1` and
/// `dec(old, v) = (old == 0 || old > v) ? v : old - 1`.
/// Bitwise operations on floating-point elements act on the IEEE bit pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AtomicOp {
    Add,
    Sub,
    Min,
    Max,
    Exch,
    Inc,
    Dec,
    And,
    Or,
    Xor,
}

/// Level at which an atomic's visibility is guaranteed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Hierarchy {
    /// Only the calling thread observes the location.
    Threads,
    /// All threads of the calling block.
    Blocks,
    /// All threads of the grid on one device.
    Grids,
}

/// How an accelerator implements one hierarchy level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AtomicImpl {
    /// Hardware atomics.
    Native,
    /// Plain read-modify-write.
    Unsync,
}

impl AtomicImpl {
    /// Apply `op` at `addr`, returning the previous value.
    ///
    /// # Safety
    ///
    /// `addr` must be valid for reads and writes and aligned for `T`. With
    /// [`AtomicImpl::Unsync`] no other thread may access `addr` concurrently;
    /// with [`AtomicImpl::Native`] every concurrent access must be atomic.
    pub unsafe fn rmw<T: AtomicElem>(self, addr: *mut T, op: AtomicOp, value: T) -> T {
        match self {
            AtomicImpl::Native => T::atomic_rmw(addr, op, value),
            AtomicImpl::Unsync => {
                let old = addr.read();
                addr.write(T::combine(op, old, value));
                old
            }
        }
    }

    /// Store `value` at `addr` if it holds `compare`; returns the previous value.
    ///
    /// # Safety
    ///
    /// Same contract as [`rmw`](Self::rmw).
    pub unsafe fn cas<T: AtomicElem>(self, addr: *mut T, compare: T, value: T) -> T {
        match self {
            AtomicImpl::Native => T::atomic_cas(addr, compare, value),
            AtomicImpl::Unsync => {
                let old = addr.read();
                if old.bit_eq(compare) {
                    addr.write(value);
                }
                old
            }
        }
    }
}

/// Element types supported by the atomic operations.
pub trait AtomicElem: Copy + PartialOrd + Send + Sync + 'static {
    /// Result of applying `op` to `old` with operand `value`.
    fn combine(op: AtomicOp, old: Self, value: Self) -> Self;

    /// Equality used by compare-and-swap.
    fn bit_eq(self, other: Self) -> bool;

    /// # Safety
    ///
    /// `addr` valid, aligned, and only accessed atomically while shared.
    unsafe fn atomic_rmw(addr: *mut Self, op: AtomicOp, value: Self) -> Self;

    /// # Safety
    ///
    /// Same contract as [`atomic_rmw`](Self::atomic_rmw).
    unsafe fn atomic_cas(addr: *mut Self, compare: Self, value: Self) -> Self;
}

macro_rules! impl_atomic_int {
    ($($t:ty => $atomic:ty),* $(,)?) => {$(
        impl AtomicElem for $t {
            fn combine(op: AtomicOp, old: Self, value: Self) -> Self {
                match op {
                    AtomicOp::Add => old.wrapping_add(value),
                    AtomicOp::Sub => old.wrapping_sub(value),
                    AtomicOp::Min => old.min(value),
                    AtomicOp::Max => old.max(value),
                    AtomicOp::Exch => value,
                    AtomicOp::Inc => if old >= value { 0 } else { old.wrapping_add(1) },
                    AtomicOp::Dec => if old == 0 || old > value { value } else { old.wrapping_sub(1) },
                    AtomicOp::And => old & value,
                    AtomicOp::Or => old | value,
                    AtomicOp::Xor => old ^ value,
                }
            }

            fn bit_eq(self, other: Self) -> bool {
                self == other
            }

            unsafe fn atomic_rmw(addr: *mut Self, op: AtomicOp, value: Self) -> Self {
                let atomic = <$atomic>::from_ptr(addr);
                match op {
                    AtomicOp::Add => atomic.fetch_add(value, Ordering::AcqRel),
                    AtomicOp::Sub => atomic.fetch_sub(value, Ordering::AcqRel),
                    AtomicOp::Min => atomic.fetch_min(value, Ordering::AcqRel),
                    AtomicOp::Max => atomic.fetch_max(value, Ordering::AcqRel),
                    AtomicOp::Exch => atomic.swap(value, Ordering::AcqRel),
                    AtomicOp::And => atomic.fetch_and(value, Ordering::AcqRel),
                    AtomicOp::Or => atomic.fetch_or(value, Ordering::AcqRel),
                    AtomicOp::Xor => atomic.fetch_xor(value, Ordering::AcqRel),
                    AtomicOp::Inc | AtomicOp::Dec => {
                        let mut old = atomic.load(Ordering::Relaxed);
                        loop {
                            let new = Self::combine(op, old, value);
                            match atomic.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed) {
                                Ok(prev) => return prev,
                                Err(current) => old = current,
                            }
                        }
                    }
                }
            }

            unsafe fn atomic_cas(addr: *mut Self, compare: Self, value: Self) -> Self {
                let atomic = <$atomic>::from_ptr(addr);
                match atomic.compare_exchange(compare, value, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(prev) | Err(prev) => prev,
                }
            }
        }
    )*};
}

impl_atomic_int!(
    u32 => AtomicU32,
    i32 => AtomicI32,
    u64 => AtomicU64,
    i64 => AtomicI64,
    usize => AtomicUsize,
    isize => AtomicIsize,
);

macro_rules! impl_atomic_float {
    ($($t:ty => $bits:ty, $atomic:ty),* $(,)?) => {$(
        impl AtomicElem for $t {
            fn combine(op: AtomicOp, old: Self, value: Self) -> Self {
                match op {
                    AtomicOp::Add => old + value,
                    AtomicOp::Sub => old - value,
                    AtomicOp::Min => old.min(value),
                    AtomicOp::Max => old.max(value),
                    AtomicOp::Exch => value,
                    AtomicOp::Inc => if old >= value { 0.0 } else { old + 1.0 },
                    AtomicOp::Dec => if old == 0.0 || old > value { value } else { old - 1.0 },
                    AtomicOp::And => <$t>::from_bits(old.to_bits() & value.to_bits()),
                    AtomicOp::Or => <$t>::from_bits(old.to_bits() | value.to_bits()),
                    AtomicOp::Xor => <$t>::from_bits(old.to_bits() ^ value.to_bits()),
                }
            }

            fn bit_eq(self, other: Self) -> bool {
                self.to_bits() == other.to_bits()
            }

            unsafe fn atomic_rmw(addr: *mut Self, op: AtomicOp, value: Self) -> Self {
                let atomic = <$atomic>::from_ptr(addr.cast::<$bits>());
                let mut old = atomic.load(Ordering::Relaxed);
                loop {
                    let new = Self::combine(op, <$t>::from_bits(old), value).to_bits();
                    match atomic.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed) {
                        Ok(prev) => return <$t>::from_bits(prev),
                        Err(current) => old = current,
                    }
                }
            }

            unsafe fn atomic_cas(addr: *mut Self, compare: Self, value: Self) -> Self {
                let atomic = <$atomic>::from_ptr(addr.cast::<$bits>());
                match atomic.compare_exchange(
                    compare.to_bits(),
                    value.to_bits(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(prev) | Err(prev) => <$t>::from_bits(prev),
                }
            }
        }
    )*};
}

impl_atomic_float!(f32 => u32, AtomicU32, f64 => u64, AtomicU64);

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_inc_dec_wrap() {
        assert_eq!(u32::combine(AtomicOp::Inc, 5, 5), 0);
        assert_eq!(u32::combine(AtomicOp::Inc, 4, 5), 5);
        assert_eq!(u32::combine(AtomicOp::Dec, 0, 5), 5);
        assert_eq!(u32::combine(AtomicOp::Dec, 7, 5), 5);
        assert_eq!(u32::combine(AtomicOp::Dec, 3, 5), 2);
    }

    #[test]
    fn test_unsync_returns_previous_value() {
        let mut value = 10i64;
        let old = unsafe { AtomicImpl::Unsync.rmw(&mut value, AtomicOp::Sub, 3) };
        assert_eq!((old, value), (10, 7));

        let old = unsafe { AtomicImpl::Unsync.cas(&mut value, 7, 42) };
        assert_eq!((old, value), (7, 42));
        let old = unsafe { AtomicImpl::Unsync.cas(&mut value, 7, 0) };
        assert_eq!((old, value), (42, 42));
    }

    #[test]
    fn test_native_add_is_atomic_across_threads() {
        let mut counter = 0u32;
        let addr = &mut counter as *mut u32 as usize;
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(move || {
                    for _ in 0..1000 {
                        unsafe { AtomicImpl::Native.rmw(addr as *mut u32, AtomicOp::Add, 1) };
                    }
                });
            }
        });
        assert_eq!(counter, 8000);
    }

    #[test]
    fn test_native_float_add_is_atomic_across_threads() {
        let mut sum = 0.0f64;
        let addr = &mut sum as *mut f64 as usize;
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(move || {
                    for _ in 0..500 {
                        unsafe { AtomicImpl::Native.rmw(addr as *mut f64, AtomicOp::Add, 0.5) };
                    }
                });
            }
        });
        assert_eq!(sum, 1000.0);
    }

    #[test]
    fn test_native_min_max_exch_bitwise() {
        let mut v = 12u64;
        unsafe {
            assert_eq!(AtomicImpl::Native.rmw(&mut v, AtomicOp::Min, 5), 12);
            assert_eq!(AtomicImpl::Native.rmw(&mut v, AtomicOp::Max, 9), 5);
            assert_eq!(AtomicImpl::Native.rmw(&mut v, AtomicOp::Or, 0b0110), 9);
            assert_eq!(AtomicImpl::Native.rmw(&mut v, AtomicOp::And, 0b1100), 0b1111);
            assert_eq!(AtomicImpl::Native.rmw(&mut v, AtomicOp::Xor, 0b0100), 0b1100);
            assert_eq!(AtomicImpl::Native.rmw(&mut v, AtomicOp::Exch, 1), 0b1000);
        }
        assert_eq!(v, 1);
    }

    #[test]
    fn test_native_inc_loop() {
        let mut v = 0i32;
        for _ in 0..7 {
            unsafe { AtomicImpl::Native.rmw(&mut v, AtomicOp::Inc, 3) };
        }
        // 0 1 2 3 0 1 2 3
        assert_eq!(v, 3);
    }

    #[test]
    fn test_native_float_cas_compares_bits() {
        let mut v = 1.5f32;
        let old = unsafe { AtomicImpl::Native.cas(&mut v, 1.5, 2.5) };
        assert_eq!((old, v), (1.5, 2.5));
        let old = unsafe { AtomicImpl::Native.cas(&mut v, 1.5, 9.0) };
        assert_eq!((old, v), (2.5, 2.5));
    }
}
