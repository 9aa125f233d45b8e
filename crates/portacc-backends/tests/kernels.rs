//! One kernel source, every accelerator.

use std::sync::Arc;

use portacc_backends::{
    alloc, copy, create_task_kernel, get_valid_work_div, set, AccCpuBlocks, AccCpuSerial, AccCpuThreads, AccGpuEmu,
    AtomicOp, AtomicProvider, BinaryOp, BlockSyncOp, BlockSyncProvider, DevCpu, DevEmu, EmuRuntime, Enqueue,
    GridBlockExtentSubDivRestrictions, Hierarchy, IdxProvider, IdxVec, KernelView, MathProvider, QueueCpuSync,
    QueueEmuSync, RuntimeConfig, SharedMemProvider, UnaryOp, ViewMut, WorkDiv,
};

const SAMPLES: usize = 300;
const BINS: usize = 8;

fn samples() -> Vec<u32> {
    (0..SAMPLES as u32).map(|i| (i * 7 + 3) % BINS as u32).collect()
}

fn expected_histogram() -> Vec<u32> {
    let mut bins = vec![0; BINS];
    for v in samples() {
        bins[v as usize] += 1;
    }
    bins
}

fn emu_device() -> DevEmu {
    DevEmu::from_runtime(&EmuRuntime::new(&RuntimeConfig::default()), 0).unwrap()
}

/// Histogram of `samples()` computed by accelerator `$acc` on `$dev`,
/// staging through `$dev` buffers with `$queue`.
macro_rules! histogram_on {
    ($acc:ty, $dev:expr, $queue:expr) => {{
        let dev = $dev;
        let queue = $queue;
        let host = DevCpu::get();

        let input_host = alloc::<u32, 1, _>(&host, IdxVec::new([SAMPLES])).unwrap();
        input_host.copy_from_slice(&samples()).unwrap();
        let input = alloc::<u32, 1, _>(&dev, IdxVec::new([SAMPLES])).unwrap();
        let bins = alloc::<u32, 1, _>(&dev, IdxVec::new([BINS])).unwrap();
        copy(&queue, &input, &input_host, IdxVec::new([SAMPLES])).unwrap();
        set(&queue, &bins, 0, IdxVec::new([BINS])).unwrap();

        let work_div = get_valid_work_div::<$acc, 1>(
            &dev,
            IdxVec::new([SAMPLES]),
            IdxVec::ones(),
            false,
            GridBlockExtentSubDivRestrictions::Unrestricted,
        )
        .unwrap();
        queue
            .enqueue(create_task_kernel(
                work_div,
                |acc: &$acc, (input, bins): (KernelView<u32, 1>, KernelView<u32, 1>)| {
                    let i = acc.grid_thread_idx();
                    if input.contains(&i) {
                        // SAFETY: `i` is in range and the bins are only touched atomically.
                        unsafe {
                            let bin = input.read(i) as usize;
                            acc.atomic_op(AtomicOp::Add, Hierarchy::Grids, bins.elem_ptr(IdxVec::new([bin])), 1u32);
                        }
                    }
                },
                (input.kernel_view(), bins.kernel_view()),
            ))
            .unwrap();

        let out = alloc::<u32, 1, _>(&host, IdxVec::new([BINS])).unwrap();
        copy(&queue, &out, &bins, IdxVec::new([BINS])).unwrap();
        out.to_vec()
    }};
}

#[test]
fn test_histogram_on_every_accelerator() {
    let host = DevCpu::get();
    let expected = expected_histogram();

    assert_eq!(histogram_on!(AccCpuSerial<1>, host.clone(), QueueCpuSync::new(&host)), expected);
    assert_eq!(histogram_on!(AccCpuBlocks<1>, host.clone(), QueueCpuSync::new(&host)), expected);
    assert_eq!(histogram_on!(AccCpuThreads<1>, host.clone(), QueueCpuSync::new(&host)), expected);

    let emu = emu_device();
    let queue = QueueEmuSync::new(&emu).unwrap();
    assert_eq!(histogram_on!(AccGpuEmu<1>, emu.clone(), queue), expected);
}

/// Per-block sums through block-shared memory and a barrier.
macro_rules! block_sums_on {
    ($acc:ty, $dev:expr, $queue:expr, $block:expr) => {{
        let dev = $dev;
        let queue = $queue;
        let host = DevCpu::get();
        let blocks = 3;
        let block = $block;

        let sums = alloc::<u64, 1, _>(&dev, IdxVec::new([blocks])).unwrap();
        let counts = alloc::<u32, 1, _>(&dev, IdxVec::new([blocks])).unwrap();
        let work_div = WorkDiv::new(IdxVec::new([blocks]), IdxVec::new([block]), IdxVec::new([1]));
        queue
            .enqueue(create_task_kernel(
                work_div,
                |acc: &$acc, (sums, counts): (KernelView<u64, 1>, KernelView<u32, 1>)| {
                    let threads = acc.block_thread_extent()[0];
                    let t = acc.block_thread_idx()[0];
                    let slots = acc.shared_array::<u64>(0, threads);
                    // SAFETY: every thread writes its own slot before the barrier.
                    unsafe { slots.set(t, acc.grid_thread_idx()[0] as u64) };
                    acc.sync_block_threads();

                    let evens = acc.sync_block_threads_predicate(BlockSyncOp::Count, t % 2 == 0);
                    if t == 0 {
                        // SAFETY: reads happen after the barrier; one writer per block.
                        unsafe {
                            let total: u64 = (0..threads).map(|k| slots.get(k)).sum();
                            let b = acc.grid_block_idx();
                            sums.write(b, total);
                            counts.write(b, evens as u32);
                        }
                    }
                },
                (sums.kernel_view(), counts.kernel_view()),
            ))
            .unwrap();

        let sums_host = alloc::<u64, 1, _>(&host, IdxVec::new([blocks])).unwrap();
        let counts_host = alloc::<u32, 1, _>(&host, IdxVec::new([blocks])).unwrap();
        copy(&queue, &sums_host, &sums, IdxVec::new([blocks])).unwrap();
        copy(&queue, &counts_host, &counts, IdxVec::new([blocks])).unwrap();
        (sums_host.to_vec(), counts_host.to_vec())
    }};
}

fn expected_block_sums(blocks: usize, block: usize) -> (Vec<u64>, Vec<u32>) {
    let sums = (0..blocks)
        .map(|b| (b * block..(b + 1) * block).map(|i| i as u64).sum())
        .collect();
    (sums, vec![block.div_ceil(2) as u32; blocks])
}

#[test]
fn test_shared_memory_reduction_on_threaded_accelerators() {
    let host = DevCpu::get();
    let block = RuntimeConfig::global().cpu_block_threads().min(8);
    assert_eq!(
        block_sums_on!(AccCpuThreads<1>, host.clone(), QueueCpuSync::new(&host), block),
        expected_block_sums(3, block)
    );

    let emu = emu_device();
    let queue = QueueEmuSync::new(&emu).unwrap();
    assert_eq!(block_sums_on!(AccGpuEmu<1>, emu.clone(), queue, 16), expected_block_sums(3, 16));
}

#[test]
fn test_shared_memory_reduction_with_single_thread_blocks() {
    let host = DevCpu::get();
    assert_eq!(
        block_sums_on!(AccCpuSerial<1>, host.clone(), QueueCpuSync::new(&host), 1),
        expected_block_sums(3, 1)
    );
    assert_eq!(
        block_sums_on!(AccCpuBlocks<1>, host.clone(), QueueCpuSync::new(&host), 1),
        expected_block_sums(3, 1)
    );
}

#[test]
fn test_dynamic_shared_memory_is_per_block() {
    let emu = emu_device();
    let queue = QueueEmuSync::new(&emu).unwrap();
    let host = DevCpu::get();
    let out = alloc::<u32, 1, _>(&emu, IdxVec::new([4])).unwrap();

    let task = create_task_kernel(
        WorkDiv::new(IdxVec::new([4]), IdxVec::new([4]), IdxVec::new([1])),
        |acc: &AccGpuEmu<1>, out: KernelView<u32, 1>| {
            let scratch = acc.shared_dyn::<u32>();
            let t = acc.block_thread_idx()[0];
            // SAFETY: one slot per thread, read after the barrier.
            unsafe { scratch.set(t, (acc.grid_block_idx()[0] + 1) as u32) };
            acc.sync_block_threads();
            if t == 0 {
                let total: u32 = (0..4).map(|k| unsafe { scratch.get(k) }).sum();
                // SAFETY: one writer per block.
                unsafe { out.write(acc.grid_block_idx(), total) };
            }
        },
        out.kernel_view(),
    )
    .with_dyn_shared_mem_bytes(4 * std::mem::size_of::<u32>());
    queue.enqueue(task).unwrap();

    let back = alloc::<u32, 1, _>(&host, IdxVec::new([4])).unwrap();
    copy(&queue, &back, &out, IdxVec::new([4])).unwrap();
    assert_eq!(back.to_vec(), vec![4, 8, 12, 16]);
}

#[test]
fn test_two_dimensional_kernel_with_math() {
    let host = DevCpu::get();
    let queue = QueueCpuSync::new(&host);
    let extent = IdxVec::new([6, 10]);
    let buf = alloc::<f64, 2, _>(&host, extent).unwrap();

    let work_div = get_valid_work_div::<AccCpuBlocks<2>, 2>(
        &host,
        extent,
        IdxVec::ones(),
        false,
        GridBlockExtentSubDivRestrictions::Unrestricted,
    )
    .unwrap();
    queue
        .enqueue(create_task_kernel(
            work_div,
            |acc: &AccCpuBlocks<2>, out: KernelView<f64, 2>| {
                let i = acc.grid_thread_idx();
                if out.contains(&i) {
                    let (y, x) = (i[0] as f64, i[1] as f64);
                    let (s, c) = acc.sincos(x);
                    let hyp = acc.math_unary(UnaryOp::Sqrt, s * s + c * c);
                    let value = acc.math_binary(BinaryOp::Pow, y, 2.0) * hyp;
                    // SAFETY: one element per thread.
                    unsafe { out.write(i, value) };
                }
            },
            buf.kernel_view(),
        ))
        .unwrap();

    let values = buf.to_vec();
    for y in 0..6 {
        for x in 0..10 {
            let expected = (y * y) as f64;
            assert!((values[y * 10 + x] - expected).abs() < 1e-9, "({y}, {x})");
        }
    }
}

#[test]
fn test_kernel_args_are_shared_between_threads() {
    let host = DevCpu::get();
    let queue = QueueCpuSync::new(&host);
    let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let work_div = WorkDiv::new(IdxVec::new([5]), IdxVec::new([1]), IdxVec::new([1]));
    queue
        .enqueue(create_task_kernel(
            work_div,
            |_: &AccCpuBlocks<1>, hits: Arc<std::sync::atomic::AtomicUsize>| {
                hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            },
            Arc::clone(&hits),
        ))
        .unwrap();
    assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 5);
}
