//! Queue throughput benchmarks
//!
//! - kernel launch overhead per accelerator
//! - host task round trips on host and emulated queues
//! - host/device copies for dense and pitched buffers

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use portacc_backends::{
    alloc, copy, create_task_kernel, get_valid_work_div, AccCpuBlocks, AccCpuSerial, AccGpuEmu, DevCpu, DevEmu,
    Enqueue, GridBlockExtentSubDivRestrictions, IdxProvider, IdxVec, KernelView, PltfEmu, Platform, Queue,
    QueueCpuAsync, QueueCpuSync, QueueEmuAsync, QueueEmuSync, TaskHost, ViewMut,
};

fn benchmark_kernel_launch(c: &mut Criterion) {
    let mut group = c.benchmark_group("kernel_launch");
    let host = DevCpu::get();
    let queue = QueueCpuSync::new(&host);

    for size in [1_024usize, 65_536] {
        let buf = alloc::<f32, 1, _>(&host, IdxVec::new([size])).unwrap();
        group.throughput(Throughput::Elements(size as u64));

        let serial = get_valid_work_div::<AccCpuSerial<1>, 1>(
            &host,
            IdxVec::new([size]),
            IdxVec::new([256]),
            false,
            GridBlockExtentSubDivRestrictions::Unrestricted,
        )
        .unwrap();
        group.bench_with_input(BenchmarkId::new("cpu_serial", size), &size, |b, _| {
            b.iter(|| {
                queue
                    .enqueue(create_task_kernel(
                        serial,
                        |acc: &AccCpuSerial<1>, out: KernelView<f32, 1>| scale_elems(acc.grid_elem_idx(), acc.thread_elem_extent(), out),
                        buf.kernel_view(),
                    ))
                    .unwrap();
            });
        });

        let blocks = get_valid_work_div::<AccCpuBlocks<1>, 1>(
            &host,
            IdxVec::new([size]),
            IdxVec::new([256]),
            false,
            GridBlockExtentSubDivRestrictions::Unrestricted,
        )
        .unwrap();
        group.bench_with_input(BenchmarkId::new("cpu_blocks", size), &size, |b, _| {
            b.iter(|| {
                queue
                    .enqueue(create_task_kernel(
                        blocks,
                        |acc: &AccCpuBlocks<1>, out: KernelView<f32, 1>| scale_elems(acc.grid_elem_idx(), acc.thread_elem_extent(), out),
                        buf.kernel_view(),
                    ))
                    .unwrap();
            });
        });
    }

    let emu = PltfEmu::dev_by_idx(0).unwrap();
    let emu_queue = QueueEmuSync::new(&emu).unwrap();
    let size = 4_096usize;
    let buf = alloc::<f32, 1, _>(&emu, IdxVec::new([size])).unwrap();
    let work_div = get_valid_work_div::<AccGpuEmu<1>, 1>(
        &emu,
        IdxVec::new([size]),
        IdxVec::new([256]),
        false,
        GridBlockExtentSubDivRestrictions::Unrestricted,
    )
    .unwrap();
    group.bench_function(BenchmarkId::new("gpu_emu", size), |b| {
        b.iter(|| {
            emu_queue
                .enqueue(create_task_kernel(
                    work_div,
                    |acc: &AccGpuEmu<1>, out: KernelView<f32, 1>| scale_elems(acc.grid_elem_idx(), acc.thread_elem_extent(), out),
                    buf.kernel_view(),
                ))
                .unwrap();
        });
    });

    group.finish();
}

fn scale_elems(first: IdxVec<1>, count: IdxVec<1>, out: KernelView<f32, 1>) {
    for offset in 0..count[0] {
        let i = IdxVec::new([first[0] + offset]);
        if out.contains(&i) {
            // SAFETY: threads cover disjoint element ranges.
            unsafe { out.write(i, out.read(i) * 0.5 + 1.0) };
        }
    }
}

fn benchmark_host_tasks(c: &mut Criterion) {
    let mut group = c.benchmark_group("host_task");
    let host = DevCpu::get();

    let sync = QueueCpuSync::new(&host);
    group.bench_function("cpu_sync", |b| {
        b.iter(|| sync.enqueue(TaskHost::new(|| black_box(()))).unwrap());
    });

    let queue = QueueCpuAsync::new(&host).unwrap();
    group.bench_function("cpu_async_64", |b| {
        b.iter(|| {
            for _ in 0..64 {
                queue.enqueue(TaskHost::new(|| black_box(()))).unwrap();
            }
            queue.wait().unwrap();
        });
    });

    let emu: DevEmu = PltfEmu::dev_by_idx(0).unwrap();
    let emu_queue = QueueEmuAsync::new(&emu).unwrap();
    group.bench_function("emu_async_64", |b| {
        b.iter(|| {
            for _ in 0..64 {
                emu_queue.enqueue(TaskHost::new(|| black_box(()))).unwrap();
            }
            emu_queue.wait().unwrap();
        });
    });

    group.finish();
}

fn benchmark_copies(c: &mut Criterion) {
    let mut group = c.benchmark_group("copy");
    let host = DevCpu::get();
    let emu = PltfEmu::dev_by_idx(0).unwrap();
    let queue = QueueEmuSync::new(&emu).unwrap();

    for side in [64usize, 512] {
        let extent = IdxVec::new([side, side]);
        let src = alloc::<f32, 2, _>(&host, extent).unwrap();
        let dst = alloc::<f32, 2, _>(&host, extent).unwrap();
        let on_device = alloc::<f32, 2, _>(&emu, extent).unwrap();
        group.throughput(Throughput::Bytes((side * side * std::mem::size_of::<f32>()) as u64));

        group.bench_with_input(BenchmarkId::new("host_to_pitched_device", side), &side, |b, _| {
            b.iter(|| copy(&queue, &on_device, &src, extent).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("pitched_device_to_host", side), &side, |b, _| {
            b.iter(|| copy(&queue, &dst, &on_device, extent).unwrap());
        });

        let host_queue = QueueCpuSync::new(&host);
        group.bench_with_input(BenchmarkId::new("host_to_host", side), &side, |b, _| {
            b.iter(|| copy(&host_queue, &dst, &src, extent).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_kernel_launch, benchmark_host_tasks, benchmark_copies);
criterion_main!(benches);
