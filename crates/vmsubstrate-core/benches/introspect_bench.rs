//! Remote introspection benchmarks.

#![allow(unsafe_code)]

use std::sync::{Arc, Barrier};

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use vmsubstrate_core::{
    AttachArgs, BootImage, BufferDescriptor, ImageHeader, LocalProcess, Substrate, TeleScratch,
    Upcalls, find_thread_locals, read_memory,
};

unsafe extern "C" fn accept_attach(
    _: usize,
    _: usize,
    _: usize,
    _: i32,
    _: usize,
    _: usize,
    _: usize,
    _: usize,
    _: usize,
) -> i32 {
    0
}

fn local() -> LocalProcess {
    // SAFETY: benchmarks only read live blocks and buffers.
    unsafe { LocalProcess::new() }
}

fn bench_find_thread_locals(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_thread_locals");

    for &depth in &[1usize, 8, 64] {
        let upcalls = Upcalls {
            attach: Some(accept_attach),
            ..Upcalls::default()
        };
        let image = BootImage::synthetic(ImageHeader::host_default(), upcalls).unwrap();
        let substrate = Substrate::new(Arc::new(image)).unwrap();

        // The benchmarking thread attaches first so it ends up at the tail.
        substrate.attach_current(&AttachArgs::default(), false).unwrap();
        let attached = Arc::new(Barrier::new(depth));
        let release = Arc::new(Barrier::new(depth));
        let parked: Vec<_> = (1..depth)
            .map(|_| {
                let substrate = Arc::clone(&substrate);
                let attached = Arc::clone(&attached);
                let release = Arc::clone(&release);
                std::thread::spawn(move || {
                    substrate.attach_current(&AttachArgs::default(), false).unwrap();
                    attached.wait();
                    release.wait();
                    substrate.detach_current().unwrap();
                })
            })
            .collect();
        attached.wait();

        let layout = *substrate.layout();
        let head = substrate.image().registry_head();
        let marker = 0u8;
        let sp = std::ptr::addr_of!(marker) as usize;
        let process = local();
        let mut scratch = TeleScratch::new();

        group.bench_with_input(BenchmarkId::new("tail", depth), &depth, |b, _| {
            b.iter(|| {
                let found = find_thread_locals(&process, &layout, head, 0, black_box(sp), &mut scratch)
                    .map(|view| view.address());
                black_box(found);
            });
        });

        release.wait();
        for thread in parked {
            thread.join().unwrap();
        }
        substrate.detach_current().unwrap();
    }
    group.finish();
}

fn bench_read_memory(c: &mut Criterion) {
    let sizes: &[usize] = &[8, 64, 4096, 65536];
    let mut group = c.benchmark_group("read_memory");
    let process = local();

    for &size in sizes {
        let src = vec![0xA5u8; size];
        let mut direct = vec![0u8; size];
        let mut managed = vec![0u8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("direct", size), &size, |b, &len| {
            b.iter(|| {
                let n = read_memory(
                    &process,
                    src.as_ptr() as usize,
                    BufferDescriptor::Direct { buffer: &mut direct, offset: 0 },
                    len,
                );
                black_box(n.unwrap());
            });
        });

        group.bench_with_input(BenchmarkId::new("managed", size), &size, |b, &len| {
            b.iter(|| {
                let n = read_memory(
                    &process,
                    src.as_ptr() as usize,
                    BufferDescriptor::Managed { array: &mut managed, offset: 0 },
                    len,
                );
                black_box(n.unwrap());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_find_thread_locals, bench_read_memory);
criterion_main!(benches);
