//! Criterion benchmarks for the sample FIFO hot paths.
//!
//! The FIFO sits between the producer domain and the reader loop, so its
//! per-record cost bounds the sustainable sampling rate. These benchmarks
//! establish baselines for the push path and the drain path.
//!
//! Run with: cargo bench --bench sample_fifo

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use daqpipe::fifo::sample_fifo;
use daqpipe::sample::{Sample, SAMPLE_WIRE_SIZE};

/// Benchmark the producer-side push of single records.
fn fifo_push_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("fifo_push");
    group.throughput(Throughput::Bytes(SAMPLE_WIRE_SIZE as u64));

    group.bench_function("push_pop_one", |b| {
        let (mut w, mut r) = sample_fifo(1024);
        let sample = Sample::new(3, 42, 1, 2048);
        let mut out = Vec::with_capacity(1);
        b.iter(|| {
            w.push(black_box(&sample));
            out.clear();
            r.read_records(&mut out).unwrap();
        });
    });

    group.finish();
}

/// Benchmark draining batches of records, the reader loop's per-tick cost.
fn fifo_drain_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("fifo_drain");

    for batch in [16usize, 256, 4096] {
        group.throughput(Throughput::Bytes((batch * SAMPLE_WIRE_SIZE) as u64));
        group.bench_with_input(BenchmarkId::new("drain", batch), &batch, |b, &batch| {
            let (mut w, mut r) = sample_fifo(batch);
            let mut out = Vec::with_capacity(batch);
            b.iter(|| {
                for i in 0..batch {
                    w.push(&Sample::new((i % 4) as u8, i as u64, 0, i as u32));
                }
                out.clear();
                r.read_records(&mut out).unwrap();
                black_box(out.len());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, fifo_push_throughput, fifo_drain_throughput);
criterion_main!(benches);
