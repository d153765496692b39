//! Criterion benchmarks for the hit aggregation hot path.
//!
//! `on_batch` runs on the producer thread for every decoded batch; if it falls
//! behind, the transport drops measurement data.
//!
//! Run with: cargo bench --bench aggregator

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tpx_daq::acquisition::FrameHandler;
use tpx_daq::aggregator::HitAggregator;
use tpx_daq::hardware::{FrameInfo, PixelEvent, SENSOR_HEIGHT, SENSOR_WIDTH};
use tpx_daq::storage::MemoryStore;

fn random_events(n: usize) -> Vec<PixelEvent> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..n)
        .map(|i| {
            PixelEvent::new(
                rng.gen_range(0..SENSOR_WIDTH),
                rng.gen_range(0..SENSOR_HEIGHT),
                i as u64,
                rng.gen_range(0..16),
                rng.gen_range(1..1024),
            )
        })
        .collect()
}

/// Batch sizes seen from the transport, from sparse frames to full pixel buffers.
fn aggregator_batch_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregator_on_batch");

    for size in [64usize, 1024, 16_384, 65_536] {
        let events = random_events(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &events, |b, events| {
            b.iter_batched_ref(
                || {
                    let mut aggregator = HitAggregator::new(MemoryStore::new());
                    aggregator.begin_session();
                    aggregator.on_frame_start(0);
                    aggregator
                },
                |aggregator| aggregator.on_batch(black_box(events)),
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

/// Whole frame: start, batches of 500, end with attribute writes.
fn aggregator_full_frame(c: &mut Criterion) {
    let events = random_events(20_000);
    let info = FrameInfo {
        sent_pixels: 20_000,
        received_pixels: 20_000,
        completed: true,
        ..Default::default()
    };

    c.bench_function("aggregator_full_frame", |b| {
        b.iter(|| {
            let mut aggregator = HitAggregator::new(MemoryStore::new());
            aggregator.begin_session();
            aggregator.on_frame_start(0);
            for batch in events.chunks(500) {
                aggregator.on_batch(batch);
            }
            aggregator.on_frame_end(0, true, black_box(&info));
            black_box(aggregator.session_hits())
        });
    });
}

criterion_group!(benches, aggregator_batch_throughput, aggregator_full_frame);
criterion_main!(benches);
