use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pubsub_perftest::{
    envelope::{payload_for, SampleEnvelope, NOT_A_PING},
    metrics::StatisticsAccumulator,
    throughput::ThroughputTracker,
};

const SAMPLES: u64 = 100_000;

fn accumulator(c: &mut Criterion) {
    let mut acc = StatisticsAccumulator::new();
    let mut value = 0u64;

    c.bench_function("accumulator_record", |b| {
        b.iter(|| {
            value = (value + 7) % 5_000;
            acc.record(black_box(value))
        })
    });

    let mut filled = StatisticsAccumulator::new();
    for i in 0..SAMPLES {
        filled.record(i % 1_000 + 1);
    }

    c.bench_function("accumulator_percentile_99", |b| {
        b.iter(|| filled.percentile(black_box(99.0)))
    });
    c.bench_function("accumulator_stddev", |b| b.iter(|| filled.stddev()));
}

fn tracker(c: &mut Criterion) {
    let mut tracker = ThroughputTracker::new();
    let mut envelope = SampleEnvelope::encode(0, 0, 0, NOT_A_PING, payload_for(1024));

    c.bench_function("tracker_record_in_order", |b| {
        b.iter(|| {
            envelope.sequence_number += 1;
            tracker.record(black_box(&envelope))
        })
    });

    let mut gappy = ThroughputTracker::new();
    let mut seq = 0u64;
    c.bench_function("tracker_record_with_gaps", |b| {
        b.iter(|| {
            seq += 3;
            envelope.sequence_number = seq;
            gappy.record(black_box(&envelope))
        })
    });
}

criterion_group!(benches, accumulator, tracker);
criterion_main!(benches);
