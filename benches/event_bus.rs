//! Criterion benchmarks for event fan-out and queue stepping.
//!
//! Run with:
//!   cargo bench
//!
//! Results are saved to target/criterion/

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use operant::clock::{Clock, SystemClock};
use operant::events::{BitEncoder, Event, EventBus, EventHandler};
use operant::queues::{
    AdaptiveQueue, DoubleStaircase, DoubleStaircaseReinforced, EasySampling, MixedAdaptiveQueue,
    Queue, SubQueue,
};
use operant::snapshot::MemorySnapshotStore;

#[derive(Clone, Default)]
struct Counter(Arc<AtomicU64>);

impl EventHandler for Counter {
    fn name(&self) -> &str {
        "counter"
    }

    fn write(&mut self, _event: &Event) -> operant::Result<()> {
        self.0.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Caller-side cost of `emit` with a growing number of handler threads.
fn bench_emit(c: &mut Criterion) {
    let mut group = c.benchmark_group("emit");
    group.throughput(Throughput::Elements(1));

    for handlers in [0usize, 1, 4].iter() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let mut builder = EventBus::builder(clock);
        for _ in 0..*handlers {
            builder = builder.handler(Counter::default());
        }
        let Ok(bus) = builder.build() else {
            continue;
        };
        group.bench_with_input(BenchmarkId::from_parameter(handlers), handlers, |b, _| {
            b.iter(|| bus.emit(black_box("hopper"), black_box("up"), None));
        });
        bus.shutdown();
    }

    group.finish();
}

fn bench_bit_encoder(c: &mut Criterion) {
    let event = Event {
        name: "peck_left".into(),
        action: "on".into(),
        metadata: Some("trial 12".into()),
        time: chrono::Local::now(),
    };
    let mut encoder = BitEncoder::default();
    c.bench_function("bit_encoder_cached", |b| {
        b.iter(|| black_box(encoder.encode(black_box(&event)).len()));
    });
}

fn mixed_queue(seed: u64) -> Option<MixedAdaptiveQueue> {
    let subs = vec![
        SubQueue {
            queue: AdaptiveQueue::DoubleStaircase(DoubleStaircase::new(40, 0.05, Some(seed)).ok()?),
            conditions: vec![0, 1],
        },
        SubQueue {
            queue: AdaptiveQueue::DoubleStaircaseReinforced(
                DoubleStaircaseReinforced::new(
                    40,
                    0.05,
                    0.1,
                    EasySampling::LogBiased { shape: 3.0 },
                    Some(seed + 1),
                )
                .ok()?,
            ),
            conditions: vec![2, 3],
        },
    ];
    MixedAdaptiveQueue::open(subs, None, Some(seed), Box::new(MemorySnapshotStore::new())).ok()
}

/// One draw plus one update, including the snapshot write.
fn bench_mixed_queue_step(c: &mut Criterion) {
    let Some(mut queue) = mixed_queue(17) else {
        return;
    };
    let mut correct = false;
    c.bench_function("mixed_queue_step", |b| {
        b.iter(|| {
            if let Ok(Some(selection)) = queue.next() {
                black_box(selection);
                correct = !correct;
                let _ = queue.update(correct, false);
            }
        });
    });
}

criterion_group!(benches, bench_emit, bench_bit_encoder, bench_mixed_queue_step);
criterion_main!(benches);
