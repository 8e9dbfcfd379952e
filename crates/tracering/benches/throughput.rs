use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::thread;
use tracering::{Config, MpscRing, Parker, Ring};

const MSG_PER_PRODUCER: u64 = 100_000;

fn bench_mpsc_admission(c: &mut Criterion) {
    let mut group = c.benchmark_group("mpsc_admission");

    for producers in [1u64, 2, 4, 8] {
        group.throughput(Throughput::Elements(producers * MSG_PER_PRODUCER));
        group.bench_with_input(
            BenchmarkId::from_parameter(producers),
            &producers,
            |b, &producers| {
                b.iter(|| {
                    let ring = Arc::new(MpscRing::new(1024, false));
                    let handles: Vec<_> = (0..producers)
                        .map(|_| {
                            let ring = Arc::clone(&ring);
                            thread::spawn(move || {
                                let mut dropped = 0u64;
                                for i in 0..MSG_PER_PRODUCER {
                                    if ring.push(i).is_err() {
                                        dropped += 1;
                                    }
                                }
                                dropped
                            })
                        })
                        .collect();

                    let mut consumed = 0u64;
                    while handles.iter().any(|h| !h.is_finished()) {
                        consumed += ring.consume_batch_owned(|v| {
                            black_box(v);
                        }) as u64;
                    }
                    consumed += ring.consume_batch_owned(|v| {
                        black_box(v);
                    }) as u64;

                    let dropped: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
                    assert_eq!(consumed + dropped, producers * MSG_PER_PRODUCER);
                });
            },
        );
    }
    group.finish();
}

fn bench_spsc_blocking(c: &mut Criterion) {
    let mut group = c.benchmark_group("spsc_blocking");
    group.throughput(Throughput::Elements(MSG_PER_PRODUCER));

    group.bench_function("push_blocking", |b| {
        b.iter(|| {
            let ring = Arc::new(Ring::new(Config::for_capacity(1024, false)));
            let producer_ring = Arc::clone(&ring);
            let producer = thread::spawn(move || {
                let parker = Parker::new();
                for i in 0..MSG_PER_PRODUCER {
                    let _ = producer_ring.push_blocking(i, &parker);
                }
            });

            let mut consumed = 0u64;
            while consumed < MSG_PER_PRODUCER {
                consumed += ring.consume_batch_owned(|v| {
                    black_box(v);
                }) as u64;
            }
            producer.join().unwrap();
        });
    });
    group.finish();
}

criterion_group!(benches, bench_mpsc_admission, bench_spsc_blocking);
criterion_main!(benches);
