//! Throughput benchmarks for the snapshot gate.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use snapgate::{Gate, GateConfig};
use std::sync::RwLock;
use std::thread;

fn free_u64(object: *mut (), _context: *mut ()) {
    if !object.is_null() {
        // SAFETY: bench payloads are leaked Box<u64>.
        unsafe { drop(Box::from_raw(object as *mut u64)) };
    }
}

fn published_gate(value: u64) -> Gate {
    let gate = Gate::new(GateConfig {
        free: free_u64,
        extra_control_blocks: 0,
    });
    let builder = gate.make_version().expect("slot");
    builder.set_object(Box::into_raw(Box::new(value)) as *mut (), core::ptr::null_mut());
    gate.exchange(0, builder);
    gate
}

fn bench_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("acquire_release");
    let gate = published_gate(42);

    group.bench_function("single_thread", |b| {
        b.iter(|| {
            let version = gate.acquire(0).expect("published");
            black_box(version.object());
            version.release();
        });
    });

    for threads in [2, 4, 8].iter() {
        group.throughput(Throughput::Elements(1000 * *threads as u64));
        group.bench_with_input(
            BenchmarkId::new("concurrent", threads),
            threads,
            |b, &num_threads| {
                b.iter(|| {
                    thread::scope(|s| {
                        for _ in 0..num_threads {
                            s.spawn(|| {
                                for _ in 0..1000 {
                                    let version = gate.acquire(0).expect("published");
                                    black_box(version.object());
                                    version.release();
                                }
                            });
                        }
                    });
                });
            },
        );
    }

    group.finish();
}

fn bench_exchange(c: &mut Criterion) {
    let mut group = c.benchmark_group("exchange");
    let gate = published_gate(0);

    group.throughput(Throughput::Elements(1));
    group.bench_function("single_writer", |b| {
        let mut value = 0u64;
        b.iter(|| {
            value += 1;
            let builder = gate.make_version().expect("slot");
            builder.set_object(Box::into_raw(Box::new(value)) as *mut (), core::ptr::null_mut());
            gate.exchange(0, builder);
        });
    });

    group.finish();
}

fn bench_mixed(c: &mut Criterion) {
    let mut group = c.benchmark_group("mixed_readers_one_writer");

    for readers in [2, 4].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(readers),
            readers,
            |b, &num_readers| {
                let gate = published_gate(0);
                b.iter(|| {
                    thread::scope(|s| {
                        for _ in 0..num_readers {
                            s.spawn(|| {
                                for _ in 0..1000 {
                                    if let Some(version) = gate.acquire(0) {
                                        black_box(version.object());
                                        version.release();
                                    }
                                }
                            });
                        }
                        s.spawn(|| {
                            for value in 0..100u64 {
                                let builder = gate.make_version().expect("slot");
                                builder.set_object(
                                    Box::into_raw(Box::new(value)) as *mut (),
                                    core::ptr::null_mut(),
                                );
                                gate.exchange(0, builder);
                            }
                        });
                    });
                });
            },
        );
    }

    group.finish();
}

fn bench_rwlock_baseline(c: &mut Criterion) {
    let mut group = c.benchmark_group("rwlock_baseline");
    let lock = RwLock::new(42u64);

    group.bench_function("read_single_thread", |b| {
        b.iter(|| {
            let guard = lock.read().unwrap();
            black_box(*guard);
        });
    });

    for threads in [2, 4, 8].iter() {
        group.bench_with_input(
            BenchmarkId::new("read_concurrent", threads),
            threads,
            |b, &num_threads| {
                b.iter(|| {
                    thread::scope(|s| {
                        for _ in 0..num_threads {
                            s.spawn(|| {
                                for _ in 0..1000 {
                                    let guard = lock.read().unwrap();
                                    black_box(*guard);
                                }
                            });
                        }
                    });
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_acquire_release,
    bench_exchange,
    bench_mixed,
    bench_rwlock_baseline
);
criterion_main!(benches);
