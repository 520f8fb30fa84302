// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use qsync::locks::{FairMutex, Mutex, ReentrantLock, RwLock, Semaphore};
use std::hint::black_box;
use std::thread;

const OPS: usize = 10_000;

fn uncontended(c: &mut Criterion) {
    let mut group = c.benchmark_group("uncontended");

    group.bench_function("mutex", |b| {
        let m = Mutex::new(0_usize);
        b.iter(|| *m.lock() += 1);
    });

    group.bench_function("std_mutex", |b| {
        let m = std::sync::Mutex::new(0_usize);
        b.iter(|| *m.lock().unwrap() += 1);
    });

    group.bench_function("reentrant_lock", |b| {
        let lock = ReentrantLock::new();
        b.iter(|| {
            lock.lock();
            black_box(lock.hold_count());
            lock.unlock();
        });
    });

    group.bench_function("rwlock_read", |b| {
        let lock = RwLock::new(0_usize);
        b.iter(|| black_box(*lock.read()));
    });

    group.bench_function("semaphore", |b| {
        let sem = Semaphore::new(1);
        b.iter(|| {
            sem.acquire_uninterruptibly();
            sem.release();
        });
    });

    group.finish();
}

fn contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended");

    for threads in [2, 4, 8] {
        group.bench_with_input(BenchmarkId::new("mutex", threads), &threads, |b, &threads| {
            let m = Mutex::new(0_usize);
            b.iter(|| {
                thread::scope(|s| {
                    for _ in 0..threads {
                        s.spawn(|| {
                            for _ in 0..OPS / threads {
                                *m.lock() += 1;
                            }
                        });
                    }
                });
            });
        });

        group.bench_with_input(
            BenchmarkId::new("fair_mutex", threads),
            &threads,
            |b, &threads| {
                let m = FairMutex::new(0_usize);
                b.iter(|| {
                    thread::scope(|s| {
                        for _ in 0..threads {
                            s.spawn(|| {
                                for _ in 0..OPS / threads {
                                    *m.lock() += 1;
                                }
                            });
                        }
                    });
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("std_mutex", threads),
            &threads,
            |b, &threads| {
                let m = std::sync::Mutex::new(0_usize);
                b.iter(|| {
                    thread::scope(|s| {
                        for _ in 0..threads {
                            s.spawn(|| {
                                for _ in 0..OPS / threads {
                                    *m.lock().unwrap() += 1;
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

criterion_group!(benches, uncontended, contended);
criterion_main!(benches);
