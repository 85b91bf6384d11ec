use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use faa_queue::Queue;

use std::sync::{Arc, Barrier};
use std::thread;

const OPS_PER_THREAD: usize = 100_000;

/// Every thread alternates one push of its own id cell with one pop of
/// whatever sits at the front, the classic pairwise contention shape.
fn bench_pairs(c: &mut Criterion) {
    let mut group = c.benchmark_group("pairs");

    for &threads in &[1, 2, 4, 8] {
        group.throughput(Throughput::Elements((threads * OPS_PER_THREAD * 2) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                b.iter(|| {
                    let queue: Queue<usize> = Queue::new();
                    let barrier = Arc::new(Barrier::new(threads));

                    let ths: Vec<_> = (0..threads)
                        .map(|id| {
                            let q = queue.clone();
                            let barrier = Arc::clone(&barrier);
                            thread::spawn(move || {
                                let mut id = id;
                                let elem = &mut id as *mut usize;
                                barrier.wait();

                                for _ in 0..OPS_PER_THREAD {
                                    q.push(elem).unwrap();
                                    loop {
                                        // The handles are never dereferenced,
                                        // so popping another thread's cell is
                                        // fine.
                                        if let Some(elem) = q.pop() {
                                            black_box(elem);
                                            break;
                                        }
                                        std::hint::spin_loop();
                                    }
                                }
                            })
                        })
                        .collect();

                    for th in ths {
                        th.join().unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

/// Every thread pushes a full burst, synchronizes, then pops a full burst,
/// maximizing the node turnover on both ends.
fn bench_bursts(c: &mut Criterion) {
    let mut group = c.benchmark_group("bursts");

    for &threads in &[1, 2, 4, 8] {
        group.throughput(Throughput::Elements((threads * OPS_PER_THREAD * 2) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                b.iter(|| {
                    let queue: Queue<usize> = Queue::new();
                    let barrier = Arc::new(Barrier::new(threads));

                    let ths: Vec<_> = (0..threads)
                        .map(|id| {
                            let q = queue.clone();
                            let barrier = Arc::clone(&barrier);
                            thread::spawn(move || {
                                let mut id = id;
                                let elem = &mut id as *mut usize;
                                barrier.wait();

                                for _ in 0..OPS_PER_THREAD {
                                    q.push(elem).unwrap();
                                }

                                barrier.wait();

                                for _ in 0..OPS_PER_THREAD {
                                    loop {
                                        if let Some(elem) = q.pop() {
                                            black_box(elem);
                                            break;
                                        }
                                        std::hint::spin_loop();
                                    }
                                }
                            })
                        })
                        .collect();

                    for th in ths {
                        th.join().unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_pairs, bench_bursts);
criterion_main!(benches);
