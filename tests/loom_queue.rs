#![cfg(loom)]

use faa_queue::Queue;

use loom::thread;

use std::ptr::NonNull;

// When building with the `--cfg loom` flag, each node holds 4 slots. The
// models below move 5 elements so every execution crosses a node boundary,
// exercising the slow paths and the reclamation hand-off.
//
// Run all models:
//
// RUSTFLAGS="--cfg loom" cargo test --package faa-queue --test loom_queue --release
//
// Some of these models take a while to explore exhaustively. Set
// LOOM_MAX_PREEMPTIONS=2 (or =3) to bound the search and cut the duration.

fn handle(id: u32) -> *mut u32 {
    Box::into_raw(Box::new(id))
}

unsafe fn redeem(elem: NonNull<u32>) -> u32 {
    *unsafe { Box::from_raw(elem.as_ptr()) }
}

// RUSTFLAGS="--cfg loom" cargo test --package faa-queue --test loom_queue --release -- test_mpsc --exact
#[test]
fn test_mpsc() {
    loom::model(|| {
        const COUNT: u32 = 5;

        let queue: Queue<u32> = Queue::new();

        let q1 = queue.clone();
        let th1 = thread::spawn(move || {
            for id in 0..3 {
                q1.push(handle(id)).unwrap();
            }
        });

        let q2 = queue.clone();
        let th2 = thread::spawn(move || {
            for id in 3..5 {
                q2.push(handle(id)).unwrap();
            }
        });

        th1.join().unwrap();
        th2.join().unwrap();

        for _ in 0..COUNT {
            let elem = queue.pop().unwrap();
            assert!(unsafe { redeem(elem) } < COUNT);
        }

        assert!(queue.pop().is_none());
    });
}

// RUSTFLAGS="--cfg loom" cargo test --package faa-queue --test loom_queue --release -- test_spmc --exact
#[test]
fn test_spmc() {
    loom::model(|| {
        const COUNT: u32 = 5;

        let queue: Queue<u32> = Queue::new();

        for id in 0..COUNT {
            queue.push(handle(id)).unwrap();
        }

        let q1 = queue.clone();
        let th1 = thread::spawn(move || {
            let mut taken = 0;
            while let Some(elem) = q1.pop() {
                unsafe { redeem(elem) };
                taken += 1;
            }
            taken
        });

        let q2 = queue.clone();
        let th2 = thread::spawn(move || {
            let mut taken = 0;
            while let Some(elem) = q2.pop() {
                unsafe { redeem(elem) };
                taken += 1;
            }
            taken
        });

        let taken = th1.join().unwrap() + th2.join().unwrap();
        assert_eq!(taken, COUNT);
    });
}

// RUSTFLAGS="--cfg loom" cargo test --package faa-queue --test loom_queue --release -- test_concurrent_push_and_pop --exact
#[test]
fn test_concurrent_push_and_pop() {
    loom::model(|| {
        const COUNT: u32 = 5;

        let queue: Queue<u32> = Queue::new();

        let q1 = queue.clone();
        let th1 = thread::spawn(move || {
            for id in 0..COUNT {
                q1.push(handle(id)).unwrap();
            }
        });

        let q2 = queue.clone();
        let th2 = thread::spawn(move || {
            for _ in 0..COUNT {
                loop {
                    if let Some(elem) = q2.pop() {
                        unsafe { redeem(elem) };
                        break;
                    }

                    // Loom's scheduler is not fair. Yielding tells it this
                    // thread cannot make progress until the producer runs.
                    thread::yield_now();
                }
            }
        });

        th1.join().unwrap();
        th2.join().unwrap();

        assert!(queue.pop().is_none());
    });
}
