#![deny(
    warnings,
    rustdoc::broken_intra_doc_links,
    rustdoc::private_intra_doc_links,
    missing_docs,
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unsafe_op_in_unsafe_fn,
    unused_crate_dependencies,
    unused_extern_crates,
    unused_import_braces,
    unused_lifetimes,
    unused_qualifications,
    unused_results,
    rust_2018_idioms
)]

//! A lock-free multi-producer multi-consumer unbounded FIFO queue built on
//! fetch-and-add.
//!
//! The queue stores opaque element handles: non-null, at least 4-byte
//! aligned `*mut T` pointers whose pointed-to objects it never touches. Both
//! ends coordinate through fetch-and-add on a single tagged word per end, so
//! under contention threads spread over distinct slots instead of fighting
//! over one compare-and-swap like in link-per-element queues. Retired array
//! nodes are freed through a flag-and-count protocol instead of hazard
//! pointers or epochs, keeping the fast paths free of any reclamation
//! indirection.
//!
//! Both operations are lock-free: no thread ever holds an exclusive lease
//! that can stall the others, and some contending thread always completes in
//! a bounded number of steps. [`Queue::pop`] returns `None` instead of
//! blocking when the queue is observed empty.
//!
//! At most [`MAX_PRODUCERS`] threads may push and [`MAX_CONSUMERS`] threads
//! may pop concurrently; the limits derive from the width of the index tag
//! embedded in the head and tail words.
//!
//! # Examples
//!
//! ```
//! use faa_queue::Queue;
//!
//! const COUNT: usize = 1_000;
//! let queue: Queue<usize> = Queue::new();
//!
//! for i in 0..COUNT {
//!     queue.push(Box::into_raw(Box::new(i))).unwrap();
//! }
//!
//! for i in 0..COUNT {
//!     let elem = queue.pop().unwrap();
//!     assert_eq!(i, unsafe { *Box::from_raw(elem.as_ptr()) });
//! }
//!
//! assert!(queue.pop().is_none());
//! ```
//!
//! Handles that fail the argument contract are rejected without touching the
//! queue:
//!
//! ```
//! use faa_queue::{PushError, Queue};
//!
//! let queue: Queue<u32> = Queue::new();
//! let elem = Box::into_raw(Box::new(7_u32));
//!
//! assert_eq!(queue.push(std::ptr::null_mut()), Err(PushError::Null));
//! assert_eq!(
//!     queue.push((elem as usize | 1) as *mut u32),
//!     Err(PushError::Misaligned),
//! );
//!
//! queue.push(elem).unwrap();
//! let elem = queue.pop().unwrap();
//! assert_eq!(unsafe { *Box::from_raw(elem.as_ptr()) }, 7);
//! ```

#[cfg(test)]
use criterion as _;

mod queue;

pub(crate) mod cache_pad;
pub(crate) mod marked_ptr;
pub(crate) mod node;
pub(crate) mod slot;
pub(crate) mod variant;

pub use queue::{PushError, Queue, ThreadBoundsError, MAX_CONSUMERS, MAX_PRODUCERS};
