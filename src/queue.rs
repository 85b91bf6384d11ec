//! A lock-free multi-producer multi-consumer unbounded FIFO queue.
//!
//! The queue is a singly-linked chain of fixed-capacity array [`Node`]s. The
//! head and tail are each a single [marked word] combining a node pointer
//! with the index of the next slot to hand out, so reserving a slot is one
//! fetch-and-add. When the reserved index runs past the node's capacity the
//! operation takes the slow path, which appends or helps publish a successor
//! node and participates in the retired node's reclamation accounting.
//!
//! [marked word]: crate::marked_ptr::MarkedPtr

use crate::cache_pad::CachePad;
use crate::marked_ptr::{MarkedPtr, TAG_BITS};
use crate::node::{Node, NODE_SIZE};
use crate::slot;
use crate::variant::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use crate::variant::sync::Arc;

use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use thiserror::Error;

/// The maximum number of threads that may concurrently push.
///
/// The slot index occupies `TAG_BITS` bits of the tail word and every
/// concurrent push may add one to it past the node capacity before the tail
/// is swung to a successor, so the safe bound is
/// `2^TAG_BITS - NODE_SIZE + 1`.
pub const MAX_PRODUCERS: usize = (1 << TAG_BITS) - NODE_SIZE + 1;

/// The maximum number of threads that may concurrently pop.
///
/// Half of [`MAX_PRODUCERS`], since a popping thread may drive the head
/// index forward twice per attempt (once to reserve, once to re-check).
pub const MAX_CONSUMERS: usize = MAX_PRODUCERS / 2;

/// The error returned when a pushed element handle is rejected.
///
/// Rejection happens before any queue state is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PushError {
    /// The element handle was null.
    #[error("element handle must not be null")]
    Null,
    /// The element handle had one of its two low bits set.
    #[error("element handle must be at least 4-byte aligned")]
    Misaligned,
}

/// The error returned when a construction-time thread hint exceeds the
/// supported participation bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error(
    "{producers} producers / {consumers} consumers exceed the supported bounds ({} / {})",
    MAX_PRODUCERS,
    MAX_CONSUMERS
)]
pub struct ThreadBoundsError {
    /// The rejected producer hint.
    pub producers: usize,
    /// The rejected consumer hint.
    pub consumers: usize,
}

/// A lock-free multi-producer multi-consumer unbounded FIFO queue of opaque
/// element handles.
///
/// The queue stores raw `*mut T` handles that must be non-null and at least
/// 4-byte aligned; it never reads, clones or frees the pointed-to objects.
/// Cloning the queue clones a handle to the same shared instance; the
/// internal nodes are freed by the reclamation protocol as both ends move
/// past them, and the remaining chain is freed when the last handle is
/// dropped.
///
/// At most [`MAX_PRODUCERS`] threads may push and at most [`MAX_CONSUMERS`]
/// threads may pop concurrently. Use [`Queue::with_thread_bounds`] to have
/// these limits checked against an explicit hint.
///
/// # Examples
///
/// ```
/// use faa_queue::Queue;
///
/// let queue: Queue<u32> = Queue::new();
///
/// queue.push(Box::into_raw(Box::new(1))).unwrap();
/// queue.push(Box::into_raw(Box::new(2))).unwrap();
///
/// let first = queue.pop().unwrap();
/// assert_eq!(unsafe { *Box::from_raw(first.as_ptr()) }, 1);
/// let second = queue.pop().unwrap();
/// assert_eq!(unsafe { *Box::from_raw(second.as_ptr()) }, 2);
///
/// assert!(queue.pop().is_none());
/// ```
///
/// Handles may be produced and consumed from any mix of threads:
///
/// ```
/// use faa_queue::Queue;
/// use std::thread;
///
/// const COUNT: u32 = 100;
/// const THREADS: u32 = 4;
///
/// let queue: Queue<u32> = Queue::new();
///
/// let producers: Vec<_> = (0..THREADS)
///     .map(|_| {
///         let q = queue.clone();
///         thread::spawn(move || {
///             for i in 0..COUNT {
///                 q.push(Box::into_raw(Box::new(i))).unwrap();
///             }
///         })
///     })
///     .collect();
///
/// let consumers: Vec<_> = (0..THREADS)
///     .map(|_| {
///         let q = queue.clone();
///         thread::spawn(move || {
///             let mut sum = 0_u64;
///             for _ in 0..COUNT {
///                 let elem = loop {
///                     if let Some(elem) = q.pop() {
///                         break elem;
///                     }
///                     thread::yield_now();
///                 };
///                 sum += u64::from(unsafe { *Box::from_raw(elem.as_ptr()) });
///             }
///             sum
///         })
///     })
///     .collect();
///
/// for th in producers {
///     th.join().unwrap();
/// }
///
/// let sum: u64 = consumers.into_iter().map(|th| th.join().unwrap()).sum();
/// assert_eq!(sum, u64::from(THREADS) * u64::from(COUNT * (COUNT - 1)) / 2);
/// assert!(queue.pop().is_none());
/// ```
pub struct Queue<T> {
    inner: Arc<RawQueue<T>>,
}

impl<T> Queue<T> {
    /// Creates a new empty [`Queue`].
    ///
    /// # Examples
    ///
    /// ```
    /// use faa_queue::Queue;
    ///
    /// let queue = Queue::<usize>::new();
    /// ```
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RawQueue::new()),
        }
    }

    /// Creates a new empty [`Queue`], rejecting thread hints beyond the
    /// supported participation bounds.
    ///
    /// # Errors
    ///
    /// Fails if `producers` exceeds [`MAX_PRODUCERS`] or `consumers` exceeds
    /// [`MAX_CONSUMERS`].
    ///
    /// # Examples
    ///
    /// ```
    /// use faa_queue::{Queue, MAX_PRODUCERS};
    ///
    /// assert!(Queue::<usize>::with_thread_bounds(8, 8).is_ok());
    /// assert!(Queue::<usize>::with_thread_bounds(MAX_PRODUCERS + 1, 8).is_err());
    /// ```
    pub fn with_thread_bounds(
        producers: usize,
        consumers: usize,
    ) -> Result<Self, ThreadBoundsError> {
        if producers > MAX_PRODUCERS || consumers > MAX_CONSUMERS {
            return Err(ThreadBoundsError {
                producers,
                consumers,
            });
        }

        Ok(Self::new())
    }

    /// Pushes an element handle onto the back of the [`Queue`].
    ///
    /// The queue takes no ownership of the pointed-to object; the caller
    /// remains responsible for its lifetime until the handle is popped.
    ///
    /// # Errors
    ///
    /// Fails without touching the queue if `elem` is null or not at least
    /// 4-byte aligned (the two low bits of every handle are reserved for
    /// slot state).
    pub fn push(&self, elem: *mut T) -> Result<(), PushError> {
        if elem.is_null() {
            return Err(PushError::Null);
        }

        let elem_bits = elem as usize;
        if elem_bits & slot::STATE_MASK != 0 {
            return Err(PushError::Misaligned);
        }

        self.inner.push(elem_bits);
        Ok(())
    }

    /// Pops the element handle at the front of the [`Queue`], or `None` if
    /// the queue was observed empty.
    pub fn pop(&self) -> Option<NonNull<T>> {
        self.inner
            .pop()
            .and_then(|elem_bits| NonNull::new(elem_bits as *mut T))
    }
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue").finish_non_exhaustive()
    }
}

/// The queue root: the two marked index words plus the cached tail pointer,
/// each on its own cache line.
struct RawQueue<T> {
    /// Marked word: the current head node and the next dequeue index.
    head: CachePad<AtomicUsize>,
    /// Marked word: the current tail node and the next enqueue index.
    tail: CachePad<AtomicUsize>,
    /// Kept approximately equal to the tail word's node pointer; lets the
    /// empty check skip loading the contended tail word outright. Stale
    /// values self-heal, no correctness depends on it.
    cached_tail: CachePad<AtomicPtr<Node>>,
    /// The queue hands `*mut T` between threads without touching the
    /// pointed-to objects.
    _marker: PhantomData<*mut T>,
}

// Handles are moved between threads, hence the `T: Send` bound; the queue
// itself only ever touches its own atomics.
unsafe impl<T: Send> Send for RawQueue<T> {}
unsafe impl<T: Send> Sync for RawQueue<T> {}

impl<T> RawQueue<T> {
    fn new() -> Self {
        let sentinel = Node::alloc();
        let root = MarkedPtr::compose(sentinel, 0).into_raw();

        Self {
            head: CachePad::new(AtomicUsize::new(root)),
            tail: CachePad::new(AtomicUsize::new(root)),
            cached_tail: CachePad::new(AtomicPtr::new(sentinel)),
            _marker: PhantomData,
        }
    }

    fn push(&self, elem_bits: usize) {
        loop {
            // Reserve an (index, node) pair in one atomic step.
            let curr = MarkedPtr::from_raw(self.tail.fetch_add(1, Ordering::Acquire));
            let (tail, idx) = curr.decompose();

            self.update_cached_tail(tail);

            if idx < NODE_SIZE {
                // ** fast path ** write access to the slot at `idx` is
                // uniquely reserved
                let state = unsafe { (*tail).slots.get_unchecked(idx) }.fill(elem_bits);

                if state <= slot::RESUME {
                    // no consumer has been here, the element is published
                    return;
                }

                if state == slot::READER | slot::RESUME {
                    // the consumer abandoned the slot and a sweeper asked its
                    // final visitor (this thread) to carry the sweep forward
                    unsafe { Node::try_reclaim(tail, idx + 1) };
                }

                // slot abandoned by an early consumer, retry on another one
            } else {
                // ** slow path ** the node is exhausted, append or help
                // publish a successor
                match unsafe { self.try_advance_tail(elem_bits, tail) } {
                    AdvanceTail::AdvancedAndInserted => return,
                    AdvanceTail::Advanced => {}
                }
            }
        }
    }

    fn pop(&self) -> Option<usize> {
        loop {
            // Cheap empty check before the dequeue index is driven forward;
            // the zero-delta add takes the line exclusively, which the
            // subsequent increment would want anyway.
            let curr = MarkedPtr::<Node>::from_raw(self.head.fetch_add(0, Ordering::Relaxed));
            let (head, deq_idx) = curr.decompose();

            if head == self.cached_tail.load(Ordering::Relaxed) {
                let (tail, enq_idx) =
                    MarkedPtr::<Node>::from_raw(self.tail.load(Ordering::Relaxed)).decompose();
                if head == tail && (deq_idx >= NODE_SIZE || enq_idx <= deq_idx) {
                    return None;
                }
            }

            let curr = MarkedPtr::<Node>::from_raw(self.head.fetch_add(1, Ordering::Acquire));
            let (head, idx) = curr.decompose();

            if idx < NODE_SIZE {
                // ** fast path ** read access to the slot at `idx` is
                // uniquely reserved
                let state = unsafe { (*head).slots.get_unchecked(idx) }.claim();

                let elem_bits = state & slot::ELEM_MASK;
                if elem_bits != 0 {
                    if state & slot::RESUME != 0 {
                        // this visit completed the slot, carry the sweep on
                        unsafe { Node::try_reclaim(head, idx + 1) };
                    }

                    return Some(elem_bits);
                }

                // arrived before the producer, abandon the slot and retry
            } else {
                // ** slow path ** the head node is exhausted and must be
                // replaced by its successor, if there is one
                match unsafe { self.try_advance_head(curr, head, idx) } {
                    AdvanceHead::QueueEmpty => return None,
                    AdvanceHead::Advanced => {}
                }
            }
        }
    }

    /// Appends a node carrying `elem_bits` in its first slot, or helps
    /// publish a successor appended by another thread.
    ///
    /// Exactly one pushing thread returns [`AdvanceTail::AdvancedAndInserted`]
    /// per appended node; every caller contributes one enqueue count to
    /// `tail` as its final access.
    ///
    /// # Safety
    ///
    /// `tail` must be the node this operation's tail fetch-add resolved to.
    unsafe fn try_advance_tail(&self, elem_bits: usize, tail: *mut Node) -> AdvanceTail {
        let mut curr = MarkedPtr::from_raw(self.tail.load(Ordering::Relaxed));

        if tail != curr.ptr() {
            // another thread already swung the tail, retrying will likely
            // take the fast path on the new node
            unsafe { Node::incr_enqueue_count(tail, None) };
            return AdvanceTail::Advanced;
        }

        let next = unsafe { &(*tail).next }.load(Ordering::Acquire);

        if next.is_null() {
            // speculatively allocate a successor carrying `elem_bits`; it is
            // not published unless the compare-exchange below succeeds
            let node = Node::alloc_with_first(elem_bits);

            match unsafe { &(*tail).next }.compare_exchange(
                ptr::null_mut(),
                node,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    unsafe { self.swing_tail(&mut curr, node, tail) };
                    self.update_cached_tail(node);
                    AdvanceTail::AdvancedAndInserted
                }
                Err(appended) => {
                    // lost the append race; the local node was never visible
                    // to any other thread
                    drop(unsafe { Box::from_raw(node) });
                    unsafe { self.swing_tail(&mut curr, appended, tail) };
                    self.update_cached_tail(appended);
                    AdvanceTail::Advanced
                }
            }
        } else {
            unsafe { self.swing_tail(&mut curr, next, tail) };
            self.update_cached_tail(next);
            AdvanceTail::Advanced
        }
    }

    /// Swings the head word to the successor node, if one exists.
    ///
    /// Every caller contributes one dequeue count to `head` as its final
    /// access; the first slow-path dequeuer additionally initiates the
    /// retired node's slot sweep.
    ///
    /// # Safety
    ///
    /// `curr` must be the unmodified pre-image of this operation's head
    /// fetch-add and `head`/`idx` its decomposition.
    unsafe fn try_advance_head(
        &self,
        mut curr: MarkedPtr<Node>,
        head: *mut Node,
        idx: usize,
    ) -> AdvanceHead {
        if idx == NODE_SIZE {
            // the very first slow-path dequeuer sweeps from the start; all
            // previous operations on this node have at least been initiated
            unsafe { Node::try_reclaim(head, 0) };
        }

        let tail = MarkedPtr::<Node>::from_raw(self.tail.load(Ordering::Acquire)).ptr();
        if head == tail {
            // the tail has not moved past this node, so there is nothing
            // left to take
            unsafe { Node::incr_dequeue_count(head, None) };
            return AdvanceHead::QueueEmpty;
        }

        // the successor is linked before the tail is swung, so it is visible
        // by now; a null successor equally means the chain ends here
        let next = unsafe { &(*head).next }.load(Ordering::Acquire);
        if next.is_null() {
            unsafe { Node::incr_dequeue_count(head, None) };
            return AdvanceHead::QueueEmpty;
        }

        curr.inc_tag(1);
        if Self::bounded_cas_loop(&self.head, &mut curr, MarkedPtr::compose(next, 0), head) {
            // the winning thread observed the final dequeue index of this
            // node and stamps the final count
            unsafe { Node::incr_dequeue_count(head, Some((curr.tag() - NODE_SIZE) as u16)) };
        } else {
            unsafe { Node::incr_dequeue_count(head, None) };
        }

        AdvanceHead::Advanced
    }

    /// Runs the bounded CAS loop swinging the tail word from `tail` to
    /// `next` (index 1, accounting for the tentative first element) and
    /// contributes this operation's enqueue count, final on the winner.
    ///
    /// # Safety
    ///
    /// `tail` must be the node this operation's tail fetch-add resolved to
    /// and `curr` the latest observed tail word pointing at it.
    unsafe fn swing_tail(&self, curr: &mut MarkedPtr<Node>, next: *mut Node, tail: *mut Node) {
        if Self::bounded_cas_loop(&self.tail, curr, MarkedPtr::compose(next, 1), tail) {
            unsafe { Node::incr_enqueue_count(tail, Some((curr.tag() - NODE_SIZE) as u16)) };
        } else {
            unsafe { Node::incr_enqueue_count(tail, None) };
        }
    }

    /// Attempts to exchange `expected` for `desired` until either the CAS
    /// succeeds or the observed pointer component no longer matches
    /// `old_node`.
    ///
    /// The early exit bounds the loop: index fetch-adds alone can never fail
    /// it, only an actual node swing can, so some thread always completes.
    /// On return `expected` holds the last observed word.
    fn bounded_cas_loop(
        word: &AtomicUsize,
        expected: &mut MarkedPtr<Node>,
        desired: MarkedPtr<Node>,
        old_node: *mut Node,
    ) -> bool {
        loop {
            match word.compare_exchange_weak(
                expected.into_raw(),
                desired.into_raw(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => {
                    *expected = MarkedPtr::from_raw(actual);
                    if expected.ptr() != old_node {
                        return false;
                    }
                }
            }
        }
    }

    /// Nudges the cached tail pointer towards `tail`.
    ///
    /// A lost race or a transient regression only costs an extra tail load
    /// on some later empty check.
    fn update_cached_tail(&self, tail: *mut Node) {
        let cached = self.cached_tail.load(Ordering::Relaxed);
        if cached != tail {
            let _ = self
                .cached_tail
                .compare_exchange(cached, tail, Ordering::Release, Ordering::Relaxed);
        }
    }
}

impl<T> Drop for RawQueue<T> {
    fn drop(&mut self) {
        // Exclusive access: walk the remaining chain and free every node.
        // The stored handles are borrowed, so only the nodes are freed.
        let mut curr = MarkedPtr::<Node>::from_raw(self.head.load(Ordering::Relaxed)).ptr();
        while !curr.is_null() {
            let next = unsafe { &(*curr).next }.load(Ordering::Relaxed);
            drop(unsafe { Box::from_raw(curr) });
            curr = next;
        }
    }
}

/// Result of the tail-advance slow path.
enum AdvanceTail {
    /// The tail was swung to a successor; the element still needs a slot.
    Advanced,
    /// The tail was swung to a successor carrying the element in its first
    /// slot.
    AdvancedAndInserted,
}

/// Result of the head-advance slow path.
enum AdvanceHead {
    /// The head node was exhausted and no successor exists.
    QueueEmpty,
    /// The head was swung to the successor node.
    Advanced,
}
