//! A fixed-capacity block of [`Slot`]s linked into the [`Queue`]'s chain.
//!
//! Every node carries [`NODE_SIZE`] slots, a single-assignment successor
//! pointer and a control block that decides when the node may be freed. The
//! node is over-aligned so that a node pointer leaves [`TAG_BITS`] low bits
//! free for the slot index packed into the queue's head and tail words.
//!
//! # Reclamation
//!
//! A retired node is freed once three independent conditions have all been
//! observed, each recorded as one monotone bit in the control block:
//!
//! ```txt
//! SLOTS 0b001 -> the slot sweep reached the end of the array, i.e. every
//!                slot has received both its producer and consumer visit
//! ENQ   0b010 -> the last slow-path enqueue on this node has completed
//! DEQ   0b100 -> the last slow-path dequeue on this node has completed
//! ```
//!
//! The slow-path counts work like a reference count that is only resolved at
//! the end: every slow-path operation bumps its side's current count as its
//! final access to the node, and the one thread that wins the head (or tail)
//! swing stamps the side's final count, taken from the tag value the swing
//! observed. Whichever access sets the third flag frees the node, exactly
//! once.
//!
//! [`Queue`]: crate::queue::Queue
//! [`TAG_BITS`]: crate::marked_ptr::TAG_BITS

use crate::cache_pad::CachePad;
use crate::marked_ptr::TAG_BITS;
use crate::slot::{self, Slot};
use crate::variant::sync::atomic::{AtomicPtr, AtomicU32, AtomicU8, Ordering};

/// A block of slots plus the bookkeeping required to free it safely.
#[derive(Debug)]
#[repr(align(2048))]
pub(crate) struct Node {
    /// The successor node, null until a slow-path enqueue appends one.
    /// Single-assignment: once non-null it never changes again.
    pub(crate) next: AtomicPtr<Node>,

    /// Reclamation bookkeeping, padded away from the slot array so counter
    /// updates do not contend with slot traffic.
    ctrl: CachePad<CtrlBlock>,

    /// The element positions handed out by index.
    pub(crate) slots: [Slot; NODE_SIZE],
}

// The tag arithmetic relies on node pointers having TAG_BITS free low bits.
const _: () = assert!(align_of::<Node>() >= 1 << TAG_BITS);

/// Per-side operation counts and the reclamation flags.
#[derive(Debug)]
struct CtrlBlock {
    /// Low 16 bits: completed slow-path enqueues, high 16 bits: final count.
    enq_count: AtomicU32,
    /// Low 16 bits: completed slow-path dequeues, high 16 bits: final count.
    deq_count: AtomicU32,
    /// The three reclamation bits, monotonically accumulated.
    reclaim_flags: AtomicU8,
}

impl CtrlBlock {
    #[cfg(not(loom))]
    const fn new() -> Self {
        Self {
            enq_count: AtomicU32::new(0),
            deq_count: AtomicU32::new(0),
            reclaim_flags: AtomicU8::new(0),
        }
    }

    #[cfg(loom)]
    fn new() -> Self {
        Self {
            enq_count: AtomicU32::new(0),
            deq_count: AtomicU32::new(0),
            reclaim_flags: AtomicU8::new(0),
        }
    }
}

impl Node {
    #[cfg(not(loom))]
    fn empty() -> Self {
        Self {
            next: AtomicPtr::new(std::ptr::null_mut()),
            ctrl: CachePad::new(CtrlBlock::new()),
            slots: [Slot::UNINIT; NODE_SIZE],
        }
    }

    // Loom atomics cannot be used in constants, so the slot array is built
    // element-wise when model checking.
    #[cfg(loom)]
    fn empty() -> Self {
        Self {
            next: AtomicPtr::new(std::ptr::null_mut()),
            ctrl: CachePad::new(CtrlBlock::new()),
            slots: std::array::from_fn(|_| Slot::new()),
        }
    }

    /// Allocates an empty node, e.g. the sentinel installed at construction.
    pub(crate) fn alloc() -> *mut Self {
        Box::into_raw(Box::new(Self::empty()))
    }

    /// Allocates a node carrying `elem_bits` as a tentative first element.
    ///
    /// The plain store is sufficient: the allocating producer has not yet
    /// linked the node into the queue, so no other thread can observe it.
    pub(crate) fn alloc_with_first(elem_bits: usize) -> *mut Self {
        let node = Self::empty();
        node.slots[0].init_first(elem_bits);
        Box::into_raw(Box::new(node))
    }

    /// Sweeps the slot array from `start_idx`, freeing the node if the sweep
    /// reaches the end and both slow-path sides have already finished.
    ///
    /// A slot that has not received both visits gets its `RESUME` bit set; if
    /// it still lacks a visit afterwards the sweep stops here and the slot's
    /// final visitor will pick it back up at the following index.
    ///
    /// # Safety
    ///
    /// `node` must point to a live node of this queue and the caller must be
    /// entitled to sweep, i.e. be the first slow-path dequeuer or a visitor
    /// that observed the `RESUME` bit.
    pub(crate) unsafe fn try_reclaim(node: *mut Self, start_idx: usize) {
        for idx in start_idx..NODE_SIZE {
            let slot = unsafe { (*node).slots.get_unchecked(idx) };
            if !slot::is_consumed(slot.inspect()) && !slot::is_consumed(slot.mark_resume()) {
                return;
            }
        }

        // Every slot has both visits, so no fast-path operation can still be
        // accessing the node.
        let flags = unsafe { &(*node).ctrl }
            .reclaim_flags
            .fetch_add(SLOTS, Ordering::AcqRel);
        if flags == ENQ | DEQ {
            drop(unsafe { Box::from_raw(node) });
        }
    }

    /// Records one completed slow-path enqueue; the head/tail-swing winner
    /// passes the side's final count to stamp it in the same atomic step.
    ///
    /// # Safety
    ///
    /// `node` must point to a live node this operation's tail fetch-add was
    /// performed on, and this must be the operation's last access to it.
    pub(crate) unsafe fn incr_enqueue_count(node: *mut Self, final_count: Option<u16>) {
        let ctrl = unsafe { &(*node).ctrl };
        let counts = match final_count {
            Some(count) => incr_counter_final(&ctrl.enq_count, count),
            None => incr_counter(&ctrl.enq_count),
        };

        unsafe { Self::try_free_after_incr(node, counts, ENQ, SLOTS | DEQ) };
    }

    /// The dequeue-side counterpart of [`Node::incr_enqueue_count`].
    ///
    /// # Safety
    ///
    /// Same contract, for the head side.
    pub(crate) unsafe fn incr_dequeue_count(node: *mut Self, final_count: Option<u16>) {
        let ctrl = unsafe { &(*node).ctrl };
        let counts = match final_count {
            Some(count) => incr_counter_final(&ctrl.deq_count, count),
            None => incr_counter(&ctrl.deq_count),
        };

        unsafe { Self::try_free_after_incr(node, counts, DEQ, SLOTS | ENQ) };
    }

    /// Sets `flag` once a side's current count has caught up with its final
    /// count and frees the node if the other two flags were already set.
    unsafe fn try_free_after_incr(node: *mut Self, counts: (u16, u16), flag: u8, expected: u8) {
        let (curr_count, final_count) = counts;
        if curr_count == final_count {
            let flags = unsafe { &(*node).ctrl }
                .reclaim_flags
                .fetch_add(flag, Ordering::AcqRel);
            if flags == expected {
                drop(unsafe { Box::from_raw(node) });
            }
        }
    }
}

/// Bumps the current count, returning `(new current, observed final)`.
///
/// An unstamped final count reads as zero, which a non-zero current count can
/// never equal, so the comparison stays conservative until the swing winner
/// has stamped the real value.
fn incr_counter(counter: &AtomicU32) -> (u16, u16) {
    let prev = counter.fetch_add(1, Ordering::Relaxed);
    (((prev & COUNT_MASK) + 1) as u16, (prev >> FINAL_SHIFT) as u16)
}

/// Bumps the current count and stamps the final count in one atomic add,
/// returning `(new current, stamped final)`.
fn incr_counter_final(counter: &AtomicU32, final_count: u16) -> (u16, u16) {
    let add = 1 + (u32::from(final_count) << FINAL_SHIFT);
    let prev = counter.fetch_add(add, Ordering::Relaxed);
    (((prev & COUNT_MASK) + 1) as u16, final_count)
}

/// The number of slots per node.
#[cfg(not(loom))]
pub(crate) const NODE_SIZE: usize = 1024;

/// The number of slots per node.
///
/// Shrunk under loom so the model checker can drive operations across node
/// boundaries in a tractable number of interleavings. The protocol logic is
/// unaffected.
#[cfg(loom)]
pub(crate) const NODE_SIZE: usize = 4;

/// Bit-shift to the final count half of a side counter.
const FINAL_SHIFT: u32 = 16;

/// Mask of the current count half of a side counter.
const COUNT_MASK: u32 = 0xFFFF;

/// Reclaim flag: the slot sweep reached the end of the array.
pub(crate) const SLOTS: u8 = 0b001;

/// Reclaim flag: all slow-path enqueues on the node have completed.
pub(crate) const ENQ: u8 = 0b010;

/// Reclaim flag: all slow-path dequeues on the node have completed.
pub(crate) const DEQ: u8 = 0b100;
