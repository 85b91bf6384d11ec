//! Holds one element of the [`Queue`] in a single atomic word.
//!
//! A slot combines the element's pointer bits with two state bits in the low
//! end of the word (elements are at least 4-byte aligned, so those bits are
//! free):
//!
//! ```txt
//! UNINIT 0b00 -> No visitor yet.
//! RESUME 0b01 -> A sweeping thread found the slot unconsumed and requests
//!                that the final visitor resume the sweep.
//! READER 0b10 -> The consumer owning this slot's index has visited.
//! ```
//!
//! Both the producer and the consumer that own a slot's index deposit their
//! contribution with a single fetch-add: the producer adds the element bits,
//! the consumer adds [`READER`]. Each side does so exactly once, so the
//! returned pre-image unambiguously tells each visitor whether the other side
//! has already been here:
//!
//! ```txt
//! producer sees 0 or RESUME          -> success, element is published
//! producer sees READER (+ RESUME)    -> consumer came first, slot abandoned
//! consumer sees elem bits (+ RESUME) -> success, element is taken
//! consumer sees 0 or RESUME          -> producer not here yet, slot abandoned
//! ```
//!
//! An abandoned slot still ends up with both contributions in it, which is
//! what lets the reclamation sweep treat "consumed" and "mutually abandoned"
//! slots alike.
//!
//! [`Queue`]: crate::queue::Queue

use crate::variant::sync::atomic::{AtomicUsize, Ordering};

/// One element position: pointer bits plus the two low state bits.
#[derive(Debug)]
pub(crate) struct Slot {
    state: AtomicUsize,
}

impl Slot {
    /// An empty slot, used to initialize whole node arrays at once.
    #[cfg(not(loom))]
    pub(crate) const UNINIT: Slot = Self {
        state: AtomicUsize::new(0),
    };

    // Loom's atomics are not const-constructible, so node arrays are built
    // slot by slot under `--cfg loom`.
    #[cfg(loom)]
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
        }
    }

    /// Deposits the element bits into the slot, publishing the element.
    ///
    /// Returns the pre-image. Only the one producer that reserved this slot's
    /// index may call this, and only once.
    pub(crate) fn fill(&self, elem_bits: usize) -> usize {
        debug_assert_eq!(elem_bits & STATE_MASK, 0);
        self.state.fetch_add(elem_bits, Ordering::Release)
    }

    /// Marks the consumer's visit, acquiring the element bits if the producer
    /// has already published them.
    ///
    /// Returns the pre-image. Only the one consumer that reserved this slot's
    /// index may call this, and only once.
    pub(crate) fn claim(&self) -> usize {
        self.state.fetch_add(READER, Ordering::Acquire)
    }

    /// Requests that the slot's final visitor resume the reclamation sweep.
    ///
    /// Returns the pre-image. Pure coordination, no data is published through
    /// this bit, hence the relaxed ordering.
    pub(crate) fn mark_resume(&self) -> usize {
        self.state.fetch_add(RESUME, Ordering::Relaxed)
    }

    /// Reads the current state without synchronization.
    pub(crate) fn inspect(&self) -> usize {
        self.state.load(Ordering::Relaxed)
    }

    /// Stores a tentative first element into slot 0 of a freshly allocated
    /// node. A plain relaxed store is enough while the node has not been
    /// linked into the queue and is therefore invisible to other threads.
    pub(crate) fn init_first(&self, elem_bits: usize) {
        debug_assert_eq!(elem_bits & STATE_MASK, 0);
        self.state.store(elem_bits, Ordering::Relaxed);
    }
}

/// Returns `true` once both the producer and the consumer owning the slot's
/// index have visited, i.e. the slot is either consumed or mutually abandoned
/// and no thread will access it through the fast path again.
pub(crate) fn is_consumed(state: usize) -> bool {
    state & ELEM_MASK != 0 && state & READER != 0
}

/// Sweep-resumption request bit.
pub(crate) const RESUME: usize = 0b01;

/// Consumer visit bit.
pub(crate) const READER: usize = 0b10;

/// Mask selecting the two state bits.
pub(crate) const STATE_MASK: usize = READER | RESUME;

/// Mask selecting the element's pointer bits.
pub(crate) const ELEM_MASK: usize = !STATE_MASK;

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    const ELEM: usize = 0x1000;

    #[test]
    fn producer_first_then_consumer() {
        let slot = Slot::UNINIT;

        assert_eq!(slot.fill(ELEM), 0);

        let state = slot.claim();
        assert_eq!(state & ELEM_MASK, ELEM);
        assert_eq!(state & RESUME, 0);
        assert!(is_consumed(slot.inspect()));
    }

    #[test]
    fn consumer_first_abandons_the_slot() {
        let slot = Slot::UNINIT;

        // The reader finds no element and moves on, but its visit still
        // settles the slot once the writer arrives.
        assert_eq!(slot.claim() & ELEM_MASK, 0);
        assert_eq!(slot.fill(ELEM) & STATE_MASK, READER);
        assert!(is_consumed(slot.inspect()));
    }

    #[test]
    fn resume_request_reaches_the_final_visitor() {
        let slot = Slot::UNINIT;

        // A parked sweep is only visible to the visitor that completes the
        // slot.
        assert!(!is_consumed(slot.mark_resume()));
        assert_eq!(slot.fill(ELEM) & STATE_MASK, RESUME);

        let state = slot.claim();
        assert_eq!(state & ELEM_MASK, ELEM);
        assert_ne!(state & RESUME, 0);
    }

    #[test]
    fn tentative_first_element_reads_back() {
        let slot = Slot::UNINIT;

        slot.init_first(ELEM);
        assert_eq!(slot.inspect(), ELEM);
        assert!(!is_consumed(slot.inspect()));

        let state = slot.claim();
        assert_eq!(state & ELEM_MASK, ELEM);
        assert!(is_consumed(slot.inspect()));
    }
}
