//! Switches [`std::sync`] for [`loom`]'s instrumented equivalent when
//! building with the `--cfg loom` flag, so the model-checked tests exercise
//! the exact code that ships.
//!
//! Everything the queue synchronizes through is routed via this module:
//!
//! - `AtomicUsize` backs the head and tail words and every slot;
//! - `AtomicPtr` backs the successor links and the cached tail pointer;
//! - `AtomicU32` and `AtomicU8` back the per-node side counters and
//!   reclamation flags;
//! - `Arc` shares the queue root between handles.
//!
//! Under loom the atomics are not const-constructible and the node size is
//! shrunk, which is why node and slot construction carry their own
//! `cfg(loom)` splits; nothing else in the crate is aware of the switch.
//!
//! [`loom`]: https://docs.rs/loom/

#[cfg(not(loom))]
pub(crate) mod sync {
    pub(crate) use std::sync::Arc;

    pub(crate) mod atomic {
        pub(crate) use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU8, AtomicUsize, Ordering};
    }
}

#[cfg(loom)]
pub(crate) use loom::sync;
