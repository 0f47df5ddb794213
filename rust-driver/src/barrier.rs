//! Barriers ordering host accesses to memory the device reads or writes.
//!
//! Ring memory is accessed with volatile operations; these fences order those
//! accesses with respect to each other and to doorbell writes.

use std::sync::atomic::{fence, Ordering};

/// Orders all prior stores before any later store, including MMIO doorbells.
#[inline]
pub(crate) fn wmb() {
    fence(Ordering::Release);
}

/// Orders a load of an ownership bit before the loads of the entry it guards.
#[inline]
pub(crate) fn rmb() {
    fence(Ordering::Acquire);
}
