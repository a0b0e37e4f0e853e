// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-connection slot state.
//!
//! A slot is one cell of the pool's pre-allocated slab: the client's socket
//! descriptor plus a fixed read buffer. Slot identity is its slab index;
//! that index is what travels through the free-list ring and what the
//! poller hands back as the event token.
//!
//! # Ownership Protocol
//!
//! A slot is in exactly one of two places at any time:
//! - in the free-list ring (descriptor field is 0), or
//! - registered with the poller under its index (descriptor field is live).
//!
//! The descriptor field is atomic because claim (accept path) and recycle
//! (worker path) run on different threads. The read buffer needs no lock:
//! one-shot poller registration guarantees at most one in-flight event per
//! slot, so only the single worker handling that event touches the buffer.

use std::cell::UnsafeCell;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

/// Largest single read into a slot buffer, in bytes
pub const MAX_READ_SIZE: usize = 4096;

/// Pre-allocated per-connection state.
pub struct ClientSlot {
    /// Socket descriptor; 0 means the slot is free
    sfd: AtomicI32,
    /// Read buffer with one spare sentinel byte
    buf: UnsafeCell<[u8; MAX_READ_SIZE + 1]>,
}

// SAFETY: the descriptor field is atomic; the buffer is only ever accessed
// by the worker thread handling the slot's single in-flight event (see the
// ownership protocol above).
unsafe impl Send for ClientSlot {}
unsafe impl Sync for ClientSlot {}

impl ClientSlot {
    /// Create a free slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sfd: AtomicI32::new(0),
            buf: UnsafeCell::new([0u8; MAX_READ_SIZE + 1]),
        }
    }

    /// Current descriptor (0 when free).
    #[inline]
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.sfd.load(Ordering::Acquire)
    }

    /// True if no connection occupies the slot.
    #[inline]
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.fd() == 0
    }

    /// Bind a freshly accepted descriptor to the slot (claim path).
    #[inline]
    pub fn bind(&self, fd: RawFd) {
        debug_assert!(fd > 0);
        self.sfd.store(fd, Ordering::Release);
    }

    /// Clear the slot and return the descriptor it held (recycle path).
    ///
    /// Returns 0 if the slot was already free, which makes concurrent
    /// teardown paths (worker recycle vs. pool stop) close each fd once.
    #[inline]
    pub fn clear(&self) -> RawFd {
        self.sfd.swap(0, Ordering::AcqRel)
    }

    /// Mutable view of the read buffer.
    ///
    /// # Safety
    ///
    /// The caller must be the worker handling this slot's in-flight event;
    /// the one-shot registration protocol guarantees no other thread holds
    /// or can obtain a reference to the buffer until the slot is re-armed.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn read_buf(&self) -> &mut [u8; MAX_READ_SIZE + 1] {
        &mut *self.buf.get()
    }
}

impl Default for ClientSlot {
    fn default() -> Self {
        Self::new()
    }
}
