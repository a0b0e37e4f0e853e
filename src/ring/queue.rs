// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Lock-free circular buffer over a mirrored mapping.
//!
//! # Synchronization Protocol
//!
//! Producer enqueue:
//! 1. Reserve a logical slot: `t = tail.fetch_add(1)`
//! 2. Write the element at index `t` (valid for `t < 2 * capacity` because
//!    the two mapped halves alias)
//! 3. If `t + 1` reached the capacity boundary, run the rollover reduction
//!
//! Consumer dequeue mirrors the same steps on `head`.
//!
//! # Rollover Reduction
//!
//! A claimant whose incremented index reaches `capacity` spins until the
//! counter has settled at exactly its observed value (later claimants are
//! serialized behind it), then CAS-subtracts `capacity`. A failed CAS means
//! another claimant already reduced; the attempt is abandoned. The element
//! written at index `t` stays readable at `t - capacity` through the mirror,
//! so no data moves.
//!
//! # Concurrency Contract
//!
//! Multiple producers and consumers are tolerated; the structure is tuned
//! for the free-list pattern where one side dominates at any moment. It
//! guarantees at-most-one-owner of every dequeued element and no lost
//! enqueues up to `capacity` outstanding. It does NOT guarantee linearizable
//! FIFO order, and it does NOT detect empty or full states: the caller must
//! pace consumers with its own availability signal (a size counter, a poller
//! registration) so a dequeue never overtakes the enqueues feeding it. That
//! same signal is what publishes the element value to the consumer thread;
//! the fences here order the element access against this ring's counters.
//!
//! Counters are 64-bit and reduced only at the capacity boundary; the
//! counter range between two reductions is far beyond any reachable claim
//! count.

use super::map::{page_size, MirrorMap};
use crate::error::{Error, Result};
use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::ptr;
use std::sync::atomic::{fence, AtomicBool, AtomicI64, Ordering};

/// Greatest common divisor, for capacity rounding.
fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Bounded lock-free ring of `T` backed by a double-mapped region.
pub struct AtomicRing<T> {
    /// Mirrored storage; one copy holds `cap` elements
    map: ManuallyDrop<MirrorMap>,
    /// Capacity in elements
    cap: usize,
    /// Consumer reservation counter (logical, reduced at the boundary)
    head: AtomicI64,
    /// Producer reservation counter (logical, reduced at the boundary)
    tail: AtomicI64,
    /// Guards the single teardown of the mapping
    alive: AtomicBool,
    _elem: PhantomData<T>,
}

// SAFETY: elements are plain copies handed between threads; ownership of
// each slot is dispensed through the atomic counters, and the caller's
// availability signal orders the handoff (see module docs).
unsafe impl<T: Send> Send for AtomicRing<T> {}
unsafe impl<T: Send> Sync for AtomicRing<T> {}

impl<T: Copy> AtomicRing<T> {
    /// Create a ring with at least `cap_hint` slots.
    ///
    /// The capacity is rounded up to the smallest count whose byte size is a
    /// page multiple, so the mirrored mapping lines up on page boundaries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapacity`] for a zero hint or zero-sized
    /// element type, [`Error::MemFd`] / [`Error::Mmap`] if the kernel
    /// refuses the backing allocation.
    pub fn with_capacity(cap_hint: usize) -> Result<Self> {
        let elem = mem::size_of::<T>();
        if cap_hint == 0 || elem == 0 {
            return Err(Error::InvalidCapacity(cap_hint));
        }

        // Smallest element count step whose byte size is a page multiple.
        let page = page_size();
        let step = page / gcd(page, elem);
        let cap = cap_hint.div_ceil(step) * step;

        let map = MirrorMap::new(cap * elem)?;

        Ok(Self {
            map: ManuallyDrop::new(map),
            cap,
            head: AtomicI64::new(0),
            tail: AtomicI64::new(0),
            alive: AtomicBool::new(true),
            _elem: PhantomData,
        })
    }

    /// Total slot capacity
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Pointer to the element slot at logical index `idx` (`idx < 2 * cap`).
    #[inline]
    fn slot(&self, idx: usize) -> *mut T {
        debug_assert!(idx < self.cap * 2);
        // SAFETY: the map spans 2*cap elements; idx stays below that bound
        // because a counter is reduced before it can overshoot a full lap
        // (claimants past the boundary serialize in roll()).
        unsafe { self.map.as_ptr().cast::<T>().add(idx) }
    }

    /// Push an element to the back.
    pub fn enqueue(&self, value: T) {
        debug_assert!(self.alive.load(Ordering::Relaxed));

        let t = self.tail.fetch_add(1, Ordering::AcqRel);
        // SAFETY: slot t is exclusively ours until a consumer is told it is
        // available; the caller's availability signal publishes the write.
        unsafe { ptr::write(self.slot(t as usize), value) };
        fence(Ordering::Release);

        self.roll(&self.tail, t + 1);
    }

    /// Pop an element from the front.
    ///
    /// The caller must know the ring is non-empty (see the module contract);
    /// dequeuing ahead of the producers reads stale slots.
    pub fn dequeue(&self) -> T {
        debug_assert!(self.alive.load(Ordering::Relaxed));

        let h = self.head.fetch_add(1, Ordering::AcqRel);
        fence(Ordering::Acquire);
        // SAFETY: slot h was filled by the enqueue (or preload) whose
        // availability signal allowed this dequeue; the reservation makes us
        // its only reader.
        let value = unsafe { ptr::read(self.slot(h as usize)) };

        self.roll(&self.head, h + 1);
        value
    }

    /// Reduce a counter that crossed the capacity boundary.
    ///
    /// `claimed` is the counter value as observed right after this thread's
    /// own increment. Progress-bounded, not wait-free: the claimant waits
    /// for later claimants to stop arriving before reducing.
    fn roll(&self, counter: &AtomicI64, claimed: i64) {
        let cap = self.cap as i64;
        if claimed < cap {
            return;
        }

        while counter.load(Ordering::Acquire) > claimed {
            std::hint::spin_loop();
        }

        // Losing the race means another boundary claimant already reduced.
        let _ =
            counter.compare_exchange(claimed, claimed - cap, Ordering::AcqRel, Ordering::Relaxed);
    }

    /// Seed the ring with initial elements without moving the counters.
    ///
    /// Writes up to `capacity` elements into slots `[0, n)`. The dequeue side
    /// may then run `n` dequeues ahead of the enqueue side, which is exactly
    /// the free-list pattern: prime with every slot index, draw on claim,
    /// return on recycle.
    pub fn preload<I: IntoIterator<Item = T>>(&mut self, values: I) {
        let mut n = 0usize;
        for value in values {
            assert!(n < self.cap, "preload exceeds ring capacity");
            // SAFETY: &mut self gives exclusive access; n < cap is in bounds.
            unsafe { ptr::write(self.slot(n), value) };
            n += 1;
        }
        fence(Ordering::Release);
    }

    /// Tear down the mapping. Idempotent; later calls are no-ops.
    pub fn destroy(&mut self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            log::trace!("[RING] destroyed ring of {} slots", self.cap);
            // SAFETY: the alive flag guarded the single true->false
            // transition, so the map is dropped exactly once.
            unsafe { ManuallyDrop::drop(&mut self.map) };
        }
    }
}

impl<T> Drop for AtomicRing<T> {
    fn drop(&mut self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            // SAFETY: same single-teardown guard as destroy().
            unsafe { ManuallyDrop::drop(&mut self.map) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            AtomicRing::<u64>::with_capacity(0),
            Err(Error::InvalidCapacity(0))
        ));
    }

    #[test]
    fn test_capacity_rounds_to_page_multiple() {
        let ring = AtomicRing::<u64>::with_capacity(100).expect("Failed to create");
        let bytes = ring.capacity() * mem::size_of::<u64>();
        assert!(ring.capacity() >= 100);
        assert_eq!(bytes % page_size(), 0);
    }

    #[test]
    fn test_enqueue_dequeue_single_thread() {
        let ring = AtomicRing::<u64>::with_capacity(64).expect("Failed to create");
        for v in 0..10u64 {
            ring.enqueue(v);
        }
        for v in 0..10u64 {
            assert_eq!(ring.dequeue(), v);
        }
    }

    #[test]
    fn test_wraparound_many_laps() {
        let ring = AtomicRing::<u64>::with_capacity(1).expect("Failed to create");
        let cap = ring.capacity() as u64;

        // Three full laps of paired operations crosses the boundary three
        // times on each counter.
        for v in 0..cap * 3 {
            ring.enqueue(v);
            assert_eq!(ring.dequeue(), v);
        }
    }

    #[test]
    fn test_slot_aliasing_across_seam() {
        let ring = AtomicRing::<u64>::with_capacity(1).expect("Failed to create");
        let cap = ring.capacity();

        // SAFETY: test holds the only reference; indices < 2*cap.
        unsafe {
            ptr::write(ring.slot(3), 0xDEAD);
            assert_eq!(ptr::read(ring.slot(3 + cap)), 0xDEAD);

            ptr::write(ring.slot(cap), 0xBEEF);
            assert_eq!(ptr::read(ring.slot(0)), 0xBEEF);
        }
    }

    #[test]
    fn test_preload_then_drain() {
        let mut ring = AtomicRing::<u32>::with_capacity(1).expect("Failed to create");
        let cap = ring.capacity() as u32;

        ring.preload(0..cap);
        for v in 0..cap {
            assert_eq!(ring.dequeue(), v);
        }
    }

    #[test]
    fn test_free_list_cycle_after_preload() {
        let mut ring = AtomicRing::<u32>::with_capacity(1).expect("Failed to create");
        let cap = ring.capacity() as u32;
        ring.preload(0..cap);

        // Claim/recycle pairs far past the original capacity.
        for _ in 0..(cap * 2) {
            let v = ring.dequeue();
            ring.enqueue(v);
        }

        // Every index is still present exactly once.
        let mut seen: Vec<u32> = (0..cap).map(|_| ring.dequeue()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..cap).collect::<Vec<_>>());
    }

    #[test]
    #[should_panic(expected = "preload exceeds ring capacity")]
    fn test_preload_overflow_panics() {
        let mut ring = AtomicRing::<u64>::with_capacity(1).expect("Failed to create");
        let cap = ring.capacity() as u64;
        ring.preload(0..=cap);
    }

    #[test]
    fn test_destroy_idempotent() {
        let mut ring = AtomicRing::<u64>::with_capacity(16).expect("Failed to create");
        ring.destroy();
        ring.destroy();
    }

    /// 4 producers each enqueue 100k distinct values while 4 consumers each
    /// dequeue 100k, in barrier-paced rounds: producers of a round contend
    /// on `tail` (rollovers included), consumers contend on `head`, and the
    /// barrier between the sides is the availability signal the module
    /// contract requires (it publishes the round's writes to the readers).
    /// The multiset of consumed values must equal the multiset produced.
    #[test]
    fn test_mpmc_multiset_equality() {
        use std::sync::Barrier;

        const PRODUCERS: u64 = 4;
        const CONSUMERS: u64 = 4;
        const ROUNDS: u64 = 400;
        const PER_ROUND: u64 = 250; // per thread; 100k per thread total

        let ring = Arc::new(AtomicRing::<u64>::with_capacity(1024).expect("Failed to create"));
        assert!(ring.capacity() as u64 >= PRODUCERS * PER_ROUND);
        let barrier = Arc::new(Barrier::new((PRODUCERS + CONSUMERS) as usize));

        let mut producers = Vec::new();
        for p in 0..PRODUCERS {
            let ring = Arc::clone(&ring);
            let barrier = Arc::clone(&barrier);
            producers.push(thread::spawn(move || {
                for round in 0..ROUNDS {
                    barrier.wait();
                    for i in 0..PER_ROUND {
                        ring.enqueue((p * ROUNDS + round) * PER_ROUND + i);
                    }
                    barrier.wait();
                }
            }));
        }

        let mut consumers = Vec::new();
        for _ in 0..CONSUMERS {
            let ring = Arc::clone(&ring);
            let barrier = Arc::clone(&barrier);
            consumers.push(thread::spawn(move || {
                let mut taken = Vec::with_capacity((ROUNDS * PER_ROUND) as usize);
                for _ in 0..ROUNDS {
                    barrier.wait(); // producers start the round
                    barrier.wait(); // producers finished the round
                    for _ in 0..PER_ROUND {
                        taken.push(ring.dequeue());
                    }
                }
                taken
            }));
        }

        for handle in producers {
            handle.join().expect("Producer panicked");
        }

        let mut consumed = Vec::new();
        for handle in consumers {
            consumed.extend(handle.join().expect("Consumer panicked"));
        }

        consumed.sort_unstable();
        let expected: Vec<u64> = (0..PRODUCERS * ROUNDS * PER_ROUND).collect();
        assert_eq!(consumed, expected);
    }
}
