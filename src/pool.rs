// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Client pool: slot slab, free-list ring, worker threads, and the
//! readiness-event dispatch state machine.
//!
//! # Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                       ClientPool<H>                          |
//! |  +---------------------+   +------------------------------+ |
//! |  |  slots: [ClientSlot]|   |  free: AtomicRing<u32>       | |
//! |  |  (pre-allocated)    |   |  (preloaded with every index)| |
//! |  +---------------------+   +------------------------------+ |
//! |              |                          |                   |
//! |              v                          v                   |
//! |  +--------------------------------------------------------+ |
//! |  |   Poller (edge-triggered, one-shot per client slot)    | |
//! |  +--------------------------------------------------------+ |
//! |     ^               ^                 ^                     |
//! |  worker 0        worker 1   ...    worker N-1               |
//! |     |               |                 |                     |
//! |     +------ dispatch -> H::{on_input,on_oob,on_write_ready} |
//! +--------------------------------------------------------------+
//! ```
//!
//! # Claim / Recycle Protocol
//!
//! Claim (accept path): raise `size` under the capacity bound, dequeue a
//! free index, bind the descriptor into the slot, register with the poller.
//! The registration is the publication point: a worker receiving an event
//! for the index observes the fully initialized slot.
//!
//! Recycle (worker path): deregister from the poller FIRST, so no future
//! event can name the slot once its index re-enters the free list; then
//! close, clear, enqueue the index, and drop `size`.
//!
//! # Exclusivity
//!
//! A slot is re-armed only after the last handler call for its current
//! event, so at most one worker runs handlers for a given client at any
//! time. Handlers for different clients run concurrently.

use crate::endpoint;
use crate::error::{Error, Result};
use crate::metrics::PoolMetrics;
use crate::poller::{Event, Poller, Readiness};
use crate::ring::AtomicRing;
use crate::slot::{ClientSlot, MAX_READ_SIZE};
use parking_lot::Mutex;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Per-connection event callbacks.
///
/// All three default to no-ops; implementors override what they need.
/// Handlers run on pool worker threads and may run concurrently for
/// different clients, never concurrently for the same client.
///
/// Handlers must not retain `data` beyond the call, must not close the
/// descriptor directly (disconnects are observed and recycled by the pool),
/// and should avoid unbounded blocking work (a worker thread is occupied
/// for the duration of the call).
pub trait ClientHandler: Send + Sync + 'static {
    /// Bytes freshly read from `fd`. The buffer is borrowed for the call.
    fn on_input(&self, fd: RawFd, data: &mut [u8]) {
        let _ = (fd, data);
    }

    /// A single out-of-band byte arrived on `fd`.
    fn on_oob(&self, fd: RawFd, byte: u8) {
        let _ = (fd, byte);
    }

    /// `fd` has room in its output buffer.
    fn on_write_ready(&self, fd: RawFd) {
        let _ = fd;
    }
}

/// Canonical action for one readiness mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Action {
    /// Tear the connection down
    Recycle,
    /// Drain ordinary input until WouldBlock
    DrainInput,
    /// Drain urgent then ordinary input until WouldBlock
    DrainUrgent,
    /// Input drain, then notify writable
    DrainInputThenWrite,
    /// Urgent drain, then notify writable
    DrainUrgentThenWrite,
    /// Notify writable only
    NotifyWritable,
    /// Nothing recognized
    Ignore,
}

/// Reduce a composite readiness mask to one action.
///
/// Tie-breaks: an error bit always recycles; hangup without pending data
/// recycles (hangup WITH data does not short-circuit: the drain itself
/// sees the 0-byte read); urgent beats readable (the urgent path also
/// drains ordinary data); writable runs last so handlers can reply within
/// the same event, and is ignored when the peer already hung up.
fn classify(r: Readiness) -> Action {
    if r.is_error() {
        return Action::Recycle;
    }

    let hangup = r.is_hangup() || r.is_peer_closed();
    if hangup && !r.is_readable() && !r.is_urgent() {
        return Action::Recycle;
    }

    if r.is_urgent() {
        if r.is_writable() && !hangup {
            return Action::DrainUrgentThenWrite;
        }
        return Action::DrainUrgent;
    }

    if r.is_readable() {
        if r.is_writable() && !hangup {
            return Action::DrainInputThenWrite;
        }
        return Action::DrainInput;
    }

    if r.is_writable() {
        return Action::NotifyWritable;
    }

    Action::Ignore
}

/// Outcome of a drain pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Drain {
    /// Descriptor drained to WouldBlock and is still connected
    Open,
    /// Connection ended or failed; the slot was recycled
    Closed,
}

/// State shared between the pool handle and its workers.
struct PoolCore<H> {
    /// Pre-allocated connection slots; index is identity
    slots: Box<[ClientSlot]>,
    /// Free slot indices
    free: AtomicRing<u32>,
    /// Live connection count
    size: AtomicUsize,
    /// Slab capacity
    capacity: usize,
    poller: Poller,
    handler: H,
    metrics: PoolMetrics,
}

impl<H: ClientHandler> PoolCore<H> {
    /// Process one delivered event.
    fn handle_event(&self, event: Event) {
        let idx = event.token as usize;
        let Some(slot) = self.slots.get(idx) else {
            log::warn!("[POOL] event for unknown slot {idx}");
            return;
        };

        let fd = slot.fd();
        if fd == 0 {
            return;
        }

        // Re-arming is the LAST step of every surviving path, and write
        // interest is only re-established when this event did not already
        // consume a writable notification (a MOD re-poll would otherwise
        // redeliver writable immediately, since the send buffer usually has
        // room).
        match classify(event.readiness) {
            Action::Recycle => self.recycle(idx),
            Action::DrainInput => {
                if self.drain_input(idx, fd) == Drain::Open {
                    self.rearm(idx, fd, true);
                }
            }
            Action::DrainUrgent => {
                if self.drain_urgent(idx, fd) == Drain::Open {
                    self.rearm(idx, fd, true);
                }
            }
            Action::DrainInputThenWrite => {
                if self.drain_input(idx, fd) == Drain::Open {
                    self.notify_writable(fd);
                    self.rearm(idx, fd, false);
                }
            }
            Action::DrainUrgentThenWrite => {
                if self.drain_urgent(idx, fd) == Drain::Open {
                    self.notify_writable(fd);
                    self.rearm(idx, fd, false);
                }
            }
            Action::NotifyWritable => {
                self.notify_writable(fd);
                self.rearm(idx, fd, false);
            }
            Action::Ignore => {}
        }
    }

    fn notify_writable(&self, fd: RawFd) {
        self.metrics.record_write_ready();
        self.handler.on_write_ready(fd);
    }

    /// Read until WouldBlock, feeding each chunk to the handler.
    fn drain_input(&self, idx: usize, fd: RawFd) -> Drain {
        loop {
            // SAFETY: this worker holds the slot's single in-flight event;
            // nothing else touches the buffer until rearm.
            let buf = unsafe { self.slots[idx].read_buf() };

            match endpoint::read(fd, &mut buf[..MAX_READ_SIZE]) {
                Ok(0) => {
                    // Orderly close
                    self.recycle(idx);
                    return Drain::Closed;
                }
                Ok(n) => {
                    self.metrics.record_input(n);
                    self.handler.on_input(fd, &mut buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Drain::Open,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::debug!("[POOL] read error on fd {fd}: {e}");
                    self.metrics.record_io_error();
                    self.recycle(idx);
                    return Drain::Closed;
                }
            }
        }
    }

    /// Urgent-path drain: pull the out-of-band byte at the mark, then keep
    /// draining ordinary data until WouldBlock.
    fn drain_urgent(&self, idx: usize, fd: RawFd) -> Drain {
        loop {
            match endpoint::at_mark(fd) {
                Ok(true) => match endpoint::read_oob(fd) {
                    Ok(byte) => {
                        self.metrics.record_oob();
                        self.handler.on_oob(fd, byte);
                    }
                    Err(e) => {
                        log::debug!("[POOL] OOB read error on fd {fd}: {e}");
                        self.metrics.record_io_error();
                        self.recycle(idx);
                        return Drain::Closed;
                    }
                },
                Ok(false) => {}
                Err(e) => {
                    log::debug!("[POOL] SIOCATMARK error on fd {fd}: {e}");
                    self.metrics.record_io_error();
                    self.recycle(idx);
                    return Drain::Closed;
                }
            }

            // One ordinary read per mark probe; the outer loop re-probes
            // until the descriptor is dry.
            // SAFETY: same single in-flight event exclusivity as drain_input.
            let buf = unsafe { self.slots[idx].read_buf() };
            match endpoint::read(fd, &mut buf[..MAX_READ_SIZE]) {
                Ok(0) => {
                    self.recycle(idx);
                    return Drain::Closed;
                }
                Ok(n) => {
                    self.metrics.record_input(n);
                    self.handler.on_input(fd, &mut buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Drain::Open,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::debug!("[POOL] read error on fd {fd}: {e}");
                    self.metrics.record_io_error();
                    self.recycle(idx);
                    return Drain::Closed;
                }
            }
        }
    }

    /// Re-enable the slot's one-shot registration. A failure here means the
    /// descriptor died between drain and rearm; recycle it.
    fn rearm(&self, idx: usize, fd: RawFd, want_writable: bool) {
        if let Err(e) = self.poller.rearm_client(fd, idx as u64, want_writable) {
            log::debug!("[POOL] rearm failed for fd {fd}: {e}");
            self.recycle(idx);
        }
    }

    /// Return a slot to the free list. Deregistration comes first so no
    /// future event can reference the slot once its index re-enters the
    /// ring; the clear() swap makes concurrent recycle attempts close the
    /// descriptor exactly once.
    fn recycle(&self, idx: usize) {
        let slot = &self.slots[idx];

        let fd = slot.fd();
        if fd == 0 {
            return;
        }
        let _ = self.poller.deregister(fd);

        let fd = slot.clear();
        if fd == 0 {
            return;
        }
        let _ = endpoint::close(fd);

        self.free.enqueue(idx as u32);
        self.size.fetch_sub(1, Ordering::AcqRel);
        self.metrics.record_recycled();
        log::debug!("[POOL] recycled slot {idx} (fd {fd})");
    }
}

/// Worker loop: wait for event batches and dispatch until shutdown.
fn worker_loop<H: ClientHandler>(core: &PoolCore<H>) {
    let mut events: Vec<Event> = Vec::new();
    loop {
        match core.poller.wait(&mut events) {
            Ok(()) => {
                for event in &events {
                    core.handle_event(*event);
                }
            }
            Err(_) => break,
        }
    }
}

/// Fixed-capacity pool of client connections multiplexed over worker
/// threads.
pub struct ClientPool<H: ClientHandler> {
    core: Arc<PoolCore<H>>,
    workers: usize,
    /// Guards run/stop transitions
    lifecycle: Mutex<Vec<JoinHandle<()>>>,
}

impl<H: ClientHandler> ClientPool<H> {
    /// Create a pool with `workers` threads and room for `capacity`
    /// concurrent clients.
    ///
    /// # Errors
    ///
    /// Returns a mapping or poller creation error ([`Error::MemFd`],
    /// [`Error::Mmap`], [`Error::PollerCreate`], [`Error::InvalidCapacity`]).
    pub fn new(workers: usize, capacity: usize, handler: H) -> Result<Self> {
        let slots: Box<[ClientSlot]> = (0..capacity).map(|_| ClientSlot::new()).collect();

        let mut free = AtomicRing::with_capacity(capacity)?;
        free.preload(0..capacity as u32);

        let poller = Poller::new()?;

        log::debug!("[POOL] created: {workers} workers, {capacity} slots");

        Ok(Self {
            core: Arc::new(PoolCore {
                slots,
                free,
                size: AtomicUsize::new(0),
                capacity,
                poller,
                handler,
                metrics: PoolMetrics::new(),
            }),
            workers,
            lifecycle: Mutex::new(Vec::new()),
        })
    }

    /// Admit a connection into the pool.
    ///
    /// Returns false when the pool is at capacity or the poller refused the
    /// descriptor; in both cases the caller keeps ownership of `fd` and
    /// should close it.
    pub fn add_client(&self, fd: RawFd) -> bool {
        let core = &self.core;

        // A stopped pool refuses new clients.
        if core.poller.is_closed() {
            return false;
        }

        // Bounded claim: size never exceeds capacity even under racing
        // accepts, which keeps the free ring from being over-drawn.
        let mut size = core.size.load(Ordering::Acquire);
        loop {
            if size >= core.capacity {
                core.metrics.record_rejected_at_capacity();
                log::debug!("[POOL] at capacity ({}), refusing fd {fd}", core.capacity);
                return false;
            }
            match core.size.compare_exchange_weak(
                size,
                size + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => size = current,
            }
        }

        let idx = core.free.dequeue() as usize;
        core.slots[idx].bind(fd);

        if let Err(e) = core.poller.register_client(fd, idx as u64) {
            log::warn!("[POOL] registration failed for fd {fd}: {e}");
            // Roll the claim back; the descriptor stays with the caller.
            core.slots[idx].clear();
            core.free.enqueue(idx as u32);
            core.size.fetch_sub(1, Ordering::AcqRel);
            return false;
        }

        core.metrics.record_accepted();
        true
    }

    /// Spawn the worker threads. Idempotent: a running pool is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Spawn`] if the OS refuses a thread.
    pub fn run(&self) -> Result<()> {
        let mut workers = self.lifecycle.lock();
        if !workers.is_empty() {
            return Ok(());
        }

        for i in 0..self.workers {
            let core = Arc::clone(&self.core);
            let handle = thread::Builder::new()
                .name(format!("sockpool-worker-{i}"))
                .spawn(move || worker_loop(&core))
                .map_err(Error::Spawn)?;
            workers.push(handle);
        }

        log::info!("[POOL] running with {} workers", self.workers);
        Ok(())
    }

    /// Stop the pool: close the poller, join every worker, close every
    /// still-open client descriptor. Idempotent; in-flight handler calls
    /// complete before the join returns. Must not be called from a handler.
    pub fn stop(&self) {
        let mut workers = self.lifecycle.lock();
        if workers.is_empty() {
            return;
        }

        self.core.poller.close();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }

        for slot in self.core.slots.iter() {
            let fd = slot.clear();
            if fd != 0 {
                let _ = endpoint::close(fd);
            }
        }

        log::info!("[POOL] stopped");
    }

    /// Current live connection count.
    #[must_use]
    pub fn size(&self) -> usize {
        self.core.size.load(Ordering::Acquire)
    }

    /// Maximum concurrent connections.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.core.capacity
    }

    /// Pool counters.
    #[must_use]
    pub fn metrics(&self) -> &PoolMetrics {
        &self.core.metrics
    }

    /// The installed handler.
    #[must_use]
    pub fn handler(&self) -> &H {
        &self.core.handler
    }
}

impl<H: ClientHandler> Drop for ClientPool<H> {
    fn drop(&mut self) {
        self.stop();

        // stop() only sweeps after a run; close anything bound outside one
        // (clients admitted to a never-run pool, or raced past stop).
        for slot in self.core.slots.iter() {
            let fd = slot.clear();
            if fd != 0 {
                let _ = endpoint::close(fd);
            }
        }
    }
}
