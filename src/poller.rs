// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Readiness poller shared by a pool of worker threads.
//!
//! Wraps one epoll instance plus an eventfd wake channel:
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                          Poller                              |
//! |  +--------------------------------------------------------+  |
//! |  |                     epoll (shared)                     |  |
//! |  |  - client fds: IN|PRI|OUT|RDHUP, edge + one-shot       |  |
//! |  |  - listener fds: IN, edge                              |  |
//! |  |  - eventfd: IN, level (never drained -> close wakes    |  |
//! |  |    every present and future waiter)                    |  |
//! |  +--------------------------------------------------------+  |
//! |        ^               ^                 ^                   |
//! |     worker 0        worker 1   ...    worker N-1             |
//! +--------------------------------------------------------------+
//! ```
//!
//! Every registration carries an opaque 64-bit token (a slot index for
//! clients, the descriptor itself for listeners). One-shot registration
//! hands each readiness edge to exactly one waiter and keeps the descriptor
//! muted until [`Poller::rearm_client`] re-enables it, which is what makes
//! per-slot handler calls mutually exclusive across workers.

use crate::error::{Error, Result};
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

/// Maximum events drained per wait call
const MAX_EVENTS: usize = 128;

/// Token reserved for the wake eventfd
const WAKE_TOKEN: u64 = u64::MAX;

/// Interest mask for pooled client descriptors
const CLIENT_EVENTS: u32 = (libc::EPOLLIN
    | libc::EPOLLPRI
    | libc::EPOLLOUT
    | libc::EPOLLRDHUP
    | libc::EPOLLET
    | libc::EPOLLONESHOT) as u32;

/// Client mask without write interest, for re-arms that just consumed a
/// writable notification
const CLIENT_EVENTS_NO_WRITE: u32 = CLIENT_EVENTS & !(libc::EPOLLOUT as u32);

/// Interest mask for listener descriptors
const LISTENER_EVENTS: u32 = (libc::EPOLLIN | libc::EPOLLET) as u32;

/// Composite readiness mask delivered with each event.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Readiness(u32);

impl Readiness {
    /// Ordinary input is pending
    pub const READABLE: Readiness = Readiness(libc::EPOLLIN as u32);
    /// Output buffer has room
    pub const WRITABLE: Readiness = Readiness(libc::EPOLLOUT as u32);
    /// Urgent (out-of-band) data is pending
    pub const URGENT: Readiness = Readiness(libc::EPOLLPRI as u32);
    /// Peer shut down its write side
    pub const PEER_CLOSED: Readiness = Readiness(libc::EPOLLRDHUP as u32);
    /// Connection hangup
    pub const HANGUP: Readiness = Readiness(libc::EPOLLHUP as u32);
    /// Descriptor error condition
    pub const ERROR: Readiness = Readiness(libc::EPOLLERR as u32);

    /// Wrap a raw epoll event mask
    #[inline]
    #[must_use]
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    #[must_use]
    pub fn contains(self, other: Readiness) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    #[must_use]
    pub fn is_readable(self) -> bool {
        self.contains(Self::READABLE)
    }

    #[inline]
    #[must_use]
    pub fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    #[inline]
    #[must_use]
    pub fn is_urgent(self) -> bool {
        self.contains(Self::URGENT)
    }

    #[inline]
    #[must_use]
    pub fn is_peer_closed(self) -> bool {
        self.contains(Self::PEER_CLOSED)
    }

    #[inline]
    #[must_use]
    pub fn is_hangup(self) -> bool {
        self.contains(Self::HANGUP)
    }

    #[inline]
    #[must_use]
    pub fn is_error(self) -> bool {
        self.contains(Self::ERROR)
    }
}

impl std::ops::BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 | rhs.0)
    }
}

impl std::fmt::Debug for Readiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut set = f.debug_set();
        for (bit, name) in [
            (Self::READABLE, "READABLE"),
            (Self::WRITABLE, "WRITABLE"),
            (Self::URGENT, "URGENT"),
            (Self::PEER_CLOSED, "PEER_CLOSED"),
            (Self::HANGUP, "HANGUP"),
            (Self::ERROR, "ERROR"),
        ] {
            if self.contains(bit) {
                set.entry(&name);
            }
        }
        set.finish()
    }
}

/// One delivered readiness event.
#[derive(Clone, Copy, Debug)]
pub struct Event {
    /// Composite readiness mask
    pub readiness: Readiness,
    /// The token stored at registration time
    pub token: u64,
}

/// Shared epoll instance with a close channel.
pub struct Poller {
    epfd: RawFd,
    wakefd: RawFd,
    closed: AtomicBool,
}

impl Poller {
    /// Create the poller and its wake channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PollerCreate`] if epoll or eventfd creation fails.
    pub fn new() -> Result<Self> {
        // SAFETY: epoll_create1 with CLOEXEC has no preconditions.
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::PollerCreate(io::Error::last_os_error()));
        }

        // SAFETY: eventfd with a zero counter and valid flags.
        let wakefd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if wakefd < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: epfd is valid; error path.
            unsafe { libc::close(epfd) };
            return Err(Error::PollerCreate(err));
        }

        let poller = Self {
            epfd,
            wakefd,
            closed: AtomicBool::new(false),
        };

        // Level-triggered, never drained: once written, every wait call in
        // every worker observes it.
        poller
            .ctl(libc::EPOLL_CTL_ADD, wakefd, libc::EPOLLIN as u32, WAKE_TOKEN)
            .map_err(|e| {
                // SAFETY: both fds are valid; error path.
                unsafe {
                    libc::close(epfd);
                    libc::close(wakefd);
                }
                e
            })?;

        Ok(poller)
    }

    /// epoll_ctl wrapper.
    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> Result<()> {
        let mut ev = libc::epoll_event { events, u64: token };
        // SAFETY: epfd is a valid epoll instance, fd a valid descriptor, and
        // ev lives across the call.
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(Error::Register(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Register a client descriptor: edge-triggered, one-shot, all of
    /// input/urgent/output/peer-close.
    ///
    /// The kernel publishes the registration with release semantics, so a
    /// worker that receives an event for `token` sees every write the
    /// registering thread made to the slot beforehand.
    pub fn register_client(&self, fd: RawFd, token: u64) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, CLIENT_EVENTS, token)
    }

    /// Re-enable a one-shot client registration after its event was handled.
    ///
    /// `want_writable` controls whether write interest is re-established.
    /// An EPOLL_CTL_MOD re-polls the descriptor, so re-arming with write
    /// interest while the send buffer has room (the common case) would
    /// redeliver a writable-only event immediately; the dispatcher therefore
    /// drops write interest on the re-arm that follows a consumed writable
    /// notification and restores it on the next drain.
    pub fn rearm_client(&self, fd: RawFd, token: u64, want_writable: bool) -> Result<()> {
        let events = if want_writable {
            CLIENT_EVENTS
        } else {
            CLIENT_EVENTS_NO_WRITE
        };
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, token)
    }

    /// Register a listener descriptor: edge-triggered input only.
    pub fn register_listener(&self, fd: RawFd, token: u64) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, LISTENER_EVENTS, token)
    }

    /// Remove a descriptor from the poller.
    pub fn deregister(&self, fd: RawFd) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)
    }

    /// Block until readiness events arrive, filling `events`.
    ///
    /// Safe to call from any number of threads; one-shot registrations give
    /// each edge to exactly one of them. Retries `EINTR`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] once [`Poller::close`] has run; events
    /// already delivered in the same batch are surfaced first.
    pub fn wait(&self, events: &mut Vec<Event>) -> Result<()> {
        events.clear();

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Shutdown);
            }

            // SAFETY: zeroed epoll_event array is a valid output buffer.
            let mut buf: [libc::epoll_event; MAX_EVENTS] = unsafe { mem::zeroed() };
            // SAFETY: epfd is valid; buf holds MAX_EVENTS entries.
            let n = unsafe { libc::epoll_wait(self.epfd, buf.as_mut_ptr(), MAX_EVENTS as i32, -1) };

            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("[POLL] wait failed: {err}");
                return Err(Error::Shutdown);
            }

            for ev in buf.iter().take(n as usize) {
                let token = ev.u64;
                if token == WAKE_TOKEN {
                    continue;
                }
                events.push(Event {
                    readiness: Readiness::from_bits(ev.events),
                    token,
                });
            }

            if !events.is_empty() {
                return Ok(());
            }

            // Only the wake channel fired; loop back to the closed check.
        }
    }

    /// Close the poller: all current and future waiters return `Shutdown`.
    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        log::debug!("[POLL] closing, waking all waiters");
        let one: u64 = 1;
        // SAFETY: wakefd is a valid eventfd and the buffer is 8 bytes.
        unsafe {
            libc::write(self.wakefd, std::ptr::addr_of!(one).cast(), 8);
        }
    }

    /// True once [`Poller::close`] has run.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        // SAFETY: both descriptors are valid and owned; Drop runs once.
        unsafe {
            libc::close(self.epfd);
            libc::close(self.wakefd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Non-blocking unix socketpair for poking the poller.
    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: fds is a valid two-element output array.
        let ret = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(ret, 0, "socketpair failed");
        (fds[0], fds[1])
    }

    #[test]
    fn test_close_idempotent() {
        let poller = Poller::new().expect("Failed to create");
        assert!(!poller.is_closed());
        poller.close();
        poller.close();
        assert!(poller.is_closed());
    }

    #[test]
    fn test_wait_after_close_returns_shutdown() {
        let poller = Poller::new().expect("Failed to create");
        poller.close();

        let mut events = Vec::new();
        assert!(matches!(poller.wait(&mut events), Err(Error::Shutdown)));
    }

    #[test]
    fn test_event_delivery_with_token() {
        let poller = Poller::new().expect("Failed to create");
        let (a, b) = socketpair();

        poller.register_client(b, 42).expect("Failed to register");
        endpoint::write(a, b"x").expect("Failed to write");

        let mut events = Vec::new();
        poller.wait(&mut events).expect("Failed to wait");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token, 42);
        assert!(events[0].readiness.is_readable());

        endpoint::close(a).ok();
        endpoint::close(b).ok();
    }

    #[test]
    fn test_rearm_redelivers() {
        let poller = Poller::new().expect("Failed to create");
        let (a, b) = socketpair();
        poller.register_client(b, 7).expect("Failed to register");

        let mut events = Vec::new();
        let mut buf = [0u8; 8];

        endpoint::write(a, b"1").expect("Failed to write");
        poller.wait(&mut events).expect("Failed to wait");
        while endpoint::read(b, &mut buf).is_ok_and(|n| n > 0) {}

        poller.rearm_client(b, 7, false).expect("Failed to rearm");
        endpoint::write(a, b"2").expect("Failed to write");
        poller.wait(&mut events).expect("Failed to wait");
        assert_eq!(events[0].token, 7);

        endpoint::close(a).ok();
        endpoint::close(b).ok();
    }

    #[test]
    fn test_close_unblocks_waiters() {
        let poller = Arc::new(Poller::new().expect("Failed to create"));

        let mut waiters = Vec::new();
        for _ in 0..4 {
            let poller = Arc::clone(&poller);
            waiters.push(thread::spawn(move || {
                let mut events = Vec::new();
                poller.wait(&mut events)
            }));
        }

        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        poller.close();

        for handle in waiters {
            let result = handle.join().expect("Waiter panicked");
            assert!(matches!(result, Err(Error::Shutdown)));
        }
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
