// SPDX-License-Identifier: Apache-2.0 OR MIT

//! # sockpool - readiness-based TCP connection pool
//!
//! A multi-threaded TCP server substrate: many concurrent connections
//! multiplexed over a fixed pool of worker threads, with all per-connection
//! state pre-allocated in a slot slab and recycled through a lock-free
//! free-list ring backed by a mirrored memory mapping. A higher layer plugs
//! in per-event callbacks; sockpool owns accept, readiness dispatch, and
//! connection teardown.
//!
//! Linux-only: built on epoll (edge-triggered, one-shot), memfd double
//! mapping, and the TCP urgent-data ioctls.
//!
//! ## Quick Start
//!
//! ```no_run
//! use sockpool::{ClientHandler, ListenerPool, PoolConfig, endpoint};
//! use std::os::fd::RawFd;
//!
//! struct Echo;
//!
//! impl ClientHandler for Echo {
//!     fn on_input(&self, fd: RawFd, data: &mut [u8]) {
//!         let _ = endpoint::write(fd, data);
//!     }
//! }
//!
//! fn main() -> sockpool::Result<()> {
//!     let config = PoolConfig::default().with_workers(4).with_max_clients(10_000);
//!     let server = ListenerPool::new(&config, Echo)?;
//!     server.bind(7000, 128)?;
//!     server.run() // blocks until server.stop()
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                        ListenerPool<H>                              |
//! |   listener fds -> poller -> accept loop (caller's thread)           |
//! +---------------------------------------------------------------------+
//! |                         ClientPool<H>                               |
//! |   slot slab | free-list ring | poller | N worker threads            |
//! |   readiness mask -> dispatch -> on_input / on_oob / on_write_ready  |
//! +---------------------------------------------------------------------+
//! |                     ring / endpoint / poller                        |
//! |   mirrored mmap ring | socket syscalls | epoll + eventfd wake       |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ListenerPool`] | Accept loop feeding the client pool |
//! | [`ClientPool`] | Slot slab, workers, and event dispatch |
//! | [`ClientHandler`] | The callback capability a user supplies |
//! | [`AtomicRing`] | Lock-free ring over a mirrored mapping |
//! | [`Poller`] | Shared epoll instance with a close channel |

/// Pool sizing and listener options.
pub mod config;
/// Socket primitives (listen, accept, read/write, OOB, SIOCATMARK).
pub mod endpoint;
/// Error taxonomy.
pub mod error;
/// Listener pool and accept loop.
pub mod listener;
/// Pool counters and snapshots.
pub mod metrics;
/// Shared readiness poller (epoll).
pub mod poller;
/// Client pool, handler trait, and dispatch state machine.
pub mod pool;
/// Mirrored-memory lock-free ring.
pub mod ring;
/// Per-connection slot state.
pub mod slot;

pub use config::PoolConfig;
pub use error::{Error, Result};
pub use listener::ListenerPool;
pub use metrics::{PoolMetrics, PoolMetricsSnapshot};
pub use poller::{Event, Poller, Readiness};
pub use pool::{ClientHandler, ClientPool};
pub use ring::{AtomicRing, MirrorMap};
pub use slot::{ClientSlot, MAX_READ_SIZE};
