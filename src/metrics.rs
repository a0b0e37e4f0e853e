// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pool metrics.
//!
//! Atomic counters tracking pool health: accepted and rejected connections,
//! slot recycling, handler invocations, and I/O failures. Counters use
//! relaxed ordering; they are monitoring data, not synchronization.
//!
//! # Example
//!
//! ```
//! use sockpool::PoolMetrics;
//!
//! let metrics = PoolMetrics::new();
//! metrics.record_accepted();
//! assert_eq!(metrics.snapshot().accepted, 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one client pool.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Connections admitted into a slot
    accepted: AtomicU64,

    /// Connections refused because every slot was taken
    rejected_at_capacity: AtomicU64,

    /// Slots returned to the free list
    recycled: AtomicU64,

    /// on_input handler invocations
    input_events: AtomicU64,

    /// on_oob handler invocations
    oob_events: AtomicU64,

    /// on_write_ready handler invocations
    write_ready_events: AtomicU64,

    /// Per-client read/ioctl failures that forced a recycle
    io_errors: AtomicU64,

    /// Total payload bytes read from clients
    bytes_read: AtomicU64,
}

/// Point-in-time copy of [`PoolMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolMetricsSnapshot {
    pub accepted: u64,
    pub rejected_at_capacity: u64,
    pub recycled: u64,
    pub input_events: u64,
    pub oob_events: u64,
    pub write_ready_events: u64,
    pub io_errors: u64,
    pub bytes_read: u64,
}

impl PoolMetrics {
    /// Create a zeroed metrics instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_at_capacity(&self) {
        self.rejected_at_capacity.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recycled(&self) {
        self.recycled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_input(&self, bytes: usize) {
        self.input_events.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_oob(&self) {
        self.oob_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_ready(&self) {
        self.write_ready_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_io_error(&self) {
        self.io_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy all counters.
    #[must_use]
    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected_at_capacity: self.rejected_at_capacity.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            input_events: self.input_events.load(Ordering::Relaxed),
            oob_events: self.oob_events.load(Ordering::Relaxed),
            write_ready_events: self.write_ready_events.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = PoolMetrics::new();
        metrics.record_accepted();
        metrics.record_accepted();
        metrics.record_input(100);
        metrics.record_input(24);
        metrics.record_recycled();

        let snap = metrics.snapshot();
        assert_eq!(snap.accepted, 2);
        assert_eq!(snap.input_events, 2);
        assert_eq!(snap.bytes_read, 124);
        assert_eq!(snap.recycled, 1);
        assert_eq!(snap.rejected_at_capacity, 0);
    }

    #[test]
    fn test_snapshot_is_stable_copy() {
        let metrics = PoolMetrics::new();
        metrics.record_oob();
        let before = metrics.snapshot();
        metrics.record_oob();
        assert_eq!(before.oob_events, 1);
        assert_eq!(metrics.snapshot().oob_events, 2);
    }
}
