// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pool configuration.
//!
//! # Example
//!
//! ```
//! use sockpool::PoolConfig;
//!
//! let config = PoolConfig::default()
//!     .with_workers(8)
//!     .with_max_clients(10_000);
//! assert_eq!(config.workers, 8);
//! ```

/// Configuration for a client pool and its listeners.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    // === Workers ===
    /// Number of worker threads draining readiness events
    pub workers: usize,

    // === Capacity ===
    /// Maximum concurrent client connections (slot slab size)
    pub max_clients: usize,

    // === Listener ===
    /// Backlog length passed to listen() by `ListenerPool::bind`
    pub listen_backlog: i32,

    /// Enable TCP_NODELAY on accepted sockets
    pub nodelay: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_clients: 1024,
            listen_backlog: 128,
            nodelay: true, // Low latency
        }
    }
}

impl PoolConfig {
    /// Builder: set worker thread count
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Builder: set client capacity
    #[must_use]
    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    /// Builder: set listen backlog
    #[must_use]
    pub fn with_listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    /// Builder: toggle TCP_NODELAY on accepted sockets
    #[must_use]
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = PoolConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.max_clients, 1024);
        assert_eq!(config.listen_backlog, 128);
        assert!(config.nodelay);
    }

    #[test]
    fn test_builders() {
        let config = PoolConfig::default()
            .with_workers(2)
            .with_max_clients(16)
            .with_listen_backlog(64)
            .with_nodelay(false);
        assert_eq!(config.workers, 2);
        assert_eq!(config.max_clients, 16);
        assert_eq!(config.listen_backlog, 64);
        assert!(!config.nodelay);
    }
}
