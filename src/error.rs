// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error taxonomy for pool, ring, and poller operations.
//!
//! Construction-time failures (mapping, poller creation, bind) carry the
//! underlying OS error and surface to the caller. Runtime per-connection
//! failures are recovered internally by slot recycling and never appear
//! here. Capacity exhaustion is reported as a plain `false` from
//! `ClientPool::add_client`, not as an error.

use std::fmt;
use std::io;

/// Errors surfaced by sockpool constructors and lifecycle operations.
#[derive(Debug)]
pub enum Error {
    /// Anonymous in-memory file creation or sizing failed
    MemFd(io::Error),

    /// Virtual memory mapping (reserve or overlay) failed
    Mmap(io::Error),

    /// epoll or eventfd creation failed
    PollerCreate(io::Error),

    /// Registering or re-arming a descriptor with the poller failed
    Register(io::Error),

    /// Listener socket creation, bind, or listen failed
    Bind(io::Error),

    /// Worker thread spawn failed
    Spawn(io::Error),

    /// Requested ring capacity cannot be satisfied (zero, or zero-sized element)
    InvalidCapacity(usize),

    /// The poller has been closed; workers are shutting down
    Shutdown,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemFd(e) => write!(f, "anonymous memory file creation failed: {e}"),
            Self::Mmap(e) => write!(f, "memory mapping failed: {e}"),
            Self::PollerCreate(e) => write!(f, "readiness poller creation failed: {e}"),
            Self::Register(e) => write!(f, "descriptor registration failed: {e}"),
            Self::Bind(e) => write!(f, "listener bind failed: {e}"),
            Self::Spawn(e) => write!(f, "worker thread spawn failed: {e}"),
            Self::InvalidCapacity(cap) => write!(f, "invalid ring capacity: {cap}"),
            Self::Shutdown => write!(f, "poller closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::MemFd(e)
            | Self::Mmap(e)
            | Self::PollerCreate(e)
            | Self::Register(e)
            | Self::Bind(e)
            | Self::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for sockpool operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_os_error() {
        let err = Error::Mmap(io::Error::from_raw_os_error(libc::ENOMEM));
        let text = err.to_string();
        assert!(text.starts_with("memory mapping failed"));
    }

    #[test]
    fn test_source_for_io_backed_variants() {
        use std::error::Error as _;
        let err = Error::Bind(io::Error::from_raw_os_error(libc::EADDRINUSE));
        assert!(err.source().is_some());
        assert!(Error::Shutdown.source().is_none());
    }
}
