// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Listener pool: accepts TCP connections and feeds the client pool.
//!
//! Owns one or more listening sockets and a dedicated poller for them.
//! [`ListenerPool::run`] drives the accept loop on the calling thread while
//! the inner [`ClientPool`] workers handle per-connection traffic. An
//! accepted socket is made non-blocking, optionally set to TCP_NODELAY, and
//! offered to the client pool; any failure closes it immediately so a full
//! pool sheds load instead of queueing it.
//!
//! Listener descriptors created by [`ListenerPool::bind`] are owned by the
//! pool and closed on [`ListenerPool::stop`]; descriptors registered via
//! [`ListenerPool::add`] stay with the caller.

use crate::config::PoolConfig;
use crate::endpoint;
use crate::error::{Error, Result};
use crate::pool::{ClientHandler, ClientPool};
use crate::poller::{Event, Poller};
use parking_lot::Mutex;
use std::io;
use std::os::fd::RawFd;

/// Accept loop over one or more listening sockets, feeding an inner
/// [`ClientPool`].
pub struct ListenerPool<H: ClientHandler> {
    clients: ClientPool<H>,
    poller: Poller,
    nodelay: bool,
    /// Descriptors created by bind(), closed on stop
    owned: Mutex<Vec<RawFd>>,
}

impl<H: ClientHandler> ListenerPool<H> {
    /// Build the listener pool and its inner client pool.
    ///
    /// # Errors
    ///
    /// Propagates client pool construction errors and poller creation
    /// failure.
    pub fn new(config: &PoolConfig, handler: H) -> Result<Self> {
        let clients = ClientPool::new(config.workers, config.max_clients, handler)?;
        let poller = Poller::new()?;

        Ok(Self {
            clients,
            poller,
            nodelay: config.nodelay,
            owned: Mutex::new(Vec::new()),
        })
    }

    /// Create a listener on `port` (0 for ephemeral) and register it.
    ///
    /// Returns the actual bound port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bind`] if socket setup fails, [`Error::Register`] if
    /// the poller refuses the descriptor.
    pub fn bind(&self, port: u16, backlog: i32) -> Result<u16> {
        let fd = endpoint::tcp_server(port, backlog).map_err(Error::Bind)?;

        let setup = endpoint::set_nonblocking(fd)
            .and_then(|()| endpoint::local_port(fd))
            .map_err(Error::Bind);
        let port = match setup {
            Ok(port) => port,
            Err(e) => {
                let _ = endpoint::close(fd);
                return Err(e);
            }
        };

        if let Err(e) = self.poller.register_listener(fd, fd as u64) {
            let _ = endpoint::close(fd);
            return Err(e);
        }

        self.owned.lock().push(fd);
        log::info!("[LISTENER] bound port {port} (fd {fd})");
        Ok(port)
    }

    /// Register an externally created listener. The caller keeps ownership
    /// of the descriptor and must have made it non-blocking.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Register`] if the poller refuses the descriptor.
    pub fn add(&self, fd: RawFd) -> Result<()> {
        self.poller.register_listener(fd, fd as u64)?;
        log::info!("[LISTENER] added external listener fd {fd}");
        Ok(())
    }

    /// Start the client pool, then run the accept loop on the calling
    /// thread until [`ListenerPool::stop`] closes the poller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Spawn`] if the client pool workers cannot start.
    pub fn run(&self) -> Result<()> {
        self.clients.run()?;

        let mut events: Vec<Event> = Vec::new();
        loop {
            match self.poller.wait(&mut events) {
                Ok(()) => {
                    for event in &events {
                        self.handle_listener_event(*event);
                    }
                }
                Err(_) => break,
            }
        }
        Ok(())
    }

    /// Close the listener poller, stop the inner pool, close owned
    /// listeners. Idempotent.
    pub fn stop(&self) {
        self.poller.close();
        self.clients.stop();

        for fd in self.owned.lock().drain(..) {
            let _ = endpoint::close(fd);
        }
        log::info!("[LISTENER] stopped");
    }

    /// The inner client pool (counters, size, handler access).
    #[must_use]
    pub fn clients(&self) -> &ClientPool<H> {
        &self.clients
    }

    fn handle_listener_event(&self, event: Event) {
        let fd = event.token as RawFd;

        if event.readiness.is_error() || event.readiness.is_hangup() {
            log::warn!("[LISTENER] error condition on fd {fd}, dropping listener");
            self.drop_listener(fd);
            return;
        }

        self.accept_loop(fd);
    }

    /// Accept until the backlog is drained. Remaining listeners keep
    /// serving if this one fails.
    fn accept_loop(&self, listener: RawFd) {
        loop {
            match endpoint::accept(listener) {
                Ok(fd) => {
                    if endpoint::set_nonblocking(fd).is_err() {
                        let _ = endpoint::close(fd);
                        continue;
                    }
                    if self.nodelay {
                        let _ = endpoint::set_nodelay(fd);
                    }
                    if !self.clients.add_client(fd) {
                        let _ = endpoint::close(fd);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::warn!("[LISTENER] accept failed on fd {listener}: {e}");
                    self.drop_listener(listener);
                    break;
                }
            }
        }
    }

    fn drop_listener(&self, fd: RawFd) {
        let _ = self.poller.deregister(fd);

        let mut owned = self.owned.lock();
        if let Some(pos) = owned.iter().position(|&o| o == fd) {
            owned.remove(pos);
        }
        // A dead listener is closed whether we created it or the caller did.
        let _ = endpoint::close(fd);
    }
}

impl<H: ClientHandler> Drop for ListenerPool<H> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ClientHandler;

    struct NullHandler;
    impl ClientHandler for NullHandler {}

    #[test]
    fn test_bind_ephemeral_reports_port() {
        let config = PoolConfig::default().with_workers(1).with_max_clients(4);
        let pool = ListenerPool::new(&config, NullHandler).expect("Failed to create");

        let port = pool.bind(0, 16).expect("Failed to bind");
        assert_ne!(port, 0);
        pool.stop();
    }

    #[test]
    fn test_bind_conflict_surfaces_error() {
        let config = PoolConfig::default().with_workers(1).with_max_clients(4);
        let pool = ListenerPool::new(&config, NullHandler).expect("Failed to create");

        let port = pool.bind(0, 16).expect("Failed to bind");
        let second = ListenerPool::new(&config, NullHandler).expect("Failed to create");
        assert!(matches!(second.bind(port, 16), Err(Error::Bind(_))));

        pool.stop();
        second.stop();
    }

    #[test]
    fn test_add_external_listener() {
        let config = PoolConfig::default().with_workers(1).with_max_clients(4);
        let pool = ListenerPool::new(&config, NullHandler).expect("Failed to create");

        let fd = endpoint::tcp_server(0, 16).expect("Failed to create listener");
        endpoint::set_nonblocking(fd).expect("Failed to unblock");
        pool.add(fd).expect("Failed to add");

        pool.stop();
        // Externally added descriptors remain with the caller.
        endpoint::close(fd).expect("fd should still be open after stop");
    }

    #[test]
    fn test_stop_idempotent() {
        let config = PoolConfig::default().with_workers(1).with_max_clients(4);
        let pool = ListenerPool::new(&config, NullHandler).expect("Failed to create");
        pool.bind(0, 16).expect("Failed to bind");
        pool.stop();
        pool.stop();
    }
}
