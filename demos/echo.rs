// SPDX-License-Identifier: Apache-2.0 OR MIT

//! An echo server on the pool.
//!
//! Run with `cargo run --example echo [port]`, then:
//!
//! ```text
//! $ nc 127.0.0.1 60008
//! hello
//! hello
//! ```
//!
//! Press Enter in the server terminal to quit.

use sockpool::{endpoint, ClientHandler, ListenerPool, PoolConfig};
use std::os::fd::RawFd;
use std::sync::Arc;
use std::thread;

struct Echo;

impl ClientHandler for Echo {
    fn on_input(&self, fd: RawFd, data: &mut [u8]) {
        // Just echo the message back
        let _ = endpoint::write(fd, data);
    }
}

fn main() -> sockpool::Result<()> {
    env_logger::init();

    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(60008);

    let config = PoolConfig::default()
        .with_workers(10)
        .with_max_clients(10_000);

    let server = Arc::new(ListenerPool::new(&config, Echo)?);
    server.bind(port, 1024)?;

    let runner = Arc::clone(&server);
    let run_handle = thread::spawn(move || runner.run());

    println!("echo server listening on port {port}; press Enter to quit");
    let mut line = String::new();
    let _ = std::io::stdin().read_line(&mut line);

    server.stop();
    run_handle.join().expect("server thread panicked")
}
