// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Socket primitives for listeners and pooled client descriptors.
//!
//! Thin portability layer over the TCP syscalls the pool needs. Listener
//! construction goes through `socket2`; per-descriptor operations that
//! `socket2` has no surface for (out-of-band receive, the SIOCATMARK probe,
//! accepting into a raw fd) call libc directly.
//!
//! All functions operate on raw descriptors because pooled clients live in
//! pre-allocated slots, not in owned socket objects; ownership is tracked by
//! the pool's slot state, and `close` is called exactly once per slot by the
//! recycle protocol.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::{IntoRawFd, RawFd};
use std::ptr;

/// Create a TCP listener bound on all interfaces.
///
/// The socket is created with `SO_REUSEADDR` so restarts do not trip over
/// sockets lingering in TIME_WAIT. Pass port 0 for an ephemeral port and
/// recover it with [`local_port`].
pub fn tcp_server(port: u16, backlog: i32) -> io::Result<RawFd> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;

    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into_raw_fd())
}

/// Accept one pending connection.
///
/// On a non-blocking listener, `ErrorKind::WouldBlock` means the backlog is
/// drained.
pub fn accept(listener: RawFd) -> io::Result<RawFd> {
    // SAFETY: listener is a valid descriptor owned by the caller; null
    // address arguments are permitted when the peer address is not wanted.
    let fd = unsafe { libc::accept(listener, ptr::null_mut(), ptr::null_mut()) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Read up to `buf.len()` bytes.
///
/// Returns `Ok(0)` on orderly peer close; `ErrorKind::WouldBlock` on a
/// drained non-blocking descriptor.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: buf is valid writable memory of the given length for the
    // duration of the call.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Write up to `buf.len()` bytes; returns the number actually written.
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    // SAFETY: buf is valid readable memory of the given length.
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Receive the pending out-of-band byte.
pub fn read_oob(fd: RawFd) -> io::Result<u8> {
    let mut byte = 0u8;
    // SAFETY: a one-byte buffer is valid for the call; MSG_OOB requests the
    // urgent byte.
    let n = unsafe { libc::recv(fd, ptr::addr_of_mut!(byte).cast(), 1, libc::MSG_OOB) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(byte)
}

/// Send one byte as TCP urgent data.
pub fn send_oob(fd: RawFd, byte: u8) -> io::Result<()> {
    // SAFETY: a one-byte buffer is valid for the call.
    let n = unsafe { libc::send(fd, ptr::addr_of!(byte).cast(), 1, libc::MSG_OOB) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// Not exposed by the `libc` crate on Linux targets; value matches
// <linux/sockios.h> / <asm-generic/sockios.h>.
#[cfg(target_os = "linux")]
const SIOCATMARK: libc::c_ulong = 0x8905;
#[cfg(not(target_os = "linux"))]
use libc::SIOCATMARK;

/// True if the read position is at the urgent-data mark (SIOCATMARK).
pub fn at_mark(fd: RawFd) -> io::Result<bool> {
    let mut mark: libc::c_int = 0;
    // SAFETY: SIOCATMARK writes one c_int through the provided pointer.
    let ret = unsafe { libc::ioctl(fd, SIOCATMARK as _, &mut mark) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(mark != 0)
}

/// Switch a descriptor to non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl F_GETFL/F_SETFL on a valid descriptor.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Enable `TCP_NODELAY` on a connected socket.
pub fn set_nodelay(fd: RawFd) -> io::Result<()> {
    let optval: libc::c_int = 1;
    // SAFETY: standard setsockopt with a c_int-sized option value.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            ptr::addr_of!(optval).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Local port a bound socket ended up on (for ephemeral binds).
pub fn local_port(fd: RawFd) -> io::Result<u16> {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    // SAFETY: addr/len describe a writable sockaddr_in-sized buffer.
    let ret = unsafe { libc::getsockname(fd, ptr::addr_of_mut!(addr).cast(), &mut len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(u16::from_be(addr.sin_port))
}

/// Close a descriptor. Errors are reported but cannot be acted on.
pub fn close(fd: RawFd) -> io::Result<()> {
    // SAFETY: the caller guarantees single ownership of fd at this point
    // (the recycle protocol clears the slot before the index re-enters the
    // free list).
    let ret = unsafe { libc::close(fd) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::TcpStream;
    use std::os::fd::AsRawFd;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_server_bind_and_local_port() {
        let fd = tcp_server(0, 16).expect("Failed to bind");
        let port = local_port(fd).expect("Failed to query port");
        assert_ne!(port, 0);
        close(fd).expect("Failed to close");
    }

    #[test]
    fn test_accept_read_write_roundtrip() {
        let fd = tcp_server(0, 16).expect("Failed to bind");
        let port = local_port(fd).expect("Failed to query port");

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("Failed to connect");
            stream.write_all(b"ping").expect("Failed to send");
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).expect("Failed to recv");
            buf
        });

        let conn = accept(fd).expect("Failed to accept");
        let mut buf = [0u8; 16];
        let n = read(conn, &mut buf).expect("Failed to read");
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(write(conn, b"pong").expect("Failed to write"), 4);

        assert_eq!(&client.join().expect("Client panicked"), b"pong");
        close(conn).ok();
        close(fd).ok();
    }

    #[test]
    fn test_nonblocking_accept_drains() {
        let fd = tcp_server(0, 16).expect("Failed to bind");
        set_nonblocking(fd).expect("Failed to unblock");

        let err = accept(fd).expect_err("Empty backlog must not accept");
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        close(fd).ok();
    }

    #[test]
    fn test_oob_byte_roundtrip() {
        let fd = tcp_server(0, 16).expect("Failed to bind");
        let port = local_port(fd).expect("Failed to query port");

        let stream = TcpStream::connect(("127.0.0.1", port)).expect("Failed to connect");
        let conn = accept(fd).expect("Failed to accept");

        send_oob(stream.as_raw_fd(), 0x7F).expect("Failed to send OOB");

        // Urgent data races the regular stream; poll briefly.
        let mut byte = None;
        for _ in 0..100 {
            match read_oob(conn) {
                Ok(b) => {
                    byte = Some(b);
                    break;
                }
                Err(_) => thread::sleep(Duration::from_millis(5)),
            }
        }
        assert_eq!(byte, Some(0x7F));

        close(conn).ok();
        close(fd).ok();
    }

    #[test]
    fn test_at_mark_quiet_socket() {
        let fd = tcp_server(0, 16).expect("Failed to bind");
        let port = local_port(fd).expect("Failed to query port");

        let _stream = TcpStream::connect(("127.0.0.1", port)).expect("Failed to connect");
        let conn = accept(fd).expect("Failed to accept");

        assert!(!at_mark(conn).expect("Failed to probe mark"));

        close(conn).ok();
        close(fd).ok();
    }
}
