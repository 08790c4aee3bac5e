//! Nonblocking socket plumbing for the broadcaster event loop.
//!
//! All safekeeper sockets are nonblocking with TCP_NODELAY. Partial
//! reads and writes report how many bytes were transferred before
//! EWOULDBLOCK so the caller can resume later from a saved offset.
//! The state machines above never see the multiplexer; they only deal
//! in [`Readiness`].

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::sockopt::{SocketError, TcpNoDelay};
use nix::sys::socket::{
    connect, getsockopt, setsockopt, socket, AddressFamily, InetAddr, SockAddr, SockFlag, SockType,
};

fn nix_to_io(e: Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

/// Initiate a nonblocking connection to `host:port`.
///
/// Returns the socket and whether the connection was established
/// inline (common on loopback). If not, completion is signalled by the
/// socket becoming writable; the caller must then inspect `SO_ERROR`
/// with [`check_connect_result`] to tell success from failure.
pub fn connect_async(host: &str, port: u16) -> io::Result<(TcpStream, bool)> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match connect_addr(addr) {
            Ok(res) => return Ok(res),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "could not resolve any address")
    }))
}

fn connect_addr(addr: SocketAddr) -> io::Result<(TcpStream, bool)> {
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };
    let fd = socket(
        family,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(nix_to_io)?;
    // Wrap the fd immediately so every error path below closes it.
    let stream = unsafe { TcpStream::from_raw_fd(fd) };
    setsockopt(fd, TcpNoDelay, &true).map_err(nix_to_io)?;

    let sockaddr = SockAddr::new_inet(InetAddr::from_std(&addr));
    loop {
        match connect(fd, &sockaddr) {
            Ok(()) => return Ok((stream, true)),
            Err(Errno::EINTR) => continue,
            Err(Errno::EINPROGRESS) => return Ok((stream, false)),
            Err(e) => return Err(nix_to_io(e)),
        }
    }
}

/// Read the result of a pending connect from `SO_ERROR`.
pub fn check_connect_result(sock: &TcpStream) -> io::Result<()> {
    let err = getsockopt(sock.as_raw_fd(), SocketError).map_err(nix_to_io)?;
    if err == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(err))
    }
}

/// Read as much of `buf` as the socket can supply without blocking.
///
/// Returns the number of bytes placed in `buf`, which is less than
/// `buf.len()` if the read would block. EOF while more data is
/// expected is an error; the peer is gone.
pub fn read_partial(mut sock: &TcpStream, buf: &mut [u8]) -> io::Result<usize> {
    let mut offs = 0;
    while offs < buf.len() {
        match sock.read(&mut buf[offs..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed connection",
                ))
            }
            Ok(n) => offs += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(offs)
}

/// Write as much of `buf` as the socket will take without blocking.
///
/// Returns the number of bytes consumed from `buf`.
pub fn write_partial(mut sock: &TcpStream, buf: &[u8]) -> io::Result<usize> {
    let mut offs = 0;
    while offs < buf.len() {
        match sock.write(&buf[offs..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write to socket",
                ))
            }
            Ok(n) => offs += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(offs)
}

/// Write all of `buf`, polling for writability as needed.
///
/// Only used for the small one-shot election records; WAL frames go
/// through [`write_partial`] under the event loop's backpressure.
pub fn write_all(sock: &TcpStream, buf: &[u8]) -> io::Result<()> {
    let mut offs = 0;
    while offs < buf.len() {
        offs += write_partial(sock, &buf[offs..])?;
        if offs < buf.len() {
            wait_writable(sock)?;
        }
    }
    Ok(())
}

fn wait_writable(sock: &TcpStream) -> io::Result<()> {
    let mut pfd = PollFd::new(sock.as_raw_fd(), PollFlags::POLLOUT);
    loop {
        match poll(std::slice::from_mut(&mut pfd), -1) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(nix_to_io(e)),
        }
    }
}

/// Per-socket interest and result of one multiplexer wait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub read: bool,
    pub write: bool,
}

/// Wait for any of the given sockets to become ready, or for the
/// timeout (milliseconds, -1 for none) to expire.
///
/// The result vector is parallel to `interest`. EINTR is reported as
/// "nothing ready"; the caller's loop comes right back. POLLERR and
/// POLLHUP surface as read readiness: the next read on the socket
/// returns the error and the owning state machine resets the peer.
pub fn wait(interest: &[(RawFd, Readiness)], timeout_ms: i32) -> io::Result<Vec<Readiness>> {
    let mut pollfds: Vec<PollFd> = interest
        .iter()
        .map(|(fd, r)| {
            let mut events = PollFlags::empty();
            if r.read {
                events.insert(PollFlags::POLLIN);
            }
            if r.write {
                events.insert(PollFlags::POLLOUT);
            }
            PollFd::new(*fd, events)
        })
        .collect();

    match poll(&mut pollfds, timeout_ms) {
        Ok(_) => {}
        Err(Errno::EINTR) => return Ok(vec![Readiness::default(); interest.len()]),
        Err(e) => return Err(nix_to_io(e)),
    }

    Ok(pollfds
        .iter()
        .map(|pfd| {
            let revents = pfd.revents().unwrap_or_else(PollFlags::empty);
            Readiness {
                read: revents
                    .intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP),
                write: revents.contains(PollFlags::POLLOUT),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn connect_to(listener: &TcpListener) -> TcpStream {
        let addr = listener.local_addr().unwrap();
        let (sock, established) = connect_async("127.0.0.1", addr.port()).unwrap();
        if !established {
            let ready = wait(&[(sock.as_raw_fd(), Readiness { read: false, write: true })], 5000)
                .unwrap();
            assert!(ready[0].write);
            check_connect_result(&sock).unwrap();
        }
        sock
    }

    #[test]
    fn test_connect_and_partial_io() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = connect_to(&listener);
        let (mut server, _) = listener.accept().unwrap();

        // nothing sent yet: partial read returns 0, not an error
        let mut buf = [0u8; 8];
        assert_eq!(read_partial(&client, &mut buf).unwrap(), 0);

        server.write_all(b"xyz").unwrap();
        let ready = wait(
            &[(client.as_raw_fd(), Readiness { read: true, write: false })],
            5000,
        )
        .unwrap();
        assert!(ready[0].read);
        // three bytes available out of eight requested
        assert_eq!(read_partial(&client, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"xyz");

        write_all(&client, b"pong").unwrap();
        let mut reply = [0u8; 4];
        server.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"pong");
    }

    #[test]
    fn test_read_partial_reports_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = connect_to(&listener);
        let (server, _) = listener.accept().unwrap();
        drop(server);

        let _ = wait(
            &[(client.as_raw_fd(), Readiness { read: true, write: false })],
            5000,
        )
        .unwrap();
        let mut buf = [0u8; 8];
        let err = read_partial(&client, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_failed_connect_reported_via_so_error() {
        // bind a port and close the listener so connects are refused
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        match connect_async("127.0.0.1", addr.port()) {
            // refused inline
            Err(_) => {}
            Ok((_, true)) => panic!("connect to a closed port succeeded"),
            Ok((sock, false)) => {
                let _ = wait(
                    &[(sock.as_raw_fd(), Readiness { read: false, write: true })],
                    5000,
                )
                .unwrap();
                check_connect_result(&sock).unwrap_err();
            }
        }
    }
}
