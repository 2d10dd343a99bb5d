//! Socket traits abstracting over `mio`'s concrete types.
//!
//! Grounded in the teacher's `src/net/tcp_listener.rs` / `src/net/tcp_stream.rs`: a
//! thin trait per socket kind, implemented for the real `mio::net` types, so the
//! acceptor and connection can be exercised in tests against anything that satisfies
//! the trait without requiring a bound kernel socket for every test.

use std::io::{Read, Result, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{FromRawFd, RawFd};

use mio::event::Source;

use crate::error::BindError;

/// Binds the first address in `candidates` that succeeds, trying them in order.
///
/// Used when an embedding application offers a pool of candidate addresses (e.g. a
/// port range) rather than one fixed address (§7's `BindError`).
pub fn bind_any<T, S>(candidates: &[SocketAddr]) -> std::result::Result<T, BindError>
where
    T: TcpListenerLike<S>,
    S: TcpStreamLike,
{
    let mut attempted = Vec::with_capacity(candidates.len());
    let mut last_error = None;
    for &addr in candidates {
        match T::bind(addr) {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                attempted.push(addr);
                last_error = Some(e);
            }
        }
    }
    Err(BindError {
        attempted,
        last_error: last_error
            .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no candidate addresses")),
    })
}

/// A listening socket: accept connections, report its local address.
pub trait TcpListenerLike<S>: Source
where
    S: TcpStreamLike,
{
    /// Binds a fresh listening socket to `addr` with `SO_REUSEADDR` set (§6).
    fn bind(addr: SocketAddr) -> Result<Self>
    where
        Self: Sized;

    /// Adopts an inherited, already-listening file descriptor (§6 "hosted mode").
    ///
    /// # Safety
    /// `fd` must be a valid, open, listening TCP socket file descriptor that this
    /// process owns exclusively from this point on.
    unsafe fn from_raw_fd(fd: RawFd) -> Self
    where
        Self: Sized;

    /// Accepts one pending connection in nonblocking mode.
    fn accept(&self) -> Result<(S, SocketAddr)>;

    /// The address this listener is bound to.
    fn local_addr(&self) -> Result<SocketAddr>;
}

/// A connected stream: read, write, and adjust socket options.
pub trait TcpStreamLike: Source + Read + Write + Send {
    /// Enables or disables Nagle's algorithm (§6: acceptors set this to `true`).
    fn set_nodelay(&self, nodelay: bool) -> Result<()>;

    /// The remote peer's address, used only for diagnostics.
    fn peer_addr(&self) -> Result<SocketAddr>;

    /// Shuts down the given half (or both) of the connection.
    fn shutdown(&self, how: Shutdown) -> Result<()>;
}

impl TcpListenerLike<mio::net::TcpStream> for mio::net::TcpListener {
    fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        reuse_addr(&listener)?;
        Ok(mio::net::TcpListener::from_std(listener))
    }

    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        let listener = std::net::TcpListener::from_raw_fd(fd);
        let _ = listener.set_nonblocking(true);
        mio::net::TcpListener::from_std(listener)
    }

    fn accept(&self) -> Result<(mio::net::TcpStream, SocketAddr)> {
        mio::net::TcpListener::accept(self)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        mio::net::TcpListener::local_addr(self)
    }
}

impl TcpStreamLike for mio::net::TcpStream {
    fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        mio::net::TcpStream::set_nodelay(self, nodelay)
    }

    fn peer_addr(&self) -> Result<SocketAddr> {
        mio::net::TcpStream::peer_addr(self)
    }

    fn shutdown(&self, how: Shutdown) -> Result<()> {
        mio::net::TcpStream::shutdown(self, how)
    }
}

#[cfg(unix)]
fn reuse_addr(listener: &std::net::TcpListener) -> Result<()> {
    use std::os::fd::AsRawFd;

    let fd = listener.as_raw_fd();
    let optval: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn reuse_addr(_listener: &std::net::TcpListener) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_any_picks_the_first_usable_candidate() {
        let taken = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let taken_addr = taken.local_addr().unwrap();
        let free_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let result: std::result::Result<mio::net::TcpListener, BindError> =
            bind_any(&[taken_addr, free_addr]);
        // binding a port already bound without SO_REUSEPORT fails on most platforms,
        // so the pool should fall through to the free candidate.
        assert!(result.is_ok());
    }

    #[test]
    fn bind_any_reports_every_attempted_address_on_total_failure() {
        let taken = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let taken_addr = taken.local_addr().unwrap();

        let result: std::result::Result<mio::net::TcpListener, BindError> =
            bind_any(&[taken_addr]);
        let err = result.expect_err("binding an already-bound address must fail");
        assert_eq!(err.attempted, vec![taken_addr]);
    }
}
