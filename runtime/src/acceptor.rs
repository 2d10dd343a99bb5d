//! Listening sockets and their live-connection sets (§4.3).
//!
//! Grounded in the teacher's `src/multilistener.rs` (`MultiListener`: a `Slab` of
//! connections keyed by `mio::Token`, a reserved token for the listening socket itself,
//! an `accept` loop run until `WouldBlock`) and enriched with `original_source`'s
//! `thriftworker/acceptor.py` `Connections` registry, which tracks live connections
//! separately from the accept loop so a pool-saturation pause can stop accepting
//! without touching already-open connections.

use std::io::{self, ErrorKind};
use std::time::{Duration, Instant};

use mio::{Interest, Registry, Token};
use slab::Slab;

use crate::connection::Connection;
use crate::error::AllocationError;
use crate::net::{TcpListenerLike, TcpStreamLike};

/// Size of the token range [`crate::hub::Hub`] reserves per acceptor. Token `base` is
/// the listening socket; `base + 1 ..= base + TOKENS_PER_ACCEPTOR - 1` are available
/// for that acceptor's connections. Bounds how many simultaneous connections one
/// acceptor can hold, which at a million is not a practical limit for a single
/// listening socket.
pub const TOKENS_PER_ACCEPTOR: usize = 1 << 20;

/// Whether an acceptor is currently taking new connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptState {
    Accepting,
    Paused,
    Closed,
}

/// A listening socket plus the set of connections it has accepted (§4.3).
///
/// Every method here assumes it runs on the reactor thread (§5); there is no internal
/// synchronization.
#[derive(Debug)]
pub struct Acceptor<T, S>
where
    T: TcpListenerLike<S>,
    S: TcpStreamLike,
{
    name: String,
    listener: T,
    state: AcceptState,
    connections: Slab<Connection<S>>,
    max_frame_size: usize,
    closing_since: Option<Instant>,
    token_base: usize,
}

impl<T, S> Acceptor<T, S>
where
    T: TcpListenerLike<S>,
    S: TcpStreamLike,
{
    /// Wraps an already-bound, nonblocking listener under `name`. `token_base` is the
    /// start of this acceptor's reserved [`TOKENS_PER_ACCEPTOR`]-wide token range,
    /// assigned by [`crate::hub::Hub`] at registration time so multiple acceptors can
    /// share one `mio::Poll` without colliding tokens.
    pub fn new(name: impl Into<String>, listener: T, max_frame_size: usize, token_base: usize) -> Self {
        Self {
            name: name.into(),
            listener,
            state: AcceptState::Accepting,
            connections: Slab::new(),
            max_frame_size,
            closing_since: None,
            token_base,
        }
    }

    /// The name this acceptor was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of currently open connections.
    pub fn live_count(&self) -> usize {
        self.connections.len()
    }

    fn listen_token(&self) -> Token {
        Token(self.token_base)
    }

    /// Start of this acceptor's reserved token range.
    pub fn token_base(&self) -> usize {
        self.token_base
    }

    /// Registers the listening socket itself with `registry`.
    pub fn register_listener(&mut self, registry: &Registry) -> io::Result<()> {
        let token = self.listen_token();
        registry.register(&mut self.listener, token, Interest::READABLE)
    }

    /// Accepts every currently pending connection, registering each with `registry`
    /// under a token allocated from this acceptor's own slab, offset into its reserved
    /// range. No-op while paused or closed (§4.5: backpressure suppresses new accepts,
    /// not existing traffic).
    pub fn accept_all(&mut self, registry: &Registry) {
        if self.state != AcceptState::Accepting {
            return;
        }
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    let _ = stream.set_nodelay(true);
                    let entry = self.connections.vacant_entry();
                    if entry.key() + 1 >= TOKENS_PER_ACCEPTOR {
                        log::warn!(
                            "{}: {}",
                            self.name,
                            AllocationError { resource: "connection tokens" }
                        );
                        break;
                    }
                    let token = Token(self.token_base + 1 + entry.key());
                    let mut connection = Connection::new(token, stream, self.max_frame_size);
                    if connection.register(registry).is_ok() {
                        entry.insert(connection);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(_) => return,
            }
        }
    }

    fn local_key(&self, token: Token) -> Option<usize> {
        token.0.checked_sub(self.token_base + 1)
    }

    /// Dispatches a readiness event for one of this acceptor's connections.
    ///
    /// `on_frame` is invoked once per completed inbound frame as `(token, request_id,
    /// payload)`. Closed connections are reaped immediately after the event is handled.
    pub fn dispatch(
        &mut self,
        registry: &Registry,
        token: Token,
        readable: bool,
        writable: bool,
        on_frame: &mut dyn FnMut(Token, u64, Vec<u8>),
    ) {
        let Some(key) = self.local_key(token) else { return };
        let Some(connection) = self.connections.get_mut(key) else { return };

        if readable {
            connection.on_readable(|id, frame| on_frame(token, id, frame));
        }
        if writable {
            connection.on_writable();
        }

        if connection.is_closed() {
            let mut connection = self.connections.remove(key);
            let _ = connection.deregister(registry);
        } else {
            let _ = connection.reregister(registry);
        }
    }

    /// Delivers a worker result to one of this acceptor's connections, flushing any
    /// replies that are now contiguous (§4.2). Reports whether the connection was
    /// still ready to receive it, so the caller can do the reactor-side telemetry
    /// accounting (§4.5) that this method has no business knowing about.
    pub fn deliver_reply(
        &mut self,
        registry: &Registry,
        token: Token,
        request_id: u64,
        success: bool,
        response_bytes: Vec<u8>,
    ) -> DeliverOutcome {
        let Some(key) = self.local_key(token) else { return DeliverOutcome::NoSuchConnection };
        let Some(connection) = self.connections.get_mut(key) else {
            return DeliverOutcome::NoSuchConnection;
        };
        let was_ready = connection.is_ready();
        let response_empty = response_bytes.is_empty();
        connection.ready(request_id, success, response_bytes);

        if connection.is_closed() {
            let mut connection = self.connections.remove(key);
            let _ = connection.deregister(registry);
        } else {
            let _ = connection.reregister(registry);
        }

        if was_ready {
            DeliverOutcome::Delivered { success }
        } else {
            DeliverOutcome::Late { success, response_empty }
        }
    }

    /// Stops accepting new connections without disturbing existing ones (§4.5, edge
    /// triggered: calling this while already paused or closed is a no-op).
    pub fn stop_accepting(&mut self, registry: &Registry) {
        if self.state != AcceptState::Accepting {
            return;
        }
        self.state = AcceptState::Paused;
        let _ = registry.deregister(&mut self.listener);
    }

    /// Resumes accepting new connections after [`Acceptor::stop_accepting`] (§4.5).
    pub fn start_accepting(&mut self, registry: &Registry) {
        if self.state != AcceptState::Paused {
            return;
        }
        self.state = AcceptState::Accepting;
        let token = self.listen_token();
        let _ = registry.register(&mut self.listener, token, Interest::READABLE);
    }

    /// Begins a graceful shutdown: stops accepting immediately and marks the deadline
    /// after which [`Acceptor::force_close_if_overdue`] will sever every remaining
    /// connection (§4.3).
    pub fn begin_close(&mut self, registry: &Registry) {
        if self.state == AcceptState::Closed {
            return;
        }
        let _ = registry.deregister(&mut self.listener);
        self.state = AcceptState::Closed;
        self.closing_since = Some(Instant::now());
        for (_, connection) in self.connections.iter_mut() {
            connection.close();
        }
    }

    /// True once every connection has drained and this acceptor can be dropped.
    pub fn is_fully_closed(&self) -> bool {
        self.state == AcceptState::Closed && self.connections.is_empty()
    }

    /// Forcibly shuts down any connection still open `shutdown_timeout` after
    /// [`Acceptor::begin_close`] (§4.3's drain deadline).
    pub fn force_close_if_overdue(&mut self, registry: &Registry, shutdown_timeout: Duration) {
        let Some(since) = self.closing_since else { return };
        if since.elapsed() < shutdown_timeout {
            return;
        }
        for (_, connection) in self.connections.iter_mut() {
            connection.close();
        }
        let tokens: Vec<usize> = self.connections.iter().map(|(k, _)| k).collect();
        for key in tokens {
            let mut connection = self.connections.remove(key);
            let _ = connection.deregister(registry);
        }
    }
}

/// Outcome of [`Acceptor::deliver_reply`], carrying exactly what the reactor-side
/// accounting in §4.5 needs to decide what to record, without exposing connection
/// internals outside this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverOutcome {
    /// The connection was still ready (§4.2) when the reply arrived.
    Delivered {
        /// Whether the processor completed without a framework-level error.
        success: bool,
    },
    /// The connection had already begun closing before the reply arrived; it was
    /// dropped silently (§4.2). `response_empty` tells the caller whether this was a
    /// one-way call, which must not count as a dispatch-late event (§4.5).
    Late {
        /// Whether the processor completed without a framework-level error.
        success: bool,
        /// Whether the response payload was empty.
        response_empty: bool,
    },
    /// No connection exists for the given token; it was already reaped.
    NoSuchConnection,
}

/// Object-safe view of an [`Acceptor`], letting [`crate::hub::Hub`] hold acceptors
/// bound to different concrete listener/stream types in a single collection.
pub trait AcceptorHandle: std::fmt::Debug + Send {
    /// See [`Acceptor::name`].
    fn name(&self) -> &str;
    /// See [`Acceptor::live_count`].
    fn live_count(&self) -> usize;
    /// See [`Acceptor::token_base`].
    fn token_base(&self) -> usize;
    /// See [`Acceptor::register_listener`].
    fn register_listener(&mut self, registry: &Registry) -> io::Result<()>;
    /// See [`Acceptor::accept_all`].
    fn accept_all(&mut self, registry: &Registry);
    /// See [`Acceptor::dispatch`].
    fn dispatch(
        &mut self,
        registry: &Registry,
        token: Token,
        readable: bool,
        writable: bool,
        on_frame: &mut dyn FnMut(Token, u64, Vec<u8>),
    );
    /// See [`Acceptor::deliver_reply`].
    fn deliver_reply(
        &mut self,
        registry: &Registry,
        token: Token,
        request_id: u64,
        success: bool,
        response_bytes: Vec<u8>,
    ) -> DeliverOutcome;
    /// See [`Acceptor::stop_accepting`].
    fn stop_accepting(&mut self, registry: &Registry);
    /// See [`Acceptor::start_accepting`].
    fn start_accepting(&mut self, registry: &Registry);
    /// See [`Acceptor::begin_close`].
    fn begin_close(&mut self, registry: &Registry);
    /// See [`Acceptor::is_fully_closed`].
    fn is_fully_closed(&self) -> bool;
    /// See [`Acceptor::force_close_if_overdue`].
    fn force_close_if_overdue(&mut self, registry: &Registry, shutdown_timeout: Duration);
}

impl<T, S> AcceptorHandle for Acceptor<T, S>
where
    T: TcpListenerLike<S> + Send + 'static + std::fmt::Debug,
    S: TcpStreamLike + 'static + std::fmt::Debug,
{
    fn name(&self) -> &str {
        Acceptor::name(self)
    }
    fn live_count(&self) -> usize {
        Acceptor::live_count(self)
    }
    fn token_base(&self) -> usize {
        Acceptor::token_base(self)
    }
    fn register_listener(&mut self, registry: &Registry) -> io::Result<()> {
        Acceptor::register_listener(self, registry)
    }
    fn accept_all(&mut self, registry: &Registry) {
        Acceptor::accept_all(self, registry)
    }
    fn dispatch(
        &mut self,
        registry: &Registry,
        token: Token,
        readable: bool,
        writable: bool,
        on_frame: &mut dyn FnMut(Token, u64, Vec<u8>),
    ) {
        Acceptor::dispatch(self, registry, token, readable, writable, on_frame)
    }
    fn deliver_reply(
        &mut self,
        registry: &Registry,
        token: Token,
        request_id: u64,
        success: bool,
        response_bytes: Vec<u8>,
    ) -> DeliverOutcome {
        Acceptor::deliver_reply(self, registry, token, request_id, success, response_bytes)
    }
    fn stop_accepting(&mut self, registry: &Registry) {
        Acceptor::stop_accepting(self, registry)
    }
    fn start_accepting(&mut self, registry: &Registry) {
        Acceptor::start_accepting(self, registry)
    }
    fn begin_close(&mut self, registry: &Registry) {
        Acceptor::begin_close(self, registry)
    }
    fn is_fully_closed(&self) -> bool {
        Acceptor::is_fully_closed(self)
    }
    fn force_close_if_overdue(&mut self, registry: &Registry, shutdown_timeout: Duration) {
        Acceptor::force_close_if_overdue(self, registry, shutdown_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{Shutdown, SocketAddr};

    #[derive(Debug, Default)]
    struct DeadStream;

    impl Read for DeadStream {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(ErrorKind::WouldBlock, "no data"))
        }
    }
    impl Write for DeadStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
    impl mio::event::Source for DeadStream {
        fn register(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
            Ok(())
        }
        fn reregister(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
            Ok(())
        }
        fn deregister(&mut self, _: &Registry) -> io::Result<()> {
            Ok(())
        }
    }
    impl TcpStreamLike for DeadStream {
        fn set_nodelay(&self, _: bool) -> io::Result<()> {
            Ok(())
        }
        fn peer_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:0".parse().unwrap())
        }
        fn shutdown(&self, _: Shutdown) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Debug)]
    struct NoListener;

    impl mio::event::Source for NoListener {
        fn register(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
            Ok(())
        }
        fn reregister(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
            Ok(())
        }
        fn deregister(&mut self, _: &Registry) -> io::Result<()> {
            Ok(())
        }
    }

    impl TcpListenerLike<DeadStream> for NoListener {
        fn bind(_addr: SocketAddr) -> io::Result<Self> {
            Ok(NoListener)
        }
        unsafe fn from_raw_fd(_fd: std::os::fd::RawFd) -> Self {
            NoListener
        }
        fn accept(&self) -> io::Result<(DeadStream, SocketAddr)> {
            Err(io::Error::new(ErrorKind::WouldBlock, "no pending connections"))
        }
        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:0".parse().unwrap())
        }
    }

    #[test]
    fn stop_accepting_is_idempotent_and_leaves_connections_untouched() {
        let poll = mio::Poll::new().unwrap();
        let mut acceptor: Acceptor<NoListener, DeadStream> =
            Acceptor::new("echo", NoListener, framing::DEFAULT_MAX_FRAME_SIZE, 0);

        acceptor.stop_accepting(poll.registry());
        acceptor.stop_accepting(poll.registry());
        assert_eq!(acceptor.state, AcceptState::Paused);

        acceptor.start_accepting(poll.registry());
        assert_eq!(acceptor.state, AcceptState::Accepting);
    }

    #[test]
    fn begin_close_with_no_connections_is_immediately_fully_closed() {
        let poll = mio::Poll::new().unwrap();
        let mut acceptor: Acceptor<NoListener, DeadStream> =
            Acceptor::new("echo", NoListener, framing::DEFAULT_MAX_FRAME_SIZE, 0);
        acceptor.begin_close(poll.registry());
        assert!(acceptor.is_fully_closed());
    }
}
