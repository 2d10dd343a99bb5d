//! The per-connection framed-protocol state machine (§4.2).
//!
//! Grounded in the teacher's `src/connection.rs` (`PlainConnection`: owns a stream, an
//! `Interest` computed from pending output, and a `read`/`write`/`register` lifecycle)
//! and `server/src/sessions.rs` (growable read/write buffers sized in 16KB steps).
//! Unlike the teacher's `Connection`, this one is never shared behind an `Arc<Mutex<_>>`
//! — the concurrency model (§5) puts all connection state under exclusive reactor-thread
//! ownership, so [`Acceptor`](crate::acceptor::Acceptor) holds these directly in a
//! `slab::Slab`.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Result as IoResult};
use std::net::Shutdown;

use framing::{FrameDecoder, Status as FrameStatus};
use mio::{Interest, Registry, Token};

use crate::net::TcpStreamLike;

/// One pending or completed reply slot, keyed by request id (§3).
#[derive(Debug)]
enum ReplySlot {
    /// A frame has been handed to the producer; no result yet.
    Pending,
    /// The worker pool has delivered a result for this request.
    Ready {
        /// Whether the processor succeeded.
        success: bool,
        /// The serialized response payload (empty for one-way methods).
        bytes: Vec<u8>,
    },
}

/// Why a connection stopped accepting new frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed its write half (plain EOF).
    PeerClosed,
    /// A read from the socket failed.
    ReadError,
    /// The framed length header was invalid (§4.2).
    ProtocolError,
    /// A write to the socket failed while draining pending replies.
    WriteError,
    /// A processor reported failure (`success = false`); per the resolved open
    /// question (§11) this closes the connection silently rather than emitting a
    /// failure marker.
    ProcessorError,
    /// `Connection::close` was called directly (e.g. by acceptor/pool shutdown).
    Requested,
}

impl CloseReason {
    /// Whether this closure should be counted as an abnormal termination for
    /// telemetry purposes (§4.2: "close is reported to telemetry as an abnormal
    /// termination").
    pub fn is_abnormal(self) -> bool {
        !matches!(self, CloseReason::PeerClosed | CloseReason::Requested)
    }
}

/// One TCP connection's framed-protocol state.
#[derive(Debug)]
pub struct Connection<S: TcpStreamLike> {
    token: Token,
    stream: S,
    decoder: FrameDecoder,
    next_request_id: u64,
    pending_replies: BTreeMap<u64, ReplySlot>,
    write_buffer: Vec<u8>,
    write_pos: usize,
    closing: bool,
    closed: bool,
    close_reason: Option<CloseReason>,
}

impl<S: TcpStreamLike> Connection<S> {
    /// Wraps a freshly accepted, already-nonblocking stream.
    pub fn new(token: Token, stream: S, max_frame_size: usize) -> Self {
        Self {
            token,
            stream,
            decoder: FrameDecoder::new(max_frame_size),
            next_request_id: 0,
            pending_replies: BTreeMap::new(),
            write_buffer: Vec::new(),
            write_pos: 0,
            closing: false,
            closed: false,
            close_reason: None,
        }
    }

    /// This connection's slab token.
    pub fn token(&self) -> Token {
        self.token
    }

    /// True while the connection can still accept new frames and schedule replies
    /// (READ_LENGTH or READ_BODY, per §4.2). False once CLOSING has begun.
    pub fn is_ready(&self) -> bool {
        !self.closing && !self.closed
    }

    /// True once the connection is fully torn down (CLOSED). A closed connection is
    /// safe to drop from the owning acceptor's live-set.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Why the connection stopped, if it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    fn has_pending_write(&self) -> bool {
        self.write_pos < self.write_buffer.len()
    }

    fn interest(&self) -> Option<Interest> {
        if self.closed {
            return None;
        }
        if self.closing {
            return self.has_pending_write().then_some(Interest::WRITABLE);
        }
        Some(if self.has_pending_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        })
    }

    /// Registers this connection's stream with `registry` for its current interest.
    pub fn register(&mut self, registry: &Registry) -> IoResult<()> {
        if let Some(interest) = self.interest() {
            registry.register(&mut self.stream, self.token, interest)?;
        }
        Ok(())
    }

    /// Re-registers this connection's stream after its interest set may have changed.
    pub fn reregister(&mut self, registry: &Registry) -> IoResult<()> {
        match self.interest() {
            Some(interest) => registry.reregister(&mut self.stream, self.token, interest),
            None => Ok(()),
        }
    }

    /// Deregisters this connection's stream ahead of dropping it.
    pub fn deregister(&mut self, registry: &Registry) -> IoResult<()> {
        registry.deregister(&mut self.stream)
    }

    fn begin_closing(&mut self, reason: CloseReason) {
        if self.closing || self.closed {
            return;
        }
        self.closing = true;
        self.close_reason = Some(reason);
        if !self.has_pending_write() {
            self.finish_close();
        }
    }

    fn finish_close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// Idempotent hard close: cancels in-flight reads, attempts to drain pending
    /// writes is skipped (this is the "close now" path; use the read/write event
    /// handlers for a graceful drain), and shuts down the socket (§4.2).
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closing = true;
        self.close_reason.get_or_insert(CloseReason::Requested);
        self.finish_close();
    }

    /// Handles a readable event: pulls as many bytes as are available and feeds them
    /// to the frame decoder, invoking `on_frame(request_id, frame_bytes)` once per
    /// completed frame, in wire order (§4.2, pipelining).
    pub fn on_readable(&mut self, mut on_frame: impl FnMut(u64, Vec<u8>)) {
        if !self.is_ready() {
            return;
        }

        let mut buf = [0u8; 16 * 1024];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.begin_closing(CloseReason::PeerClosed);
                    return;
                }
                Ok(n) => {
                    let decoder = &mut self.decoder;
                    let pending = &mut self.pending_replies;
                    let next_id = &mut self.next_request_id;
                    let status = decoder.feed(&buf[..n], |frame| {
                        let id = *next_id;
                        *next_id += 1;
                        pending.insert(id, ReplySlot::Pending);
                        on_frame(id, frame);
                    });
                    if let FrameStatus::Fatal(_) = status {
                        self.begin_closing(CloseReason::ProtocolError);
                        return;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.begin_closing(CloseReason::ReadError);
                    return;
                }
            }
        }
    }

    /// Handles a writable event: drains as much of the pending write buffer as the
    /// socket accepts; finishes closing once fully drained if CLOSING was requested.
    pub fn on_writable(&mut self) {
        while self.has_pending_write() {
            match self.stream.write(&self.write_buffer[self.write_pos..]) {
                Ok(0) => {
                    self.begin_closing(CloseReason::WriteError);
                    return;
                }
                Ok(n) => self.write_pos += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.begin_closing(CloseReason::WriteError);
                    return;
                }
            }
        }

        self.write_buffer.clear();
        self.write_pos = 0;

        if self.closing {
            self.finish_close();
        }
    }

    /// Delivers a worker result for `request_id` (§4.2, §4.5). Dropped silently if the
    /// connection is already CLOSING or CLOSED.
    pub fn ready(&mut self, request_id: u64, success: bool, response_bytes: Vec<u8>) {
        if !self.is_ready() {
            return;
        }
        if let Some(slot) = self.pending_replies.get_mut(&request_id) {
            *slot = ReplySlot::Ready { success, bytes: response_bytes };
        }
        self.flush_ready_replies();
    }

    fn flush_ready_replies(&mut self) {
        loop {
            let Some((&id, _)) = self.pending_replies.iter().next() else { break };
            let is_ready = matches!(self.pending_replies[&id], ReplySlot::Ready { .. });
            if !is_ready {
                break;
            }
            let ReplySlot::Ready { success, bytes } = self.pending_replies.remove(&id).unwrap()
            else {
                unreachable!()
            };

            if success {
                if !bytes.is_empty() {
                    framing::encode_into(&mut self.write_buffer, &bytes);
                }
            } else {
                self.begin_closing(CloseReason::ProcessorError);
                break;
            }
        }
    }

    /// Number of requests still awaiting a worker result, for diagnostics/tests.
    pub fn pending_count(&self) -> usize {
        self.pending_replies.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};
    use std::net::SocketAddr;

    use mio::event::Source;

    /// An in-memory stream standing in for a socket, so the connection state machine
    /// can be driven without a kernel TCP pair.
    #[derive(Debug, Default)]
    struct MockStream {
        inbound: VecDeque<u8>,
        outbound: Vec<u8>,
        shutdown: bool,
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.inbound.is_empty() {
                return Err(io::Error::new(ErrorKind::WouldBlock, "no data"));
            }
            let n = buf.len().min(self.inbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.inbound.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outbound.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Source for MockStream {
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

    impl crate::net::TcpStreamLike for MockStream {
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

    fn conn_with_inbound(bytes: &[u8]) -> Connection<MockStream> {
        let stream = MockStream {
            inbound: bytes.iter().copied().collect(),
            ..Default::default()
        };
        Connection::new(Token(0), stream, framing::DEFAULT_MAX_FRAME_SIZE)
    }

    #[test]
    fn pipelines_two_requests_before_any_reply() {
        let mut wire = framing::encode(&[1]);
        wire.extend(framing::encode(&[2]));
        let mut conn = conn_with_inbound(&wire);

        let mut seen = Vec::new();
        conn.on_readable(|id, frame| seen.push((id, frame)));

        assert_eq!(seen, vec![(0, vec![1]), (1, vec![2])]);
        assert_eq!(conn.pending_count(), 2);
        assert!(conn.stream.outbound.is_empty());
    }

    #[test]
    fn replies_are_written_in_ascending_request_id_order() {
        let mut wire = framing::encode(&[1]);
        wire.extend(framing::encode(&[2]));
        let mut conn = conn_with_inbound(&wire);
        conn.on_readable(|_, _| {});

        // complete out of order: id 1 first, then id 0.
        conn.ready(1, true, vec![0xBB]);
        assert!(conn.stream.outbound.is_empty(), "id 0 still pending, nothing flushed yet");

        conn.ready(0, true, vec![0xAA]);
        let mut expected = framing::encode(&[0xAA]);
        expected.extend(framing::encode(&[0xBB]));
        assert_eq!(conn.stream.outbound, expected);
    }

    #[test]
    fn one_way_reply_advances_but_emits_nothing() {
        let wire = framing::encode(&[9]);
        let mut conn = conn_with_inbound(&wire);
        conn.on_readable(|_, _| {});

        conn.ready(0, true, Vec::new());
        assert!(conn.stream.outbound.is_empty());
        assert!(conn.is_ready());
    }

    #[test]
    fn invalid_length_closes_with_no_bytes_written() {
        let mut conn = conn_with_inbound(&(-1i32).to_be_bytes());
        conn.on_readable(|_, _| panic!("no frame should decode"));
        assert!(!conn.is_ready());
        assert_eq!(conn.close_reason(), Some(CloseReason::ProtocolError));
        conn.on_writable();
        assert!(conn.is_closed());
        assert!(conn.stream.outbound.is_empty());
    }

    #[test]
    fn processor_failure_closes_silently_after_flushing_earlier_replies() {
        let mut wire = framing::encode(&[1]);
        wire.extend(framing::encode(&[2]));
        let mut conn = conn_with_inbound(&wire);
        conn.on_readable(|_, _| {});

        conn.ready(0, true, vec![0xAA]);
        conn.ready(1, false, Vec::new());

        assert_eq!(conn.stream.outbound, framing::encode(&[0xAA]));
        assert!(!conn.is_ready());
        assert_eq!(conn.close_reason(), Some(CloseReason::ProcessorError));
    }

    #[test]
    fn late_ready_after_close_is_dropped_silently() {
        let mut conn = conn_with_inbound(&framing::encode(&[1]));
        conn.on_readable(|_, _| {});
        conn.close();
        conn.ready(0, true, vec![0xFF]);
        assert!(conn.stream.outbound.is_empty());
    }
}
