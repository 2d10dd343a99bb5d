//! End-to-end scenarios driving a real [`Application`] over a real TCP loopback
//! connection, grounded in the teacher's `server/examples/example.rs` style of
//! exercising a listener against a plain `std::net::TcpStream` client.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use runtime::app::Application;
use runtime::config::{RuntimeConfig, WorkerKind};
use runtime::net::TcpListenerLike;
use runtime::services::{ProcessResult, Processor, Service};

const ONE_WAY_MARKER: u8 = 0xFF;
const FAIL_MARKER: u8 = 0xEE;
const SLOW_MARKER: u8 = 0xDD;

struct TestProcessor {
    delay: Duration,
}

impl Processor for TestProcessor {
    fn process(&self, request: &[u8]) -> ProcessResult {
        if !self.delay.is_zero() && request.first() == Some(&SLOW_MARKER) {
            std::thread::sleep(self.delay);
        }
        match request.first() {
            Some(&ONE_WAY_MARKER) => ProcessResult::one_way(),
            Some(&FAIL_MARKER) => ProcessResult::failed(),
            _ => ProcessResult::ok(request.to_vec()),
        }
    }
}

fn start_app(kind: WorkerKind, pool_size: usize, delay: Duration) -> (Application, SocketAddr) {
    let mut config = RuntimeConfig::default();
    config.worker_kind = kind;
    config.worker_pool_size = pool_size;

    let mut app = Application::new(config).expect("create application");
    app.register_service(Service::new("Test", Arc::new(TestProcessor { delay })))
        .expect("register service");

    let listener =
        <mio::net::TcpListener as TcpListenerLike<mio::net::TcpStream>>::bind("127.0.0.1:0".parse().unwrap())
            .expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    app.register_acceptor("test", listener, "Test").expect("register acceptor");
    app.start().expect("start application");
    app.wait_running(Duration::from_secs(2)).expect("reactor running");

    (app, addr)
}

fn frame(payload: &[u8]) -> Vec<u8> {
    framing::encode(payload)
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream.set_nodelay(true).unwrap();
    stream
}

fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).expect("read length header");
    let len = i32::from_be_bytes(header) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).expect("read body");
    body
}

#[test]
fn s1_echo_round_trip() {
    let (mut app, addr) = start_app(WorkerKind::ThreadPool, 4, Duration::ZERO);
    let mut client = connect(addr);

    client.write_all(&frame(b"hello")).unwrap();
    let response = read_frame(&mut client);
    assert_eq!(response, b"hello");

    app.stop();
}

#[test]
fn s2_pipelined_requests_reply_in_order() {
    let (mut app, addr) = start_app(WorkerKind::ThreadPool, 4, Duration::ZERO);
    let mut client = connect(addr);

    let mut wire = frame(b"first");
    wire.extend(frame(b"second"));
    wire.extend(frame(b"third"));
    client.write_all(&wire).unwrap();

    assert_eq!(read_frame(&mut client), b"first");
    assert_eq!(read_frame(&mut client), b"second");
    assert_eq!(read_frame(&mut client), b"third");

    app.stop();
}

#[test]
fn s3_processor_failure_closes_connection_with_no_bytes() {
    let (mut app, addr) = start_app(WorkerKind::ThreadPool, 4, Duration::ZERO);
    let mut client = connect(addr);

    client.write_all(&frame(&[FAIL_MARKER])).unwrap();

    let mut buf = [0u8; 8];
    let n = client.read(&mut buf).expect("read after failure");
    assert_eq!(n, 0, "expected connection closed with no bytes written");

    app.stop();
}

#[test]
fn s4_invalid_length_closes_connection() {
    let (mut app, addr) = start_app(WorkerKind::ThreadPool, 4, Duration::ZERO);
    let mut client = connect(addr);

    client.write_all(&(-1i32).to_be_bytes()).unwrap();

    let mut buf = [0u8; 8];
    let n = client.read(&mut buf).expect("read after invalid length");
    assert_eq!(n, 0, "expected connection closed with no bytes written");

    app.stop();
}

#[test]
fn s5_pool_saturation_still_delivers_every_reply() {
    let (mut app, addr) = start_app(WorkerKind::ThreadPool, 1, Duration::from_millis(150));
    let mut client = connect(addr);
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let mut wire = frame(&[SLOW_MARKER]);
    wire.extend(frame(&[SLOW_MARKER]));
    wire.extend(frame(&[SLOW_MARKER]));
    client.write_all(&wire).unwrap();

    for _ in 0..3 {
        let response = read_frame(&mut client);
        assert_eq!(response, vec![SLOW_MARKER]);
    }

    std::thread::sleep(Duration::from_millis(50));
    let telemetry = app.telemetry();
    let snapshot = telemetry.lock().unwrap().counters_snapshot();
    let overflow = snapshot.get(runtime::telemetry::POOL_OVERFLOW).map(|c| c.count).unwrap_or(0);
    // concurrency crosses the pool_size=1 saturation threshold exactly once (on the
    // first of the three submissions); the second and third land while already
    // saturated and must not bump the counter again.
    assert_eq!(overflow, 1, "expected exactly one upward pool_overflow crossing, got {snapshot:?}");

    app.stop();
}

#[test]
fn s6_one_way_method_emits_nothing_but_advances_sequence() {
    let (mut app, addr) = start_app(WorkerKind::ThreadPool, 4, Duration::ZERO);
    let mut client = connect(addr);

    let mut wire = frame(&[ONE_WAY_MARKER]);
    wire.extend(frame(b"after"));
    client.write_all(&wire).unwrap();

    // only the second request produces a reply; a 200ms grace period proves the
    // one-way call did not also write a (possibly empty) frame ahead of it.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(read_frame(&mut client), b"after");

    app.stop();
}
