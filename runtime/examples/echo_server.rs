//! Hosts a single `Echo` service on `127.0.0.1:9090` until killed.

use std::net::SocketAddr;
use std::sync::Arc;

use runtime::app::Application;
use runtime::config::RuntimeConfig;
use runtime::net::TcpListenerLike;
use runtime::services::{ProcessResult, Processor, Service};

struct Echo;

impl Processor for Echo {
    fn process(&self, request: &[u8]) -> ProcessResult {
        ProcessResult::ok(request.to_vec())
    }

    fn method_name(&self, _request: &[u8]) -> &'static str {
        "echo"
    }
}

fn main() {
    env_logger::init();

    let addr: SocketAddr = "127.0.0.1:9090".parse().unwrap();
    let listener = <mio::net::TcpListener as TcpListenerLike<mio::net::TcpStream>>::bind(addr)
        .expect("bind echo server");

    let mut app = Application::new(RuntimeConfig::default()).expect("create application");
    app.register_service(Service::new("Echo", Arc::new(Echo))).expect("register service");
    app.register_acceptor("echo", listener, "Echo").expect("register acceptor");
    app.start().expect("start application");

    log::info!("echo server listening on {addr}");

    // The reactor runs on its own thread; park the main thread rather than exit.
    loop {
        std::thread::park();
    }
}
