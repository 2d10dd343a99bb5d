//! Typed startup configuration (§10.2).
//!
//! The teacher crate hardcodes its equivalents (`num_events = 1024` in
//! `src/listener.rs`, a fixed 16KB buffer in `server/src/sessions.rs`). Those same
//! knobs are collected here into one `Default`-able struct so an embedding binary can
//! size the runtime without editing source. Loading this from a file or environment is
//! explicitly out of scope (§1) — construct it in code.

use std::time::Duration;

/// How the worker pool executes processor tasks (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// Run every task on the reactor thread itself. Mainly useful for tests and
    /// debugging; a slow processor will stall the whole reactor.
    Inline,
    /// Run tasks on a bounded pool of OS threads (the default).
    ThreadPool,
}

/// Startup configuration for a [`crate::app::Application`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of workers when `worker_kind` is [`WorkerKind::ThreadPool`].
    pub worker_pool_size: usize,
    /// Execution model for the worker pool.
    pub worker_kind: WorkerKind,
    /// Hard cap on a single inbound frame's payload size (§4.2).
    pub max_frame_size: usize,
    /// Initial capacity of a connection's read buffer, in bytes.
    pub read_buffer_capacity: usize,
    /// How long [`crate::hub::Hub::stop`] waits for connections to drain before
    /// force-closing them (§4.3).
    pub shutdown_timeout: Duration,
    /// How long a cross-thread call into the hub (e.g. `Acceptor::start` from outside
    /// the reactor) waits before failing with [`crate::error::WaitTimeout`] (§4.1).
    pub hub_call_timeout: Duration,
    /// Backlog passed to `listen()` for newly bound acceptors.
    pub listen_backlog: u32,
    /// Capacity of the mio `Events` buffer drained per reactor iteration.
    pub poll_events_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            worker_kind: WorkerKind::ThreadPool,
            max_frame_size: framing::DEFAULT_MAX_FRAME_SIZE,
            read_buffer_capacity: 16 * 1024,
            shutdown_timeout: Duration::from_secs(5),
            hub_call_timeout: Duration::from_secs(5),
            listen_backlog: 1024,
            poll_events_capacity: 1024,
        }
    }
}
