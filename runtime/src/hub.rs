//! The single-threaded reactor and its cross-thread callback queue (§4.1).
//!
//! Grounded in the teacher's `src/listener.rs`/`src/multilistener.rs` event loop
//! (`Poll::poll` into an `Events` buffer, dispatch by token) run on a dedicated OS
//! thread, plus a `crossbeam_channel` callback queue woken by a `mio::Waker` so other
//! threads — the worker pool, or an embedding application calling
//! `Acceptor::start`/`stop` — can schedule work on the reactor thread without it ever
//! being shared behind a lock (§5).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use mio::{Events, Poll, Token, Waker};

use crate::acceptor::{AcceptorHandle, TOKENS_PER_ACCEPTOR};
use crate::error::{LifecycleError, WaitTimeout};
use crate::task::{Task, TaskContext};

const WAKE_TOKEN: Token = Token(usize::MAX);

/// Lifecycle state of a [`Hub`] (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HubState {
    /// Constructed, not yet started.
    Init = 0,
    /// `start` has been called; the reactor thread is spinning up.
    Starting = 1,
    /// The reactor thread is polling and dispatching events.
    Running = 2,
    /// `stop` has been called; draining in-flight work before the thread exits.
    Stopping = 3,
    /// The reactor thread has exited.
    Stopped = 4,
}

impl HubState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => HubState::Init,
            1 => HubState::Starting,
            2 => HubState::Running,
            3 => HubState::Stopping,
            _ => HubState::Stopped,
        }
    }
}

/// Everything the reactor thread owns exclusively while running.
struct Reactor {
    poll: Poll,
    acceptors: BTreeMap<usize, Box<dyn AcceptorHandle>>,
    next_token_base: usize,
}

fn find_owner(
    acceptors: &mut BTreeMap<usize, Box<dyn AcceptorHandle>>,
    token: Token,
) -> Option<&mut Box<dyn AcceptorHandle>> {
    acceptors
        .range_mut(..=token.0)
        .next_back()
        .and_then(|(&base, handle)| (token.0 < base + TOKENS_PER_ACCEPTOR).then_some(handle))
}

/// By-name acceptor lookup handed to a [`Callback`].
///
/// Expressed as a trait method rather than `dyn FnMut(&str) -> Option<&mut dyn
/// AcceptorHandle>`: that closure shape would need `for<'r> FnMut(&'r str) ->
/// Option<&'r mut dyn AcceptorHandle>`, but the returned reference actually borrows
/// from the lookup's captured acceptor map, not from the `&str` argument, which no
/// closure can express via the `Fn*` traits on stable Rust. A trait method's output
/// is tied to `&mut self` instead, which matches what the implementation needs.
pub trait AcceptorLookup {
    fn find(&mut self, name: &str) -> Option<&mut (dyn AcceptorHandle + '_)>;
}

impl AcceptorLookup for BTreeMap<usize, Box<dyn AcceptorHandle>> {
    fn find(&mut self, name: &str) -> Option<&mut (dyn AcceptorHandle + '_)> {
        self.values_mut().find(|a| a.name() == name).map(|b| b.as_mut() as &mut dyn AcceptorHandle)
    }
}

/// A scheduled unit of work for the reactor thread: runs with exclusive access to
/// every registered acceptor and the poll registry (§4.1, §5).
pub type Callback = Box<dyn FnOnce(&mio::Registry, &mut dyn AcceptorLookup) + Send>;

/// Handle to a running [`Hub`], cloneable and safe to use from any thread (§4.1).
#[derive(Clone)]
pub struct HubHandle {
    sender: crossbeam_channel::Sender<Callback>,
    waker: Arc<Waker>,
    state: Arc<AtomicU8>,
}

impl std::fmt::Debug for HubHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubHandle").field("state", &self.state()).finish_non_exhaustive()
    }
}

impl HubHandle {
    /// Current lifecycle state.
    pub fn state(&self) -> HubState {
        HubState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Schedules `f` to run on the reactor thread with exclusive access to the poll
    /// registry and a by-name acceptor lookup, then wakes the reactor so it runs
    /// promptly rather than waiting for the next naturally occurring event.
    pub fn callback(
        &self,
        f: impl FnOnce(&mio::Registry, &mut dyn AcceptorLookup) + Send + 'static,
    ) -> Result<(), WaitTimeout> {
        if self.sender.send(Box::new(f)).is_err() {
            return Err(WaitTimeout { operation: "hub callback" });
        }
        self.waker.wake().map_err(|_| WaitTimeout { operation: "hub wake" })
    }
}

/// The reactor: a dedicated OS thread polling every registered acceptor's sockets and
/// draining a cross-thread callback queue (§4.1).
pub struct Hub {
    handle: HubHandle,
    receiver: Option<crossbeam_channel::Receiver<Callback>>,
    reactor: Option<Reactor>,
    join: Option<JoinHandle<()>>,
    poll_events_capacity: usize,
    shutdown_timeout: Duration,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub").field("state", &self.handle.state()).finish_non_exhaustive()
    }
}

impl Hub {
    /// Builds an unstarted hub. `poll_events_capacity` sizes the `mio::Events` buffer
    /// drained per iteration (§10.2); `shutdown_timeout` bounds how long [`Hub::stop`]
    /// waits for connections to drain before severing them (§4.3).
    pub fn new(poll_events_capacity: usize, shutdown_timeout: Duration) -> std::io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (sender, receiver) = crossbeam_channel::unbounded();
        let state = Arc::new(AtomicU8::new(HubState::Init as u8));

        Ok(Self {
            handle: HubHandle { sender, waker, state },
            receiver: Some(receiver),
            reactor: Some(Reactor { poll, acceptors: BTreeMap::new(), next_token_base: 0 }),
            join: None,
            poll_events_capacity,
            shutdown_timeout,
        })
    }

    /// A cloneable handle usable from any thread, including before `start` is called.
    pub fn handle(&self) -> HubHandle {
        self.handle.clone()
    }

    /// Spawns a cooperative task (§4.1). The task runs on its own dedicated thread,
    /// independent of whether the reactor thread is running — it must never reach
    /// back into acceptor or connection state directly; the only sanctioned way for a
    /// task to hand work to the reactor is [`HubHandle::callback`]. See [`crate::task`]
    /// for why this is backed by an OS thread rather than a true coroutine.
    pub fn spawn<T: Send + Sync + 'static>(&self, f: impl FnOnce(&TaskContext) -> T + Send + 'static) -> Task<T> {
        Task::spawn(f)
    }

    /// Reserves and returns the next disjoint token range for a to-be-registered
    /// acceptor. Must be called before [`Hub::start`] (acceptors are registered while
    /// building the hub, not after the reactor thread takes ownership).
    pub fn reserve_token_base(&mut self) -> usize {
        let reactor = self.reactor.as_mut().expect("reserve_token_base after start");
        let base = reactor.next_token_base;
        reactor.next_token_base += TOKENS_PER_ACCEPTOR;
        base
    }

    /// Registers `acceptor`'s listening socket and takes ownership of it, keyed by its
    /// reserved token base. Must be called before [`Hub::start`].
    pub fn add_acceptor(&mut self, mut acceptor: Box<dyn AcceptorHandle>) -> std::io::Result<()> {
        let reactor = self.reactor.as_mut().expect("add_acceptor after start");
        acceptor.register_listener(reactor.poll.registry())?;
        reactor.acceptors.insert(acceptor.token_base(), acceptor);
        Ok(())
    }

    /// Starts the reactor thread. `on_frame` is invoked once per completed inbound
    /// frame as `(acceptor_name, token, request_id, payload)` and returns `true` to
    /// request that the originating acceptor immediately stop accepting new
    /// connections (§4.5's saturation edge) — resuming is done separately via a
    /// [`HubHandle::callback`] once the pool desaturates. Errs if already started.
    pub fn start(
        &mut self,
        mut on_frame: impl FnMut(&str, Token, u64, Vec<u8>) -> bool + Send + 'static,
    ) -> Result<(), LifecycleError> {
        if self.handle.state() != HubState::Init {
            return Err(LifecycleError { operation: "start", state: "not Init" });
        }
        self.handle.state.store(HubState::Starting as u8, Ordering::Release);

        let mut reactor = self.reactor.take().expect("reactor already taken");
        let receiver = self.receiver.take().expect("receiver already taken");
        let state = Arc::clone(&self.handle.state);
        let events_capacity = self.poll_events_capacity;
        let shutdown_timeout = self.shutdown_timeout;

        let join = std::thread::Builder::new()
            .name("thrift-hub".into())
            .spawn(move || {
                state.store(HubState::Running as u8, Ordering::Release);
                let mut events = Events::with_capacity(events_capacity);
                let mut draining_since: Option<std::time::Instant> = None;

                loop {
                    // Once draining, poll with a short timeout rather than blocking
                    // indefinitely so the drain deadline is still checked when a
                    // slow/idle connection produces no further events.
                    let poll_timeout = draining_since.map(|_| Duration::from_millis(50));
                    if reactor.poll.poll(&mut events, poll_timeout).is_err() {
                        continue;
                    }

                    let mut woke = false;
                    for event in events.iter() {
                        if event.token() == WAKE_TOKEN {
                            woke = true;
                            continue;
                        }

                        let token = event.token();
                        let readable = event.is_readable();
                        let writable = event.is_writable();
                        let Reactor { poll, acceptors, .. } = &mut reactor;
                        let registry = poll.registry();
                        if let Some(owner) = find_owner(acceptors, token) {
                            if token.0 == owner.token_base() {
                                owner.accept_all(registry);
                            } else {
                                let name = owner.name().to_owned();
                                let mut pause_requested = false;
                                owner.dispatch(
                                    registry,
                                    token,
                                    readable,
                                    writable,
                                    &mut |tok, id, frame| {
                                        if on_frame(&name, tok, id, frame) {
                                            pause_requested = true;
                                        }
                                    },
                                );
                                if pause_requested {
                                    owner.stop_accepting(registry);
                                }
                            }
                        }
                    }

                    if woke && draining_since.is_none()
                        && HubState::from_u8(state.load(Ordering::Acquire)) == HubState::Stopping
                    {
                        let Reactor { poll, acceptors, .. } = &mut reactor;
                        let registry = poll.registry();
                        for acceptor in acceptors.values_mut() {
                            acceptor.begin_close(registry);
                        }
                        draining_since = Some(std::time::Instant::now());
                    }

                    if woke {
                        while let Ok(callback) = receiver.try_recv() {
                            let Reactor { poll, acceptors, .. } = &mut reactor;
                            let registry = poll.registry();
                            callback(registry, acceptors);
                        }
                    }

                    if let Some(since) = draining_since {
                        let Reactor { poll, acceptors, .. } = &mut reactor;
                        let registry = poll.registry();
                        if since.elapsed() >= shutdown_timeout {
                            for acceptor in acceptors.values_mut() {
                                acceptor.force_close_if_overdue(registry, Duration::ZERO);
                            }
                        }
                        if acceptors.values().all(|a| a.is_fully_closed()) {
                            break;
                        }
                    }
                }

                state.store(HubState::Stopped as u8, Ordering::Release);
            })
            .map_err(|_| LifecycleError { operation: "start", state: "thread spawn failed" })?;

        self.join = Some(join);
        Ok(())
    }

    /// Requests every acceptor begin a graceful drain and joins the reactor thread once
    /// they've all closed or `shutdown_timeout` has elapsed, whichever comes first
    /// (§4.3). Idempotent; a second call after the thread has already exited is a
    /// no-op.
    pub fn stop(&mut self) {
        if self.handle.state() == HubState::Init || self.handle.state() == HubState::Stopped {
            return;
        }
        self.handle.state.store(HubState::Stopping as u8, Ordering::Release);
        let _ = self.handle.waker.wake();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    /// Blocks until the hub reaches [`HubState::Running`] or `timeout` elapses.
    pub fn wait_running(&self, timeout: Duration) -> Result<(), WaitTimeout> {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if self.handle.state() == HubState::Running {
                return Ok(());
            }
            std::thread::yield_now();
        }
        Err(WaitTimeout { operation: "hub start" })
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_runs_independently_of_reactor_state() {
        let hub = Hub::new(16, Duration::from_millis(100)).unwrap();
        // never started: a Task must not depend on the reactor thread to run.
        let task = hub.spawn(|_ctx| 1 + 1);
        assert!(matches!(&*task.get(), Ok(2)));
    }

    #[test]
    fn spawn_task_can_be_killed_mid_sleep() {
        let hub = Hub::new(16, Duration::from_millis(100)).unwrap();
        let task: Task<()> = hub.spawn(|ctx| {
            let _ = ctx.sleep(Duration::from_secs(30));
        });
        std::thread::sleep(Duration::from_millis(20));
        task.kill();
        assert!(matches!(&*task.get(), Err(crate::task::TaskError::Cancelled)));
    }
}
