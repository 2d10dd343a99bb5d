//! Cooperative task handles layered on the hub (§4.1's `spawn`/`wait`/`sleep`
//! contract).
//!
//! §9's own design note resolves this: "model as explicit continuation callbacks
//! attached to watchers, or tasks backed by a small dedicated thread pool that block
//! only at `wait`/`sleep` points." Rust has no stackful coroutine in `std`, so each
//! [`Task`] here runs its closure on a dedicated OS thread rather than a greenlet; the
//! closure may only suspend by calling [`TaskContext::sleep`] or
//! [`TaskContext::wait`], both of which poll a cancellation flag on every wakeup so a
//! [`Task::kill`] is observed at the next suspension point, mirroring §4.1's
//! cancellation rule. Completion links ([`Task::rawlink`]) run on whichever thread
//! notices the task finish — its own task thread, or the caller's thread if it had
//! already finished — never on the reactor thread, since a task's body must not touch
//! acceptor/connection state directly (§5).
//!
//! One divergence from §4.1 that a greenlet-based loop enforces and an OS thread
//! cannot: nothing stops a task closure from blocking on something other than
//! `sleep`/`wait`. That invariant is a convention here, not something this module
//! can verify.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Why a task produced no value.
#[derive(Debug, Clone)]
pub enum TaskError {
    /// [`Task::kill`] was called before the closure finished.
    Cancelled,
    /// The closure panicked; the payload is rendered as a string where possible.
    Panicked(String),
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::Cancelled => write!(f, "task was killed"),
            TaskError::Panicked(msg) => write!(f, "task panicked: {msg}"),
        }
    }
}

impl std::error::Error for TaskError {}

type Link<T> = Box<dyn FnOnce(&Result<T, TaskError>) + Send>;

enum TaskState<T> {
    Pending(Vec<Link<T>>),
    Done(Arc<Result<T, TaskError>>),
}

struct Inner<T> {
    cancel: Arc<AtomicBool>,
    state: Mutex<TaskState<T>>,
    condvar: Condvar,
}

/// Suspension primitives available inside a task body (§4.1, §5).
///
/// A [`TaskContext`] is handed to the closure passed to [`Task::spawn`]; it is the
/// only sanctioned way for that closure to block.
#[derive(Debug, Clone)]
pub struct TaskContext {
    cancel: Arc<AtomicBool>,
}

impl TaskContext {
    /// True once [`Task::kill`] has been called for this task.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Suspends for `duration`, waking early with `Err(TaskError::Cancelled)` if
    /// killed in the meantime (§4.1's `sleep`). A zero or negative duration yields
    /// once without otherwise blocking.
    pub fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
        if self.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(20)));
            if self.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
        }
    }

    /// Blocks until `watcher` delivers exactly one value on the sender it is handed,
    /// or the task is killed (§4.1's `wait(watcher)`). `watcher` runs on its own
    /// thread so a slow producer cannot itself dodge cancellation.
    pub fn wait<U: Send + 'static>(
        &self,
        watcher: impl FnOnce(std::sync::mpsc::Sender<U>) + Send + 'static,
    ) -> Result<U, TaskError> {
        if self.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        let (tx, rx) = std::sync::mpsc::channel();
        let _ = std::thread::Builder::new().name("thrift-task-watcher".into()).spawn(move || watcher(tx));
        loop {
            match rx.recv_timeout(Duration::from_millis(20)) {
                Ok(value) => return Ok(value),
                Err(RecvTimeoutError::Timeout) => {
                    if self.is_cancelled() {
                        return Err(TaskError::Cancelled);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(TaskError::Cancelled),
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// A handle to a task spawned with [`Task::spawn`] (§4.1).
///
/// Dropping a `Task` detaches its thread; it is not joined automatically. Call
/// [`Task::join`] or [`Task::get`] first if the caller needs to know the task has
/// actually finished.
pub struct Task<T> {
    inner: Arc<Inner<T>>,
    cancel: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> Task<T> {
    /// Spawns `f` on a dedicated thread, handing it a [`TaskContext`] for suspension
    /// (§4.1's `spawn`). Unlike the distilled loop, the task begins running
    /// immediately rather than waiting for "the next loop iteration" — there is no
    /// loop iteration to wait for once suspension is backed by real OS threads.
    pub fn spawn(f: impl FnOnce(&TaskContext) -> T + Send + 'static) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let inner = Arc::new(Inner {
            cancel: Arc::clone(&cancel),
            state: Mutex::new(TaskState::Pending(Vec::new())),
            condvar: Condvar::new(),
        });

        let inner_for_thread = Arc::clone(&inner);
        let ctx = TaskContext { cancel: Arc::clone(&cancel) };
        let handle = std::thread::Builder::new()
            .name("thrift-task".into())
            .spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&ctx)));
                let outcome = match result {
                    Ok(_) if ctx.is_cancelled() => Err(TaskError::Cancelled),
                    Ok(value) => Ok(value),
                    Err(payload) => Err(TaskError::Panicked(panic_message(&*payload))),
                };
                finish(&inner_for_thread, outcome);
            })
            .expect("failed to spawn task thread");

        Self { inner, cancel, handle: Some(handle) }
    }

    /// Blocks until the task completes, discarding its result.
    pub fn join(&self) {
        let guard = self.inner.state.lock().unwrap();
        let _ = self.inner.condvar.wait_while(guard, |s| matches!(s, TaskState::Pending(_)));
    }

    /// Blocks until the task completes and returns its outcome (§4.1's `get`, which
    /// "raises stored error" — here that is the `Err` variant rather than a panic).
    pub fn get(&self) -> Arc<Result<T, TaskError>> {
        let guard = self.inner.state.lock().unwrap();
        let guard = self.inner.condvar.wait_while(guard, |s| matches!(s, TaskState::Pending(_))).unwrap();
        match &*guard {
            TaskState::Done(outcome) => Arc::clone(outcome),
            TaskState::Pending(_) => unreachable!("wait_while only returns once Done"),
        }
    }

    /// Requests cancellation (§4.1's `Task.kill`). Cooperative: takes effect the next
    /// time the task's closure calls [`TaskContext::sleep`] or [`TaskContext::wait`],
    /// or immediately if it has already returned.
    pub fn kill(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Registers `cb` to run with the task's outcome once it completes. Runs
    /// immediately, inline, if the task has already finished (§4.1: "if the task has
    /// never run [i.e. already resolved before linking], it is discarded with its
    /// completion links still notified as if it raised").
    pub fn rawlink(&self, cb: impl FnOnce(&Result<T, TaskError>) + Send + 'static) {
        let mut guard = self.inner.state.lock().unwrap();
        match &mut *guard {
            TaskState::Pending(links) => links.push(Box::new(cb)),
            TaskState::Done(outcome) => {
                let outcome = Arc::clone(outcome);
                drop(guard);
                cb(&outcome);
            }
        }
    }
}

fn finish<T>(inner: &Inner<T>, outcome: Result<T, TaskError>) {
    let outcome = Arc::new(outcome);
    let links = {
        let mut guard = inner.state.lock().unwrap();
        match std::mem::replace(&mut *guard, TaskState::Done(Arc::clone(&outcome))) {
            TaskState::Pending(links) => links,
            TaskState::Done(_) => Vec::new(),
        }
    };
    inner.condvar.notify_all();
    for link in links {
        link(&outcome);
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        self.handle.take();
    }
}
