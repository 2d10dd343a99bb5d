//! Error taxonomy for the runtime (§7 of the design).
//!
//! Following the teacher crate's own idiom, these are hand-written enums with manual
//! `Display`/`Error` impls rather than a derive macro — there just aren't many of them,
//! and the fields vary enough that a derive would buy little.

use std::fmt::{self, Display};
use std::net::SocketAddr;

/// No candidate address could be bound.
#[derive(Debug)]
pub struct BindError {
    /// Addresses that were attempted, in order.
    pub attempted: Vec<SocketAddr>,
    /// The I/O error returned for the last attempt.
    pub last_error: std::io::Error,
}

impl Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "could not bind any of {} candidate address(es), last error: {}",
            self.attempted.len(),
            self.last_error
        )
    }
}

impl std::error::Error for BindError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.last_error)
    }
}

/// A bounded resource (e.g. a configured address pool) was exhausted.
#[derive(Debug, Clone)]
pub struct AllocationError {
    /// What kind of resource was exhausted.
    pub resource: &'static str,
}

impl Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} pool exhausted", self.resource)
    }
}

impl std::error::Error for AllocationError {}

/// A service name was registered more than once.
#[derive(Debug, Clone)]
pub struct ServiceAlreadyRegistered(pub String);

impl Display for ServiceAlreadyRegistered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service {:?} is already registered", self.0)
    }
}

impl std::error::Error for ServiceAlreadyRegistered {}

/// An acceptor name was registered more than once.
#[derive(Debug, Clone)]
pub struct AcceptorAlreadyRegistered(pub String);

impl Display for AcceptorAlreadyRegistered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "acceptor {:?} is already registered", self.0)
    }
}

impl std::error::Error for AcceptorAlreadyRegistered {}

/// A cross-thread delegation into the hub did not complete before its timeout.
#[derive(Debug, Clone)]
pub struct WaitTimeout {
    /// What operation timed out, for diagnostics.
    pub operation: &'static str,
}

impl Display for WaitTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timed out waiting for {} to complete on the reactor", self.operation)
    }
}

impl std::error::Error for WaitTimeout {}

/// A lifecycle method was called in a state that does not support it (e.g. `stop`
/// before `start`, or `start` on an already-running hub).
#[derive(Debug, Clone)]
pub struct LifecycleError {
    /// The operation that was attempted.
    pub operation: &'static str,
    /// The state the component was actually in.
    pub state: &'static str,
}

impl Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot {} while in state {}", self.operation, self.state)
    }
}

impl std::error::Error for LifecycleError {}
