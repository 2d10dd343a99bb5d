//! Processors and the service registry (§4.4).
//!
//! Grounded in `original_source/thriftworker/worker.py`'s three-stage pipeline
//! (`create_producer`/`create_consumer`/`create_callback`): the producer is
//! [`crate::connection::Connection::on_readable`], the consumer is
//! [`Processor::process`] run off-reactor by [`crate::worker::WorkerPool`], and the
//! callback is [`crate::acceptor::Acceptor::deliver_reply`] invoked back on the reactor
//! thread through [`crate::hub::Hub::callback`].

use std::sync::Arc;

/// Outcome of running one request through a [`Processor`] (§4.4).
///
/// `success = false` corresponds to the framework-level failure path (§4.2, §7): the
/// connection is closed with no bytes written for this request, regardless of
/// whatever is in `response`.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    /// Whether the processor completed without a framework-level error.
    pub success: bool,
    /// The serialized response payload. Empty for one-way methods or a failed call.
    pub response: Vec<u8>,
}

impl ProcessResult {
    /// A successful result carrying `response`.
    pub fn ok(response: Vec<u8>) -> Self {
        Self { success: true, response }
    }

    /// A one-way call's result: no bytes are ever written for it (§4.2).
    pub fn one_way() -> Self {
        Self { success: true, response: Vec::new() }
    }

    /// The framework-level failure outcome: the connection is closed silently (§11).
    pub fn failed() -> Self {
        Self { success: false, response: Vec::new() }
    }
}

/// Decodes and dispatches one request frame's payload, synchronously (§4.4).
///
/// Implementations are run on worker threads (or inline, per
/// [`crate::config::WorkerKind`]) and must not assume anything about which thread
/// calls them beyond "not the reactor thread" — they may be called concurrently from
/// multiple workers for different requests on the same service.
pub trait Processor: Send + Sync {
    /// Processes one request frame's raw payload and returns the result to send back.
    fn process(&self, request: &[u8]) -> ProcessResult;

    /// The method name this request is addressed to, if it can be determined without
    /// fully processing the request. Used only for per-method telemetry keys (§6); the
    /// default of `"unknown"` is always safe.
    fn method_name(&self, _request: &[u8]) -> &'static str {
        "unknown"
    }
}

/// A named, registered processor (§4.4: "Names used by the core").
#[derive(Clone)]
pub struct Service {
    name: String,
    processor: Arc<dyn Processor>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Service {
    /// Wraps `processor` under `name`.
    pub fn new(name: impl Into<String>, processor: Arc<dyn Processor>) -> Self {
        Self { name: name.into(), processor }
    }

    /// This service's registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the wrapped processor.
    pub fn process(&self, request: &[u8]) -> ProcessResult {
        self.processor.process(request)
    }

    /// The wrapped processor's best-effort method name for telemetry keys.
    pub fn method_name(&self, request: &[u8]) -> &'static str {
        self.processor.method_name(request)
    }
}

/// The set of services an [`crate::app::Application`] can dispatch to, keyed by name
/// (§4.4, §6). Each registered [`crate::acceptor::Acceptor`] names exactly one of
/// these to handle the connections it accepts.
#[derive(Debug, Default)]
pub struct ServicesRegistry {
    services: Vec<Service>,
}

impl ServicesRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `service`. Errs if its name is already taken (§4.4).
    pub fn register(
        &mut self,
        service: Service,
    ) -> Result<(), crate::error::ServiceAlreadyRegistered> {
        if self.services.iter().any(|s| s.name() == service.name()) {
            return Err(crate::error::ServiceAlreadyRegistered(service.name().to_owned()));
        }
        self.services.push(service);
        Ok(())
    }

    /// Looks up a registered service by name.
    pub fn get(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;
    impl Processor for Echo {
        fn process(&self, request: &[u8]) -> ProcessResult {
            ProcessResult::ok(request.to_vec())
        }
    }

    #[test]
    fn rejects_duplicate_service_names() {
        let mut reg = ServicesRegistry::new();
        reg.register(Service::new("Echo", Arc::new(Echo))).unwrap();
        let err = reg.register(Service::new("Echo", Arc::new(Echo))).unwrap_err();
        assert_eq!(err.0, "Echo");
    }

    #[test]
    fn looks_up_by_name() {
        let mut reg = ServicesRegistry::new();
        reg.register(Service::new("Echo", Arc::new(Echo))).unwrap();
        assert!(reg.get("Echo").is_some());
        assert!(reg.get("Other").is_none());
    }
}
