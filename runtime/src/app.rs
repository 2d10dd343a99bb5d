//! Public entry point wiring the hub, acceptors, services, and worker pool together
//! (§6).
//!
//! Grounded in the teacher's `server/src/lib.rs`, which assembles a `Listener` and a
//! fixed set of `Worker`s behind a small builder-style API. This generalizes that
//! assembly to multiple named acceptors routed to multiple named services sharing one
//! worker pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use mio::Token;

use crate::acceptor::{Acceptor, DeliverOutcome};
use crate::config::RuntimeConfig;
use crate::error::{AcceptorAlreadyRegistered, LifecycleError, ServiceAlreadyRegistered};
use crate::hub::{Hub, HubHandle};
use crate::net::{TcpListenerLike, TcpStreamLike};
use crate::services::{Service, ServicesRegistry};
use crate::telemetry::{TelemetryRegistry, POOL_OVERFLOW, RESPONSE_SERVED};
use crate::worker::{Job, WorkerPool};

/// Hosts one or more Thrift services behind a shared reactor and worker pool (§6).
///
/// Acceptors must be registered before [`Application::start`]; after that the hub
/// owns them on its own thread and further changes happen only through
/// [`HubHandle::callback`].
pub struct Application {
    config: RuntimeConfig,
    hub: Hub,
    services: ServicesRegistry,
    acceptor_service: HashMap<String, Service>,
    telemetry: Arc<Mutex<TelemetryRegistry>>,
    worker_pool: Option<Arc<WorkerPool>>,
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("acceptors", &self.acceptor_service.keys().collect::<Vec<_>>())
            .field("hub_state", &self.hub.handle().state())
            .finish_non_exhaustive()
    }
}

impl Application {
    /// Builds an unstarted application.
    pub fn new(config: RuntimeConfig) -> std::io::Result<Self> {
        let hub = Hub::new(config.poll_events_capacity, config.shutdown_timeout)?;
        Ok(Self {
            config,
            hub,
            services: ServicesRegistry::new(),
            acceptor_service: HashMap::new(),
            telemetry: Arc::new(Mutex::new(TelemetryRegistry::new())),
            worker_pool: None,
        })
    }

    /// Registers `service`. Must be called before any acceptor names it (§4.4).
    pub fn register_service(&mut self, service: Service) -> Result<(), ServiceAlreadyRegistered> {
        self.services.register(service)
    }

    /// Registers a listening socket under `name`, routing every request it accepts to
    /// the previously registered service `service_name` (§4.3, §4.4). Must be called
    /// before [`Application::start`].
    pub fn register_acceptor<T, S>(
        &mut self,
        name: impl Into<String>,
        listener: T,
        service_name: &str,
    ) -> Result<(), AcceptorAlreadyRegistered>
    where
        T: TcpListenerLike<S> + Send + 'static + std::fmt::Debug,
        S: TcpStreamLike + 'static + std::fmt::Debug,
    {
        let name = name.into();
        if self.acceptor_service.contains_key(&name) {
            return Err(AcceptorAlreadyRegistered(name));
        }
        let Some(service) = self.services.get(service_name) else {
            return Err(AcceptorAlreadyRegistered(format!(
                "{name} (unknown service {service_name:?})"
            )));
        };
        self.acceptor_service.insert(name.clone(), service.clone());

        let base = self.hub.reserve_token_base();
        let acceptor = Acceptor::new(name, listener, self.config.max_frame_size, base);
        self.hub.add_acceptor(Box::new(acceptor)).expect("registering acceptor listener");
        Ok(())
    }

    /// A cloneable handle to the reactor, usable once [`Application::start`] has been
    /// called.
    pub fn hub_handle(&self) -> HubHandle {
        self.hub.handle()
    }

    /// Blocks until the reactor thread is up and polling, or `timeout` elapses.
    pub fn wait_running(&self, timeout: std::time::Duration) -> Result<(), crate::error::WaitTimeout> {
        self.hub.wait_running(timeout)
    }

    /// A thread-safe snapshot view of the telemetry registry (§6).
    pub fn telemetry(&self) -> Arc<Mutex<TelemetryRegistry>> {
        Arc::clone(&self.telemetry)
    }

    /// Starts the worker pool and the reactor thread (§4.1, §4.5).
    pub fn start(&mut self) -> Result<(), LifecycleError> {
        let hub_handle = self.hub.handle();
        let telemetry_for_results = Arc::clone(&self.telemetry);

        let worker_pool = Arc::new(WorkerPool::new(
            self.config.worker_kind,
            self.config.worker_pool_size,
            move |result| {
                let acceptor = result.acceptor.clone();
                let desaturated = result.pool_desaturated;
                let telemetry = Arc::clone(&telemetry_for_results);
                let _ = hub_handle.callback(move |registry, lookup| {
                    if let Some(handle) = lookup.find(&acceptor) {
                        let outcome = handle.deliver_reply(
                            registry,
                            result.token,
                            result.request_id,
                            result.success,
                            result.response,
                        );

                        // Request accounting on the reactor callback (§4.5): only a
                        // reply actually delivered to a still-ready connection counts
                        // as served; a reply that arrives after the connection began
                        // closing is recorded as dispatch-late instead, unless it was
                        // a one-way call that never had anything to deliver.
                        match outcome {
                            DeliverOutcome::Delivered { success: true } => {
                                let key = format!("{}::{}", result.service_name, result.method);
                                let mut telemetry = telemetry.lock().unwrap();
                                telemetry.counter(RESPONSE_SERVED).increment();
                                telemetry.timer(&key).add(result.execution_time.as_secs_f64());
                            }
                            DeliverOutcome::Delivered { success: false } => {}
                            DeliverOutcome::Late { success: true, response_empty: false } => {
                                let key = format!("{}::{}", result.service_name, result.method);
                                telemetry
                                    .lock()
                                    .unwrap()
                                    .timeout_timer(&key)
                                    .add(result.dispatch_latency.as_secs_f64());
                                log::warn!(
                                    "{key}: response for request {} arrived after its connection had already begun closing",
                                    result.request_id
                                );
                            }
                            DeliverOutcome::Late { .. } | DeliverOutcome::NoSuchConnection => {}
                        }

                        if desaturated {
                            handle.start_accepting(registry);
                        }
                    }
                });
            },
        ));
        self.worker_pool = Some(Arc::clone(&worker_pool));

        let acceptor_service = self.acceptor_service.clone();
        let telemetry_for_overflow = Arc::clone(&self.telemetry);

        self.hub.start(move |acceptor_name: &str, token: Token, request_id: u64, frame: Vec<u8>| {
            let Some(service) = acceptor_service.get(acceptor_name) else { return false };
            let job = Job {
                acceptor: acceptor_name.to_owned(),
                token,
                request_id,
                service: service.clone(),
                frame,
                enqueued_at: Instant::now(),
            };
            let outcome = worker_pool.submit(job);
            if outcome.pool_saturated {
                telemetry_for_overflow.lock().unwrap().counter(POOL_OVERFLOW).increment();
            }
            outcome.pool_saturated
        })
    }

    /// Stops the reactor thread and joins the worker pool, waiting up to
    /// `config.shutdown_timeout` for connections to drain gracefully first (§4.3).
    pub fn stop(&mut self) {
        self.hub.stop();
        if let Some(pool) = self.worker_pool.take() {
            if let Ok(mut pool) = Arc::try_unwrap(pool).map_err(|_| ()) {
                pool.stop();
            }
        }
    }
}

impl Drop for Application {
    fn drop(&mut self) {
        self.stop();
    }
}
