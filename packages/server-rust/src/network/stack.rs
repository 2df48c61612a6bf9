//! The network stack: binds services to transport listeners and arbitrates
//! port ownership.
//!
//! One [`NetworkStack`] is built by the composition root and shared as an
//! `Arc`. It owns the api registry, the middleware pipeline and the session
//! store, and hands them to services through [`ServiceContext`].
//!
//! Binding follows a claim-then-bind order: a requested port is claimed in
//! the reservation table first, then bound. Port 0 binds first and records
//! the port the OS picked. Unbinding runs the reverse: stop accepting, close
//! push peers, wait for in-flight work up to the drain timeout, abort what is
//! left, then release the reservation.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::Router;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use switchyard_core::{ApiCall, DescriptorError, LogLevel, LogSink, TransportBinding, TransportType};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;

use super::access_log::{access_log_layer, AccessLog};
use super::config::{NetworkConfig, PortSharing};
use super::connection::PeerRegistry;
use super::handlers::{dispatch_handler, serve_stream, ws_upgrade_handler, PushState, RequestState};
use super::middleware::{build_http_layers, strip_cache_validators};
use super::reservation::{Claim, PortReservation, ReservationTable};
use super::session::{session_layer, SessionStore};
use super::shutdown::DrainController;
use crate::service::api::{ApiHandler, ApiRegistry};
use crate::service::container::ServiceContext;
use crate::service::middleware::MiddlewarePipeline;
use crate::traits::{MeshService, ServiceId};

// ---------------------------------------------------------------------------
// Errors and reports
// ---------------------------------------------------------------------------

/// Why a service or one of its transports could not be bound.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("service namespace {0} is already active")]
    DuplicateNamespace(String),

    #[error("service namespace {0} is not active")]
    UnknownNamespace(String),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error("port {port} is reserved by service {owner}")]
    PortTaken { port: u16, owner: String },

    #[error("{transport} listener labelled {label} is already bound for {namespace}")]
    DuplicateListener {
        namespace: String,
        transport: TransportType,
        label: String,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("api node for {0} could not be registered")]
    ApiNode(String),
}

/// A listener that is up, or a transport attached to a shared port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoundListener {
    pub transport: TransportType,
    pub label: String,
    /// Port actually bound; `None` for in-process bindings.
    pub port: Option<u16>,
    /// Attached to a port this service already listens on; no new bind.
    pub shared: bool,
}

/// Result of binding one transport entry.
#[derive(Debug)]
pub struct ListenerOutcome {
    pub transport: TransportType,
    pub label: String,
    pub result: Result<BoundListener, NetworkError>,
}

/// Per-entry report of [`NetworkStack::register_service`].
#[derive(Debug)]
pub struct ServiceRegistration {
    pub namespace: String,
    pub service_id: ServiceId,
    pub outcomes: Vec<ListenerOutcome>,
}

impl ServiceRegistration {
    /// True when every transport entry bound.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    #[must_use]
    pub fn bound(&self) -> Vec<&BoundListener> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().ok()).collect()
    }

    #[must_use]
    pub fn failures(&self) -> Vec<(TransportType, &NetworkError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.transport, e)))
            .collect()
    }

    /// Bound port of `transport`, if it bound to one.
    #[must_use]
    pub fn port_of(&self, transport: TransportType) -> Option<u16> {
        self.bound()
            .into_iter()
            .find(|b| b.transport == transport)
            .and_then(|b| b.port)
    }
}

// ---------------------------------------------------------------------------
// Active state
// ---------------------------------------------------------------------------

struct ActiveListener {
    bound: BoundListener,
    drain: Arc<DrainController>,
    task: Option<JoinHandle<()>>,
    peers: Option<Arc<PeerRegistry>>,
}

impl ActiveListener {
    fn detached(bound: BoundListener) -> Self {
        Self {
            bound,
            drain: Arc::new(DrainController::new()),
            task: None,
            peers: None,
        }
    }
}

struct ActiveService {
    id: ServiceId,
    listeners: Vec<ActiveListener>,
}

// ---------------------------------------------------------------------------
// NetworkStack
// ---------------------------------------------------------------------------

pub struct NetworkStack {
    config: Arc<NetworkConfig>,
    log: Arc<dyn LogSink>,
    middleware: Arc<MiddlewarePipeline>,
    api: Arc<ApiRegistry>,
    sessions: Arc<SessionStore>,
    reservations: ReservationTable,
    services: DashMap<String, ActiveService>,
    /// Activation order, for reverse-order shutdown.
    order: Mutex<Vec<String>>,
    next_id: AtomicU64,
}

impl NetworkStack {
    #[must_use]
    pub fn new(config: NetworkConfig, log: Arc<dyn LogSink>) -> Arc<Self> {
        let middleware = Arc::new(MiddlewarePipeline::new(Arc::clone(&log)));
        let api = Arc::new(ApiRegistry::new(Arc::clone(&middleware), Arc::clone(&log)));
        let sessions = Arc::new(SessionStore::new(config.session_cookie.clone(), config.session_ttl));
        Arc::new(Self {
            config: Arc::new(config),
            log,
            middleware,
            api,
            sessions,
            reservations: ReservationTable::new(),
            services: DashMap::new(),
            order: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    #[must_use]
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    #[must_use]
    pub fn api(&self) -> Arc<ApiRegistry> {
        Arc::clone(&self.api)
    }

    #[must_use]
    pub fn middleware(&self) -> Arc<MiddlewarePipeline> {
        Arc::clone(&self.middleware)
    }

    #[must_use]
    pub fn sessions(&self) -> Arc<SessionStore> {
        Arc::clone(&self.sessions)
    }

    #[must_use]
    pub fn log(&self) -> Arc<dyn LogSink> {
        Arc::clone(&self.log)
    }

    /// Collaborators handed to services on init.
    #[must_use]
    pub fn context(&self) -> ServiceContext {
        ServiceContext {
            api: self.api(),
            middleware: self.middleware(),
            sessions: self.sessions(),
            log: self.log(),
            config: Arc::clone(&self.config),
        }
    }

    // -- service registration ------------------------------------------------

    /// Binds every transport of `service`. True only if all of them bound.
    pub async fn add_service(&self, service: Arc<dyn MeshService>) -> bool {
        match self.register_service(service).await {
            Ok(registration) => registration.is_complete(),
            Err(_) => false,
        }
    }

    /// Binds every transport of `service`, reporting each entry.
    ///
    /// One failing entry does not stop the others.
    ///
    /// # Errors
    ///
    /// [`NetworkError::Descriptor`] for an invalid descriptor and
    /// [`NetworkError::DuplicateNamespace`] when the namespace is active.
    pub async fn register_service(&self, service: Arc<dyn MeshService>) -> Result<ServiceRegistration, NetworkError> {
        let namespace = service.namespace().to_string();
        if let Err(err) = service.descriptor().validate() {
            self.log.log(
                "Network:addService",
                LogLevel::ClientFault,
                &format!("Invalid service descriptor: {err}"),
                Some(&json!({ "namespace": namespace })),
                None,
            );
            return Err(err.into());
        }

        let Some(service_id) = self.activate(&namespace) else {
            self.log.log(
                "Network:addService",
                LogLevel::ClientFault,
                &format!("Unable to add service. A service with namespace {namespace} is already active"),
                Some(&json!({ "namespace": namespace })),
                None,
            );
            return Err(NetworkError::DuplicateNamespace(namespace));
        };

        let specs = service.descriptor().transports.clone();
        let mut outcomes = Vec::with_capacity(specs.len());
        for spec in specs {
            let label = spec.transport.as_str();
            let result = self
                .bind(&namespace, service_id, &service, spec.transport, label, spec.port, &[])
                .await;
            outcomes.push(ListenerOutcome {
                transport: spec.transport,
                label: label.to_string(),
                result,
            });
        }

        let registration = ServiceRegistration {
            namespace: namespace.clone(),
            service_id,
            outcomes,
        };
        let (level, verdict) = if registration.is_complete() {
            (LogLevel::Info, "bound")
        } else {
            (LogLevel::Warning, "partially bound")
        };
        let failed: Vec<Value> = registration
            .failures()
            .into_iter()
            .map(|(transport, err)| json!({ "transport": transport, "error": err.to_string() }))
            .collect();
        self.log.log(
            "Network:addService",
            level,
            &format!("Service {namespace} {verdict}"),
            Some(&json!({
                "namespace": namespace,
                "serviceId": service_id.0,
                "bound": registration.bound(),
                "failed": failed,
            })),
            None,
        );
        Ok(registration)
    }

    /// Binds one transport of `service` under `label`.
    ///
    /// `channels` names extra middleware channels threaded around each
    /// request on request/response listeners. Unknown channel names are
    /// skipped with a warning.
    pub async fn add(
        &self,
        service: &Arc<dyn MeshService>,
        transport: TransportType,
        label: &str,
        port: Option<u16>,
        channels: &[&str],
    ) -> bool {
        self.try_add(service, transport, label, port, channels).await.is_ok()
    }

    /// [`NetworkStack::add`] with the failure reason.
    ///
    /// # Errors
    ///
    /// Any [`NetworkError`] raised while claiming, binding or registering.
    pub async fn try_add(
        &self,
        service: &Arc<dyn MeshService>,
        transport: TransportType,
        label: &str,
        port: Option<u16>,
        channels: &[&str],
    ) -> Result<BoundListener, NetworkError> {
        let namespace = service.namespace().to_string();
        let service_id = match self.service_id(&namespace) {
            Some(id) => id,
            None => self
                .activate(&namespace)
                .or_else(|| self.service_id(&namespace))
                .ok_or_else(|| NetworkError::UnknownNamespace(namespace.clone()))?,
        };
        self.bind(&namespace, service_id, service, transport, label, port, channels)
            .await
    }

    // -- reservations ---------------------------------------------------------

    #[must_use]
    pub fn is_port_reserved(&self, port: u16) -> bool {
        self.reservations.is_reserved(port)
    }

    /// Reserves `port` for `namespace` ahead of any bind.
    pub fn add_port_reservation(&self, namespace: &str, port: u16) -> bool {
        let reserved = self.reservations.reserve(namespace, port);
        if !reserved {
            self.log.log(
                "Network:addPortReservation",
                LogLevel::ClientFault,
                &format!("Port {port} is already reserved by another service"),
                Some(&json!({ "namespace": namespace, "port": port, "owner": self.reservations.owner(port) })),
                None,
            );
        }
        reserved
    }

    #[must_use]
    pub fn port_owner(&self, port: u16) -> Option<String> {
        self.reservations.owner(port)
    }

    #[must_use]
    pub fn reservations(&self) -> Vec<PortReservation> {
        self.reservations.all()
    }

    // -- lookups --------------------------------------------------------------

    #[must_use]
    pub fn is_active(&self, namespace: &str) -> bool {
        self.services.contains_key(namespace)
    }

    #[must_use]
    pub fn service_id(&self, namespace: &str) -> Option<ServiceId> {
        self.services.get(namespace).map(|s| s.id)
    }

    /// Active namespaces in activation order.
    #[must_use]
    pub fn namespaces(&self) -> Vec<String> {
        self.order.lock().clone()
    }

    #[must_use]
    pub fn bound(&self, namespace: &str) -> Vec<BoundListener> {
        self.services
            .get(namespace)
            .map(|s| s.listeners.iter().map(|l| l.bound.clone()).collect())
            .unwrap_or_default()
    }

    /// Port of the first listener of `transport` for `namespace`.
    #[must_use]
    pub fn port_of(&self, namespace: &str, transport: TransportType) -> Option<u16> {
        self.bound(namespace)
            .into_iter()
            .find(|b| b.transport == transport)
            .and_then(|b| b.port)
    }

    /// Peers of the first push-socket listener of `namespace`.
    #[must_use]
    pub fn peers(&self, namespace: &str) -> Option<Arc<PeerRegistry>> {
        self.services
            .get(namespace)
            .and_then(|s| s.listeners.iter().find_map(|l| l.peers.clone()))
    }

    // -- unbinding ------------------------------------------------------------

    /// Unbinds one listener of `namespace`. The service stays active.
    ///
    /// Removing the listener that owns a port also unbinds the transports
    /// attached to that port, since nothing would be left accepting for them.
    pub async fn remove(&self, namespace: &str, transport: TransportType, label: &str) -> bool {
        let removed = self.services.get_mut(namespace).and_then(|mut active| {
            let index = active
                .listeners
                .iter()
                .position(|l| l.bound.transport == transport && l.bound.label == label)?;
            let owner = active.listeners.remove(index);
            let mut attached = Vec::new();
            if let (false, Some(port)) = (owner.bound.shared, owner.bound.port) {
                let mut index = 0;
                while index < active.listeners.len() {
                    let bound = &active.listeners[index].bound;
                    if bound.shared && bound.port == Some(port) {
                        attached.push(active.listeners.remove(index));
                    } else {
                        index += 1;
                    }
                }
            }
            Some((owner, attached))
        });
        match removed {
            Some((owner, attached)) => {
                if !attached.is_empty() {
                    let siblings: Vec<&BoundListener> = attached.iter().map(|l| &l.bound).collect();
                    self.log.log(
                        "Network:remove",
                        LogLevel::Notice,
                        &format!(
                            "Unbinding {} transport(s) sharing the {transport} port of {namespace}",
                            siblings.len()
                        ),
                        Some(&json!({ "namespace": namespace, "attached": siblings })),
                        None,
                    );
                }
                for listener in attached {
                    self.unbind(namespace, listener).await;
                }
                self.unbind(namespace, owner).await;
                true
            }
            None => {
                self.log.log(
                    "Network:remove",
                    LogLevel::Warning,
                    &format!("No {transport} listener labelled {label} is bound for {namespace}"),
                    Some(&json!({ "namespace": namespace, "transport": transport, "label": label })),
                    None,
                );
                false
            }
        }
    }

    /// Unbinds every listener of `namespace` and forgets the service,
    /// including its api node and middleware bindings.
    pub async fn remove_service(&self, namespace: &str) -> bool {
        let Some((_, active)) = self.services.remove(namespace) else {
            self.log.log(
                "Network:removeService",
                LogLevel::Warning,
                &format!("Unable to remove service. No active service with namespace {namespace}"),
                Some(&json!({ "namespace": namespace })),
                None,
            );
            return false;
        };
        self.order.lock().retain(|ns| ns != namespace);

        for listener in active.listeners.into_iter().rev() {
            self.unbind(namespace, listener).await;
        }
        let bindings = self.middleware.remove_namespace(namespace);
        let leftover = self.reservations.release_namespace(namespace);

        self.log.log(
            "Network:removeService",
            LogLevel::Info,
            &format!("Service {namespace} removed"),
            Some(&json!({ "namespace": namespace, "middlewareRemoved": bindings, "reservationsReleased": leftover })),
            None,
        );
        true
    }

    /// Removes every service in reverse activation order.
    pub async fn shutdown(&self) {
        let order = self.namespaces();
        for namespace in order.iter().rev() {
            self.remove_service(namespace).await;
        }
    }

    // -- internals ------------------------------------------------------------

    /// Marks `namespace` active. `None` when it already was.
    fn activate(&self, namespace: &str) -> Option<ServiceId> {
        match self.services.entry(namespace.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let id = ServiceId(self.next_id.fetch_add(1, Ordering::Relaxed));
                slot.insert(ActiveService {
                    id,
                    listeners: Vec::new(),
                });
                self.order.lock().push(namespace.to_string());
                Some(id)
            }
        }
    }

    /// True while any service still serves a listener with managed sessions.
    fn has_managed_listener(&self) -> bool {
        self.services
            .iter()
            .any(|service| service.listeners.iter().any(|l| is_managed(&l.bound)))
    }

    fn has_listener(&self, namespace: &str, transport: TransportType, label: &str) -> bool {
        self.services.get(namespace).is_some_and(|s| {
            s.listeners
                .iter()
                .any(|l| l.bound.transport == transport && l.bound.label == label)
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn bind(
        &self,
        namespace: &str,
        service_id: ServiceId,
        service: &Arc<dyn MeshService>,
        transport: TransportType,
        label: &str,
        port: Option<u16>,
        channels: &[&str],
    ) -> Result<BoundListener, NetworkError> {
        if self.has_listener(namespace, transport, label) {
            let err = NetworkError::DuplicateListener {
                namespace: namespace.to_string(),
                transport,
                label: label.to_string(),
            };
            self.report_failure(namespace, transport, &err);
            return Err(err);
        }

        let result = match transport.binding(port) {
            TransportBinding::InProcess => self.bind_in_process(namespace, service_id, service, label),
            TransportBinding::RequestResponse { port, managed_session } => {
                match self.open_socket(namespace, transport, label, port).await {
                    Ok(Socket::Bound(listener, port)) => Ok(self.spawn_request_response(
                        service,
                        transport,
                        label,
                        listener,
                        port,
                        managed_session,
                        channels,
                    )),
                    Ok(Socket::Shared(port)) => Ok(Self::shared(transport, label, port)),
                    Err(err) => Err(err),
                }
            }
            TransportBinding::RawStream { port } => match self.open_socket(namespace, transport, label, port).await {
                Ok(Socket::Bound(listener, port)) => Ok(self.spawn_raw_stream(service, transport, label, listener, port)),
                Ok(Socket::Shared(port)) => Ok(Self::shared(transport, label, port)),
                Err(err) => Err(err),
            },
            TransportBinding::PushSocket { port } => match self.open_socket(namespace, transport, label, port).await {
                Ok(Socket::Bound(listener, port)) => Ok(self.spawn_push_socket(service, transport, label, listener, port)),
                Ok(Socket::Shared(port)) => Ok(Self::shared(transport, label, port)),
                Err(err) => Err(err),
            },
        };

        let listener = match result {
            Ok(listener) => listener,
            Err(err) => {
                self.report_failure(namespace, transport, &err);
                return Err(err);
            }
        };
        let bound = listener.bound.clone();

        let orphan = match self.services.get_mut(namespace) {
            Some(mut active) => {
                active.listeners.push(listener);
                None
            }
            None => Some(listener),
        };
        if let Some(orphan) = orphan {
            // Service removed while this listener was binding.
            self.unbind(namespace, orphan).await;
            return Err(NetworkError::UnknownNamespace(namespace.to_string()));
        }

        self.log.log(
            "Network:add",
            if bound.shared { LogLevel::Notice } else { LogLevel::Info },
            &format!(
                "{} {transport} listener for {namespace}{}",
                if bound.shared { "Attached" } else { "Bound" },
                bound.port.map(|p| format!(" on port {p}")).unwrap_or_default()
            ),
            Some(&json!({ "namespace": namespace, "serviceId": service_id.0, "bound": bound })),
            None,
        );
        Ok(bound)
    }

    fn report_failure(&self, namespace: &str, transport: TransportType, err: &NetworkError) {
        let level = match err {
            NetworkError::Bind { .. } | NetworkError::ApiNode(_) => LogLevel::ServerFault,
            _ => LogLevel::ClientFault,
        };
        self.log.log(
            "Network:add",
            level,
            &format!("Unable to bind {transport} for {namespace}: {err}"),
            Some(&json!({ "namespace": namespace, "transport": transport })),
            None,
        );
    }

    fn shared(transport: TransportType, label: &str, port: u16) -> ActiveListener {
        ActiveListener::detached(BoundListener {
            transport,
            label: label.to_string(),
            port: Some(port),
            shared: true,
        })
    }

    /// Claims and binds `port`, or binds any port when it is 0.
    async fn open_socket(
        &self,
        namespace: &str,
        transport: TransportType,
        label: &str,
        port: u16,
    ) -> Result<Socket, NetworkError> {
        if port == 0 {
            let listener = self.bind_tcp(0).await?;
            let port = local_port(&listener)?;
            if !self.reservations.record(port, namespace, transport, label) {
                return Err(NetworkError::PortTaken {
                    port,
                    owner: self.reservations.owner(port).unwrap_or_default(),
                });
            }
            return Ok(Socket::Bound(listener, port));
        }

        match self
            .reservations
            .claim(port, namespace, transport, label, self.config.port_sharing)
        {
            Claim::Taken { owner } => {
                if owner == namespace && self.config.port_sharing == PortSharing::Exclusive {
                    self.log.note(
                        "Network:add",
                        LogLevel::Debug,
                        &format!("Port {port} already used by {namespace} and port sharing is exclusive"),
                    );
                }
                Err(NetworkError::PortTaken { port, owner })
            }
            Claim::Shared => Ok(Socket::Shared(port)),
            Claim::New => match self.bind_tcp(port).await {
                Ok(listener) => Ok(Socket::Bound(listener, port)),
                Err(err) => {
                    self.reservations.release(port, transport, label);
                    Err(err)
                }
            },
        }
    }

    async fn bind_tcp(&self, port: u16) -> Result<TcpListener, NetworkError> {
        let addr = format!("{}:{port}", self.config.host);
        TcpListener::bind(&addr)
            .await
            .map_err(|source| NetworkError::Bind { addr, source })
    }

    fn bind_in_process(
        &self,
        namespace: &str,
        service_id: ServiceId,
        service: &Arc<dyn MeshService>,
        label: &str,
    ) -> Result<ActiveListener, NetworkError> {
        let target = Arc::clone(service);
        let handler: ApiHandler = Arc::new(move |call: ApiCall| target.api_request(call));
        if !self.api.add_api_node(service_id, namespace, handler) {
            return Err(NetworkError::ApiNode(namespace.to_string()));
        }
        Ok(ActiveListener::detached(BoundListener {
            transport: TransportType::Api,
            label: label.to_string(),
            port: None,
            shared: false,
        }))
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_request_response(
        &self,
        service: &Arc<dyn MeshService>,
        transport: TransportType,
        label: &str,
        listener: TcpListener,
        port: u16,
        managed_session: bool,
        channels: &[&str],
    ) -> ActiveListener {
        let namespace = service.namespace().to_string();
        let drain = Arc::new(DrainController::new());

        let channels: Vec<String> = channels
            .iter()
            .filter(|channel| {
                let known = self.middleware.has_channel(channel);
                if !known {
                    self.log.log(
                        "Network:add",
                        LogLevel::Warning,
                        &format!("Ignoring unknown middleware channel {channel} for {namespace}"),
                        Some(&json!({ "namespace": namespace, "channel": channel })),
                        None,
                    );
                }
                known
            })
            .map(|channel| (*channel).to_string())
            .collect();

        let state = RequestState {
            service: Arc::clone(service),
            transport,
            middleware: Arc::clone(&self.middleware),
            channels: channels.into(),
            drain: Arc::clone(&drain),
            body_limit: self.config.body_limit,
            log: Arc::clone(&self.log),
        };

        let public = service.descriptor().file_root.join("public");
        let assets = ServeDir::new(public)
            .call_fallback_on_method_not_allowed(true)
            .fallback(axum::handler::Handler::with_state(dispatch_handler, state));

        let mut router = Router::new()
            .fallback_service(assets)
            .layer(axum::middleware::map_response(strip_cache_validators));
        if let Some(dir) = self.config.access_log_dir() {
            let access = Arc::new(AccessLog::new(dir, namespace.clone()));
            router = router.layer(axum::middleware::from_fn_with_state(access, access_log_layer));
        }
        if managed_session {
            router = router.layer(axum::middleware::from_fn_with_state(self.sessions(), session_layer));
        }
        let router = router.layer(build_http_layers(&self.config));

        let shutdown = drain.drained();
        let log = Arc::clone(&self.log);
        drain.set_serving();
        let task = tokio::spawn(async move {
            let app = router.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
                log.log(
                    "Network:serve",
                    LogLevel::ServerFault,
                    &format!("Listener for {namespace} stopped with an error: {err}"),
                    None,
                    None,
                );
            }
        });

        ActiveListener {
            bound: BoundListener {
                transport,
                label: label.to_string(),
                port: Some(port),
                shared: false,
            },
            drain,
            task: Some(task),
            peers: None,
        }
    }

    fn spawn_raw_stream(
        &self,
        service: &Arc<dyn MeshService>,
        transport: TransportType,
        label: &str,
        listener: TcpListener,
        port: u16,
    ) -> ActiveListener {
        let drain = Arc::new(DrainController::new());
        let task = tokio::spawn(serve_stream(
            listener,
            Arc::clone(service),
            Arc::clone(&drain),
            Arc::clone(&self.log),
        ));
        ActiveListener {
            bound: BoundListener {
                transport,
                label: label.to_string(),
                port: Some(port),
                shared: false,
            },
            drain,
            task: Some(task),
            peers: None,
        }
    }

    fn spawn_push_socket(
        &self,
        service: &Arc<dyn MeshService>,
        transport: TransportType,
        label: &str,
        listener: TcpListener,
        port: u16,
    ) -> ActiveListener {
        let namespace = service.namespace().to_string();
        let drain = Arc::new(DrainController::new());
        let peers = Arc::new(PeerRegistry::new());
        let state = PushState {
            service: Arc::clone(service),
            peers: Arc::clone(&peers),
            drain: Arc::clone(&drain),
            connection: self.config.connection.clone(),
            log: Arc::clone(&self.log),
        };
        let router = Router::new()
            .fallback(ws_upgrade_handler)
            .with_state(state)
            .layer(tower_http::trace::TraceLayer::new_for_http());

        let shutdown = drain.drained();
        let log = Arc::clone(&self.log);
        drain.set_serving();
        let task = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router).with_graceful_shutdown(shutdown).await {
                log.log(
                    "Network:serve",
                    LogLevel::ServerFault,
                    &format!("Push listener for {namespace} stopped with an error: {err}"),
                    None,
                    None,
                );
            }
        });

        ActiveListener {
            bound: BoundListener {
                transport,
                label: label.to_string(),
                port: Some(port),
                shared: false,
            },
            drain,
            task: Some(task),
            peers: Some(peers),
        }
    }

    /// Drain, abort stragglers, release the reservation.
    async fn unbind(&self, namespace: &str, mut listener: ActiveListener) {
        let bound = listener.bound.clone();
        listener.drain.trigger_drain();

        if let Some(peers) = &listener.peers {
            for peer in peers.drain_all() {
                peer.close("service unbound");
            }
        }

        let timeout = self.config.drain_timeout;
        let mut clean = true;
        if let Some(mut task) = listener.task.take() {
            if tokio::time::timeout(timeout, &mut task).await.is_err() {
                clean = false;
                task.abort();
                let _ = task.await;
            }
        }
        if !listener.drain.wait_for_drain(if clean { timeout } else { std::time::Duration::ZERO }).await {
            clean = false;
        }

        match bound.transport {
            TransportType::Api => {
                self.api.remove_api_node(namespace);
            }
            _ => {
                if let Some(port) = bound.port {
                    self.reservations.release(port, bound.transport, &bound.label);
                }
            }
        }
        if is_managed(&bound) && !self.has_managed_listener() && !self.sessions.is_empty() {
            let dropped = self.sessions.len();
            self.sessions.clear();
            self.log.note(
                "Network:remove",
                LogLevel::Debug,
                &format!("Dropped {dropped} session(s) with the last managed listener"),
            );
        }

        self.log.log(
            "Network:remove",
            if clean { LogLevel::Info } else { LogLevel::Warning },
            &format!(
                "Unbound {} listener for {namespace}{}",
                bound.transport,
                if clean { "" } else { " after aborting in-flight work" }
            ),
            Some(&json!({ "namespace": namespace, "bound": bound })),
            None,
        );
    }
}

fn is_managed(bound: &BoundListener) -> bool {
    !bound.shared
        && matches!(
            bound.transport.binding(bound.port),
            TransportBinding::RequestResponse { managed_session: true, .. }
        )
}

/// Outcome of claiming a port for a listener.
enum Socket {
    Bound(TcpListener, u16),
    Shared(u16),
}

fn local_port(listener: &TcpListener) -> Result<u16, NetworkError> {
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|source| NetworkError::Bind {
            addr: "0".to_string(),
            source,
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
