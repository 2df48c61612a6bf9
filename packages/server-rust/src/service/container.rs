use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::json;
use switchyard_core::{LogLevel, LogSink};

use super::api::ApiRegistry;
use super::middleware::MiddlewarePipeline;
use crate::network::config::NetworkConfig;
use crate::network::session::SessionStore;
use crate::network::stack::{NetworkStack, ServiceRegistration};
use crate::traits::MeshService;

// ---------------------------------------------------------------------------
// ServiceContext
// ---------------------------------------------------------------------------

/// Collaborators handed to each service on init.
#[derive(Clone)]
pub struct ServiceContext {
    pub api: Arc<ApiRegistry>,
    pub middleware: Arc<MiddlewarePipeline>,
    pub sessions: Arc<SessionStore>,
    pub log: Arc<dyn LogSink>,
    pub config: Arc<NetworkConfig>,
}

// ---------------------------------------------------------------------------
// ServiceContainer
// ---------------------------------------------------------------------------

/// Services known to the process, started in insertion order and stopped in
/// reverse.
pub struct ServiceContainer {
    services: DashMap<String, Arc<dyn MeshService>>,
    order: RwLock<Vec<String>>,
    log: Arc<dyn LogSink>,
}

impl ServiceContainer {
    #[must_use]
    pub fn new(log: Arc<dyn LogSink>) -> Self {
        Self {
            services: DashMap::new(),
            order: RwLock::new(Vec::new()),
            log,
        }
    }

    /// Adds a service. Rejects an empty or already present namespace.
    pub fn add(&self, service: Arc<dyn MeshService>) -> bool {
        let namespace = service.namespace().to_string();
        if namespace.is_empty() || self.services.contains_key(&namespace) {
            self.log.log(
                "ServiceContainer:add",
                LogLevel::ClientFault,
                &format!("Unable to add service with namespace '{namespace}'"),
                Some(&json!({ "namespace": namespace })),
                None,
            );
            return false;
        }
        self.services.insert(namespace.clone(), service);
        self.order.write().push(namespace);
        true
    }

    pub fn remove(&self, namespace: &str) -> Option<Arc<dyn MeshService>> {
        let removed = self.services.remove(namespace).map(|(_, service)| service);
        if removed.is_some() {
            self.order.write().retain(|ns| ns != namespace);
        }
        removed
    }

    #[must_use]
    pub fn get(&self, namespace: &str) -> Option<Arc<dyn MeshService>> {
        self.services.get(namespace).map(|entry| Arc::clone(entry.value()))
    }

    /// Namespaces in insertion order.
    #[must_use]
    pub fn namespaces(&self) -> Vec<String> {
        self.order.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Initializes and binds every service in insertion order.
    ///
    /// A service whose init or registration fails is logged and skipped; the
    /// rest still start. Returns one registration per service that was bound.
    ///
    /// # Errors
    ///
    /// Fails only when no service could be started at all while some were
    /// present.
    pub async fn start_all(&self, stack: &NetworkStack) -> anyhow::Result<Vec<ServiceRegistration>> {
        let ctx = stack.context();
        let mut registrations = Vec::new();
        let order = self.namespaces();

        for namespace in &order {
            let Some(service) = self.get(namespace) else {
                continue;
            };
            if let Err(err) = service.init(&ctx).await {
                self.log.log(
                    "ServiceContainer:start",
                    LogLevel::ServerFault,
                    &format!("Service {namespace} failed to initialize: {err:#}"),
                    Some(&json!({ "namespace": namespace })),
                    None,
                );
                continue;
            }
            match stack.register_service(service).await {
                Ok(registration) => registrations.push(registration),
                Err(err) => self.log.log(
                    "ServiceContainer:start",
                    LogLevel::ServerFault,
                    &format!("Service {namespace} could not be bound: {err}"),
                    Some(&json!({ "namespace": namespace })),
                    None,
                ),
            }
        }

        if registrations.is_empty() && !order.is_empty() {
            anyhow::bail!("none of {} services could be started", order.len());
        }
        Ok(registrations)
    }

    /// Unbinds and shuts down every service in reverse insertion order.
    pub async fn shutdown_all(&self, stack: &NetworkStack) {
        let order = self.namespaces();
        for namespace in order.iter().rev() {
            if stack.is_active(namespace) {
                stack.remove_service(namespace).await;
            }
            if let Some(service) = self.get(namespace) {
                if let Err(err) = service.shutdown().await {
                    self.log.log(
                        "ServiceContainer:shutdown",
                        LogLevel::Warning,
                        &format!("Service {namespace} shutdown reported: {err:#}"),
                        Some(&json!({ "namespace": namespace })),
                        None,
                    );
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::Value;
    use switchyard_core::{MemoryLogSink, ServiceDescriptor, TransportType};

    use super::*;
    use crate::service::routes::Routes;

    /// Api-only service that records lifecycle calls.
    struct Recorder {
        descriptor: ServiceDescriptor,
        routes: Routes,
        trail: Arc<parking_lot::Mutex<Vec<String>>>,
        fail_init: bool,
    }

    impl Recorder {
        fn new(namespace: &str, trail: Arc<parking_lot::Mutex<Vec<String>>>, log: Arc<dyn LogSink>) -> Self {
            let routes = Routes::new(namespace, log);
            routes.add(
                [TransportType::Api],
                "who",
                Arc::new(|_: &str, _: TransportType, _: Vec<Value>| json!("me")),
            );
            Self {
                descriptor: ServiceDescriptor::new(namespace).transport(TransportType::Api, None),
                routes,
                trail,
                fail_init: false,
            }
        }
    }

    #[async_trait]
    impl MeshService for Recorder {
        fn descriptor(&self) -> &ServiceDescriptor {
            &self.descriptor
        }

        fn routes(&self) -> &Routes {
            &self.routes
        }

        async fn init(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
            self.trail.lock().push(format!("init:{}", self.namespace()));
            if self.fail_init {
                anyhow::bail!("refusing to start");
            }
            Ok(())
        }

        async fn shutdown(&self) -> anyhow::Result<()> {
            self.trail.lock().push(format!("shutdown:{}", self.namespace()));
            Ok(())
        }
    }

    fn setup() -> (ServiceContainer, Arc<NetworkStack>, Arc<MemoryLogSink>, Arc<parking_lot::Mutex<Vec<String>>>) {
        let log = Arc::new(MemoryLogSink::new());
        let config = NetworkConfig {
            access_log_dir: None,
            ..NetworkConfig::default()
        };
        let stack = NetworkStack::new(config, log.clone());
        (
            ServiceContainer::new(log.clone()),
            stack,
            log,
            Arc::new(parking_lot::Mutex::new(Vec::new())),
        )
    }

    #[test]
    fn add_rejects_duplicate_namespace() {
        let (container, _stack, log, trail) = setup();
        assert!(container.add(Arc::new(Recorder::new("alpha", trail.clone(), log.clone()))));
        assert!(!container.add(Arc::new(Recorder::new("alpha", trail, log.clone()))));
        assert_eq!(container.len(), 1);
        assert!(log.contains("Unable to add service"));
    }

    #[test]
    fn remove_forgets_order() {
        let (container, _stack, log, trail) = setup();
        container.add(Arc::new(Recorder::new("alpha", trail.clone(), log.clone())));
        container.add(Arc::new(Recorder::new("beta", trail, log)));
        assert!(container.remove("alpha").is_some());
        assert!(container.remove("alpha").is_none());
        assert_eq!(container.namespaces(), vec!["beta".to_string()]);
    }

    #[tokio::test]
    async fn start_and_shutdown_follow_order() {
        let (container, stack, log, trail) = setup();
        for ns in ["first", "second", "third"] {
            container.add(Arc::new(Recorder::new(ns, trail.clone(), log.clone())));
        }

        let registrations = container.start_all(&stack).await.unwrap();
        assert_eq!(registrations.len(), 3);
        assert!(registrations.iter().all(ServiceRegistration::is_complete));
        assert!(stack.api().get_api_node("second").is_some());

        container.shutdown_all(&stack).await;
        assert!(stack.api().namespaces().is_empty());
        assert_eq!(
            trail.lock().clone(),
            vec![
                "init:first",
                "init:second",
                "init:third",
                "shutdown:third",
                "shutdown:second",
                "shutdown:first",
            ]
        );
    }

    #[tokio::test]
    async fn failed_init_skips_only_that_service() {
        let (container, stack, log, trail) = setup();
        let mut broken = Recorder::new("broken", trail.clone(), log.clone());
        broken.fail_init = true;
        container.add(Arc::new(broken));
        container.add(Arc::new(Recorder::new("fine", trail, log.clone())));

        let registrations = container.start_all(&stack).await.unwrap();
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].namespace, "fine");
        assert!(!stack.is_active("broken"));
        assert!(log.contains("failed to initialize"));
    }

    #[tokio::test]
    async fn start_all_fails_when_nothing_starts() {
        let (container, stack, log, trail) = setup();
        let mut broken = Recorder::new("broken", trail, log);
        broken.fail_init = true;
        container.add(Arc::new(broken));
        assert!(container.start_all(&stack).await.is_err());
    }

    #[tokio::test]
    async fn api_calls_reach_started_service() {
        let (container, stack, log, trail) = setup();
        container.add(Arc::new(Recorder::new("alpha", trail, log)));
        container.start_all(&stack).await.unwrap();

        let call = stack.api().call_api_node("alpha", "who", Value::Null).unwrap();
        assert!(call.is_ok());
        assert_eq!(call.data, json!("me"));
    }
}
