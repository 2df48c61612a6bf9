//! In-process api registry: namespace-addressed calls wrapped in an
//! [`ApiCall`] envelope.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{json, Value};
use switchyard_core::{ApiCall, ClockSource, LogLevel, LogSink, SystemClock};

use super::middleware::{MiddlewarePipeline, POST_API_CALL, PRE_API_CALL};
use crate::traits::ServiceId;

/// Handler behind an api node. Failures are reported inside the envelope.
pub type ApiHandler = Arc<dyn Fn(ApiCall) -> ApiCall + Send + Sync>;

/// Names that address the registry's own control surface and can never be
/// used as a node namespace. Compared case-insensitively.
pub const RESERVED_NAMESPACES: [&str; 8] = [
    "api",
    "registry",
    "middleware",
    "network",
    "add",
    "get",
    "call",
    "remove",
];

struct NodeEntry {
    service_id: ServiceId,
    handler: ApiHandler,
}

/// Directory of in-process api nodes keyed by service namespace.
pub struct ApiRegistry {
    nodes: DashMap<String, NodeEntry>,
    middleware: Arc<MiddlewarePipeline>,
    clock: Arc<dyn ClockSource>,
    log: Arc<dyn LogSink>,
}

impl ApiRegistry {
    #[must_use]
    pub fn new(middleware: Arc<MiddlewarePipeline>, log: Arc<dyn LogSink>) -> Self {
        Self::with_clock(middleware, log, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(
        middleware: Arc<MiddlewarePipeline>,
        log: Arc<dyn LogSink>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        Self {
            nodes: DashMap::new(),
            middleware,
            clock,
            log,
        }
    }

    /// Whether `namespace` collides with a reserved control-surface name.
    #[must_use]
    pub fn is_reserved(namespace: &str) -> bool {
        RESERVED_NAMESPACES
            .iter()
            .any(|reserved| reserved.eq_ignore_ascii_case(namespace))
    }

    /// Registers `handler` under `namespace`.
    ///
    /// Rejects empty, reserved, and already-registered namespaces.
    pub fn add_api_node(&self, service_id: ServiceId, namespace: &str, handler: ApiHandler) -> bool {
        if namespace.is_empty() || Self::is_reserved(namespace) {
            self.log.log(
                "Api:addApiNode",
                LogLevel::ClientFault,
                &format!("Unable to create new api node. The namespace is reserved - Service Namespace: {namespace}"),
                Some(&json!({ "namespace": namespace, "serviceId": service_id.0 })),
                None,
            );
            return false;
        }

        match self.nodes.entry(namespace.to_string()) {
            Entry::Occupied(_) => {
                self.log.log(
                    "Api:addApiNode",
                    LogLevel::ClientFault,
                    &format!(
                        "Unable to create new api node. A node for this service namespace already exists - Service Namespace: {namespace}"
                    ),
                    Some(&json!({ "namespace": namespace, "serviceId": service_id.0 })),
                    None,
                );
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(NodeEntry { service_id, handler });
                self.log.note(
                    "Api:addApiNode",
                    LogLevel::Info,
                    &format!("Added a new API node for Service Namespace: {namespace}"),
                );
                true
            }
        }
    }

    /// Unregisters the node for `namespace`.
    pub fn remove_api_node(&self, namespace: &str) -> bool {
        let removed = self.nodes.remove(namespace).is_some();
        if removed {
            self.log.note(
                "Api:removeApiNode",
                LogLevel::Info,
                &format!("Removed API node for Service Namespace: {namespace}"),
            );
        }
        removed
    }

    #[must_use]
    pub fn get_api_node(&self, namespace: &str) -> Option<ApiHandler> {
        self.nodes.get(namespace).map(|entry| Arc::clone(&entry.handler))
    }

    /// Service that owns the node for `namespace`.
    #[must_use]
    pub fn service_id(&self, namespace: &str) -> Option<ServiceId> {
        self.nodes.get(namespace).map(|entry| entry.service_id)
    }

    /// Named accessor for calling one node without repeating its namespace.
    #[must_use]
    pub fn node(&self, namespace: &str) -> Option<ApiNode<'_>> {
        self.nodes.contains_key(namespace).then(|| ApiNode {
            registry: self,
            namespace: namespace.to_string(),
        })
    }

    /// Registered namespaces, sorted.
    #[must_use]
    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Calls `method` on the node for `namespace`.
    ///
    /// Returns `None` when no node exists. Otherwise the envelope passes
    /// through `PRE_API_CALL`, the handler, and `POST_API_CALL`, and comes
    /// back stamped. A panicking handler is recorded as an envelope error.
    pub fn call_api_node(&self, namespace: &str, method: &str, data: Value) -> Option<ApiCall> {
        let Some(handler) = self.get_api_node(namespace) else {
            self.log.log(
                "Api:callApiNode",
                LogLevel::ClientFault,
                &format!(
                    "Failed to call node service with namespace: {namespace} - no api handler exists for this namespace"
                ),
                Some(&json!({ "namespace": namespace, "method": method })),
                None,
            );
            return None;
        };

        let call = ApiCall::new(method, data, self.clock.now());
        let call = self.middleware.call_channel_typed(PRE_API_CALL, call);

        let fallback = call.clone();
        let mut call = match catch_unwind(AssertUnwindSafe(|| handler(call))) {
            Ok(call) => call,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                let mut failed = fallback;
                failed.fail(format!("api handler panicked: {reason}"));
                failed
            }
        };
        call.updated_at = Some(self.clock.now());

        let mut call = self.middleware.call_channel_typed(POST_API_CALL, call);
        call.returned_at = Some(self.clock.now());

        if call.error {
            self.log.log(
                "Api:callApiNode",
                LogLevel::Warning,
                &format!("Api handler for namespace: {namespace} reported an error for method: {method}"),
                Some(&json!({ "namespace": namespace, "method": method, "errors": call.errors })),
                None,
            );
        }
        Some(call)
    }
}

/// Borrowed handle bound to one api node.
pub struct ApiNode<'a> {
    registry: &'a ApiRegistry,
    namespace: String,
}

impl ApiNode<'_> {
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Same as [`ApiRegistry::call_api_node`] for this node's namespace.
    #[must_use]
    pub fn call(&self, method: &str, data: Value) -> Option<ApiCall> {
        self.registry.call_api_node(&self.namespace, method, data)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use switchyard_core::MemoryLogSink;

    use super::*;

    /// Clock that advances by one millisecond per read.
    struct SteppingClock(AtomicU64);

    impl ClockSource for SteppingClock {
        fn now(&self) -> u64 {
            self.0.fetch_add(1, Ordering::SeqCst)
        }
    }

    struct Fixture {
        registry: ApiRegistry,
        middleware: Arc<MiddlewarePipeline>,
        log: Arc<MemoryLogSink>,
    }

    fn fixture() -> Fixture {
        let log = Arc::new(MemoryLogSink::new());
        let middleware = Arc::new(MiddlewarePipeline::new(log.clone()));
        let registry = ApiRegistry::with_clock(
            middleware.clone(),
            log.clone(),
            Arc::new(SteppingClock(AtomicU64::new(100))),
        );
        Fixture {
            registry,
            middleware,
            log,
        }
    }

    fn echo() -> ApiHandler {
        Arc::new(|mut call: ApiCall| {
            let reply = json!({ "echo": call.data.clone(), "method": call.method.clone() });
            call.respond(reply);
            call
        })
    }

    #[test]
    fn add_and_get_node() {
        let f = fixture();
        assert!(f.registry.add_api_node(ServiceId(1), "status", echo()));
        assert!(f.registry.get_api_node("status").is_some());
        assert!(f.registry.get_api_node("missing").is_none());
        assert_eq!(f.registry.service_id("status"), Some(ServiceId(1)));
        assert_eq!(f.registry.namespaces(), vec!["status"]);
    }

    #[test]
    fn duplicate_namespace_is_rejected() {
        let f = fixture();
        assert!(f.registry.add_api_node(ServiceId(1), "status", echo()));
        assert!(!f.registry.add_api_node(ServiceId(2), "status", echo()));
        assert_eq!(f.registry.service_id("status"), Some(ServiceId(1)));
        assert_eq!(f.log.matching(LogLevel::ClientFault, "already exists").len(), 1);
    }

    #[test]
    fn reserved_namespaces_are_rejected() {
        let f = fixture();
        for name in ["api", "Registry", "MIDDLEWARE", "call"] {
            assert!(!f.registry.add_api_node(ServiceId(1), name, echo()), "{name}");
        }
        assert!(!f.registry.add_api_node(ServiceId(1), "", echo()));
        assert_eq!(f.log.matching(LogLevel::ClientFault, "reserved").len(), 5);
    }

    #[test]
    fn call_stamps_envelope_in_order() {
        let f = fixture();
        f.registry.add_api_node(ServiceId(1), "status", echo());

        let call = f
            .registry
            .call_api_node("status", "/ServiceStatus", json!({"x": 1}))
            .unwrap();
        assert!(call.is_ok());
        assert_eq!(call.data["echo"], json!({"x": 1}));
        assert_eq!(call.data["method"], "/ServiceStatus");

        let updated = call.updated_at.unwrap();
        let returned = call.returned_at.unwrap();
        assert!(call.created_at < updated && updated < returned);
    }

    #[test]
    fn missing_node_returns_none_with_distinct_log() {
        let f = fixture();
        assert!(f.registry.call_api_node("ghost", "m", Value::Null).is_none());
        assert_eq!(f.log.matching(LogLevel::ClientFault, "no api handler").len(), 1);
        assert!(f.log.matching(LogLevel::Warning, "reported an error").is_empty());
    }

    #[test]
    fn handler_errors_stay_in_envelope() {
        let f = fixture();
        f.registry.add_api_node(
            ServiceId(1),
            "status",
            Arc::new(|mut call: ApiCall| {
                call.fail("disk on fire");
                call
            }),
        );

        let call = f.registry.call_api_node("status", "m", Value::Null).unwrap();
        assert!(call.error);
        assert_eq!(call.errors, vec!["disk on fire"]);
        assert_eq!(f.log.matching(LogLevel::Warning, "reported an error").len(), 1);
        assert!(f.log.matching(LogLevel::ClientFault, "no api handler").is_empty());
    }

    #[test]
    fn panicking_handler_is_captured() {
        let f = fixture();
        f.registry.add_api_node(
            ServiceId(1),
            "status",
            Arc::new(|_: ApiCall| -> ApiCall { panic!("boom") }),
        );

        let call = f.registry.call_api_node("status", "m", json!(1)).unwrap();
        assert!(call.error);
        assert!(call.errors[0].contains("boom"));
        assert_eq!(call.data, json!(1));
        assert!(call.returned_at.is_some());
    }

    #[test]
    fn pre_and_post_middleware_wrap_the_handler() {
        let f = fixture();
        f.middleware.add_middleware(
            PRE_API_CALL,
            "audit",
            "tag",
            Arc::new(|mut v: Value| {
                v["data"] = json!("pre");
                v
            }),
        );
        f.middleware.add_middleware(
            POST_API_CALL,
            "audit",
            "tag",
            Arc::new(|mut v: Value| {
                let seen = v["data"]["echo"].clone();
                v["data"] = json!({ "handler_saw": seen, "post": true });
                v
            }),
        );
        f.registry.add_api_node(ServiceId(1), "status", echo());

        let call = f.registry.call_api_node("status", "m", json!("original")).unwrap();
        assert_eq!(call.data["handler_saw"], "pre");
        assert_eq!(call.data["post"], true);
    }

    #[test]
    fn node_accessor_calls_through_registry() {
        let f = fixture();
        f.registry.add_api_node(ServiceId(1), "status", echo());
        let node = f.registry.node("status").unwrap();
        assert_eq!(node.namespace(), "status");
        assert_eq!(node.call("m", json!(2)).unwrap().data["echo"], 2);
        assert!(f.registry.node("missing").is_none());
    }

    #[test]
    fn removed_node_is_gone() {
        let f = fixture();
        f.registry.add_api_node(ServiceId(1), "status", echo());
        assert!(f.registry.remove_api_node("status"));
        assert!(!f.registry.remove_api_node("status"));
        assert!(f.registry.call_api_node("status", "m", Value::Null).is_none());
        assert!(f.registry.add_api_node(ServiceId(2), "status", echo()));
    }
}
