//! Per-service route table: method key to a transport-gated handler.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Value};
use switchyard_core::{LogLevel, LogSink, TransportType};

/// Route callback: `(method, transport, payload) -> result`.
pub type RouteHandler = Arc<dyn Fn(&str, TransportType, Vec<Value>) -> Value + Send + Sync>;

/// Why [`Routes::route`] could not dispatch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("no route for method {method}")]
    UnknownMethod { method: String },

    #[error("transport {transport} is not permitted for method {method}")]
    NotPermitted {
        method: String,
        transport: TransportType,
    },

    #[error("handler for method {method} failed: {reason}")]
    HandlerFailed { method: String, reason: String },
}

/// One entry of a bulk route import.
#[derive(Clone)]
pub struct RouteDescriptor {
    pub allowed_transports: Vec<String>,
    pub method: String,
    pub callback: RouteHandler,
}

impl RouteDescriptor {
    #[must_use]
    pub fn new<S: AsRef<str>>(allowed: &[S], method: impl Into<String>, callback: RouteHandler) -> Self {
        Self {
            allowed_transports: allowed.iter().map(|s| s.as_ref().to_string()).collect(),
            method: method.into(),
            callback,
        }
    }
}

struct RouteEntry {
    permitted: HashSet<TransportType>,
    handler: RouteHandler,
}

/// Route table owned by one service.
///
/// Keys are unique; the first active registration of a method wins until it
/// is removed.
pub struct Routes {
    namespace: String,
    entries: RwLock<HashMap<String, RouteEntry>>,
    log: Arc<dyn LogSink>,
}

impl Routes {
    #[must_use]
    pub fn new(namespace: impl Into<String>, log: Arc<dyn LogSink>) -> Self {
        Self {
            namespace: namespace.into(),
            entries: RwLock::new(HashMap::new()),
            log,
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Adds `method` permitted on every transport in `allowed`.
    pub fn add(
        &self,
        allowed: impl IntoIterator<Item = TransportType>,
        method: &str,
        handler: RouteHandler,
    ) -> bool {
        let permitted: HashSet<TransportType> = allowed.into_iter().collect();
        if method.is_empty() || permitted.is_empty() {
            self.log.log(
                "Routes:add",
                LogLevel::Warning,
                &format!("Route rejected for {}: a method key and at least one transport are required", self.namespace),
                Some(&json!({ "namespace": self.namespace, "method": method })),
                None,
            );
            return false;
        }

        let mut entries = self.entries.write();
        if entries.contains_key(method) {
            drop(entries);
            self.log.log(
                "Routes:add",
                LogLevel::Warning,
                &format!("Route {method} is already active for {}", self.namespace),
                Some(&json!({ "namespace": self.namespace, "method": method })),
                None,
            );
            return false;
        }
        let mut granted: Vec<&str> = permitted.iter().map(|t| t.as_str()).collect();
        granted.sort_unstable();
        let granted = granted.join(",");
        entries.insert(method.to_string(), RouteEntry { permitted, handler });
        drop(entries);

        self.log.log(
            "Routes:add",
            LogLevel::Debug,
            &format!("Route {method} added for {}", self.namespace),
            Some(&json!({ "namespace": self.namespace, "method": method, "transports": granted })),
            None,
        );
        true
    }

    /// Adds `method` from transport names; unknown names are skipped with a
    /// diagnostic.
    pub fn add_named<S: AsRef<str>>(&self, allowed: &[S], method: &str, handler: RouteHandler) -> bool {
        let permitted = self.parse_transports(method, allowed);
        self.add(permitted, method, handler)
    }

    /// Loads a batch of named route descriptors.
    ///
    /// The whole batch is checked first; one entry with an empty method key
    /// or no transport names rejects the batch with nothing added.
    pub fn import_routes<I, K>(&self, descriptors: I) -> bool
    where
        I: IntoIterator<Item = (K, RouteDescriptor)>,
        K: AsRef<str>,
    {
        let batch: Vec<(K, RouteDescriptor)> = descriptors.into_iter().collect();
        let malformed: Vec<String> = batch
            .iter()
            .filter(|(_, d)| d.method.is_empty() || d.allowed_transports.is_empty())
            .map(|(name, _)| name.as_ref().to_string())
            .collect();
        if !malformed.is_empty() {
            self.log.log(
                "Routes:importRoutes",
                LogLevel::Warning,
                &format!("Route import for {} rejected: malformed route descriptors", self.namespace),
                Some(&json!({ "namespace": self.namespace, "routes": malformed })),
                None,
            );
            return false;
        }

        let mut all_added = true;
        for (_, descriptor) in batch {
            let added = self.add_named(&descriptor.allowed_transports, &descriptor.method, descriptor.callback);
            all_added &= added;
        }
        all_added
    }

    /// Deletes `method`. True only for the call that removed it.
    pub fn remove(&self, method: &str) -> bool {
        let removed = self.entries.write().remove(method).is_some();
        if removed {
            self.log.note(
                "Routes:remove",
                LogLevel::Debug,
                &format!("Route {method} removed from {}", self.namespace),
            );
        }
        removed
    }

    #[must_use]
    pub fn contains(&self, method: &str) -> bool {
        self.entries.read().contains_key(method)
    }

    #[must_use]
    pub fn is_permitted(&self, method: &str, transport: TransportType) -> bool {
        self.entries
            .read()
            .get(method)
            .is_some_and(|entry| entry.permitted.contains(&transport))
    }

    /// Active method keys, sorted.
    #[must_use]
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.entries.read().keys().cloned().collect();
        methods.sort();
        methods
    }

    /// Runs the handler for `method` when `transport` is permitted.
    ///
    /// # Errors
    ///
    /// [`RouteError::UnknownMethod`] when no entry is active for `method`,
    /// [`RouteError::NotPermitted`] when the entry does not allow `transport`,
    /// [`RouteError::HandlerFailed`] when the handler panics.
    pub fn route(&self, transport: TransportType, method: &str, payload: Vec<Value>) -> Result<Value, RouteError> {
        let lookup = self
            .entries
            .read()
            .get(method)
            .map(|entry| (entry.permitted.contains(&transport), Arc::clone(&entry.handler)));

        match lookup {
            Some((true, handler)) => match catch_unwind(AssertUnwindSafe(|| handler(method, transport, payload))) {
                Ok(value) => Ok(value),
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    self.log.log(
                        "Routes:route",
                        LogLevel::ServerFault,
                        &format!("Handler for route {method} on {} panicked: {reason}", self.namespace),
                        Some(&json!({ "namespace": self.namespace, "method": method, "transport": transport })),
                        None,
                    );
                    Err(RouteError::HandlerFailed {
                        method: method.to_string(),
                        reason,
                    })
                }
            },
            Some((false, _)) => {
                self.log.log(
                    "Routes:route",
                    LogLevel::ClientFault,
                    &format!(
                        "Transport {transport} is not permitted for route {method} on {}",
                        self.namespace
                    ),
                    Some(&json!({ "namespace": self.namespace, "method": method, "transport": transport })),
                    None,
                );
                Err(RouteError::NotPermitted {
                    method: method.to_string(),
                    transport,
                })
            }
            None => {
                self.log.log(
                    "Routes:route",
                    LogLevel::Warning,
                    &format!("Route not found: {method} on {}", self.namespace),
                    Some(&json!({ "namespace": self.namespace, "method": method, "transport": transport })),
                    None,
                );
                Err(RouteError::UnknownMethod {
                    method: method.to_string(),
                })
            }
        }
    }

    fn parse_transports<S: AsRef<str>>(&self, method: &str, names: &[S]) -> Vec<TransportType> {
        names
            .iter()
            .filter_map(|name| match name.as_ref().parse::<TransportType>() {
                Ok(transport) => Some(transport),
                Err(err) => {
                    self.log.log(
                        "Routes:add",
                        LogLevel::Warning,
                        &format!("Ignoring transport for route {method} on {}: {err}", self.namespace),
                        Some(&json!({ "namespace": self.namespace, "method": method, "transport": name.as_ref() })),
                        None,
                    );
                    None
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use switchyard_core::MemoryLogSink;

    use super::*;

    fn routes() -> (Routes, Arc<MemoryLogSink>) {
        let log = Arc::new(MemoryLogSink::new());
        (Routes::new("status", log.clone()), log)
    }

    fn reply(tag: &'static str) -> RouteHandler {
        Arc::new(move |method: &str, transport: TransportType, payload: Vec<Value>| {
            json!({ "tag": tag, "method": method, "transport": transport, "count": payload.len() })
        })
    }

    #[test]
    fn permitted_transport_runs_handler() {
        let (routes, _) = routes();
        assert!(routes.add([TransportType::Http], "/ping", reply("a")));

        let out = routes.route(TransportType::Http, "/ping", vec![json!(1)]).unwrap();
        assert_eq!(out["tag"], "a");
        assert_eq!(out["method"], "/ping");
        assert_eq!(out["transport"], "http");
        assert_eq!(out["count"], 1);
    }

    #[test]
    fn disallowed_and_unknown_are_distinguished() {
        let (routes, log) = routes();
        routes.add([TransportType::Http], "/ping", reply("a"));

        let err = routes.route(TransportType::Rest, "/ping", vec![]).unwrap_err();
        assert_eq!(
            err,
            RouteError::NotPermitted {
                method: "/ping".into(),
                transport: TransportType::Rest
            }
        );
        let err = routes.route(TransportType::Http, "/pong", vec![]).unwrap_err();
        assert_eq!(err, RouteError::UnknownMethod { method: "/pong".into() });

        assert_eq!(log.matching(LogLevel::ClientFault, "not permitted").len(), 1);
        assert_eq!(log.matching(LogLevel::Warning, "not found").len(), 1);
    }

    #[test]
    fn handler_runs_only_when_permitted() {
        let (routes, _) = routes();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        routes.add(
            [TransportType::Api],
            "count",
            Arc::new(move |_: &str, _: TransportType, _: Vec<Value>| {
                counter.fetch_add(1, Ordering::SeqCst);
                Value::Null
            }),
        );

        for transport in TransportType::ALL {
            let _ = routes.route(transport, "count", vec![]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_is_contained() {
        let (routes, log) = routes();
        routes.add(
            [TransportType::Http],
            "/boom",
            Arc::new(|_: &str, _: TransportType, _: Vec<Value>| -> Value { panic!("kaboom") }),
        );
        routes.add([TransportType::Http], "/ok", reply("ok"));

        let err = routes.route(TransportType::Http, "/boom", vec![]).unwrap_err();
        assert_eq!(
            err,
            RouteError::HandlerFailed {
                method: "/boom".into(),
                reason: "kaboom".into()
            }
        );
        assert_eq!(log.matching(LogLevel::ServerFault, "panicked").len(), 1);

        assert_eq!(routes.route(TransportType::Http, "/ok", vec![]).unwrap()["tag"], "ok");
        assert!(routes.contains("/boom"));
    }

    #[test]
    fn duplicate_active_key_keeps_first() {
        let (routes, log) = routes();
        assert!(routes.add([TransportType::Http], "/x", reply("first")));
        assert!(!routes.add([TransportType::Http, TransportType::Rest], "/x", reply("second")));

        assert_eq!(routes.route(TransportType::Http, "/x", vec![]).unwrap()["tag"], "first");
        assert!(!routes.is_permitted("/x", TransportType::Rest));
        assert_eq!(log.matching(LogLevel::Warning, "already active").len(), 1);
    }

    #[test]
    fn remove_is_true_once_and_key_can_return() {
        let (routes, _) = routes();
        routes.add([TransportType::Http], "/x", reply("old"));

        assert!(routes.remove("/x"));
        assert!(!routes.remove("/x"));
        assert!(!routes.contains("/x"));
        assert!(matches!(
            routes.route(TransportType::Http, "/x", vec![]),
            Err(RouteError::UnknownMethod { .. })
        ));

        assert!(routes.add([TransportType::Rest], "/x", reply("new")));
        assert_eq!(routes.route(TransportType::Rest, "/x", vec![]).unwrap()["tag"], "new");
        assert!(!routes.is_permitted("/x", TransportType::Http));
    }

    #[test]
    fn named_transports_skip_unknown_names() {
        let (routes, log) = routes();
        assert!(routes.add_named(&["http", "carrier-pigeon", "webSocket"], "/x", reply("a")));
        assert!(routes.is_permitted("/x", TransportType::Http));
        assert!(routes.is_permitted("/x", TransportType::WebSocket));
        assert!(log.contains("carrier-pigeon"));

        assert!(!routes.add_named(&["smoke-signal"], "/y", reply("b")));
        assert!(!routes.contains("/y"));
    }

    #[test]
    fn import_loads_whole_batch() {
        let (routes, _) = routes();
        let ok = routes.import_routes([
            ("status", RouteDescriptor::new(&["http", "rest"], "/ServiceStatus", reply("s"))),
            ("root", RouteDescriptor::new(&["http"], "/", reply("r"))),
        ]);
        assert!(ok);
        assert_eq!(routes.methods(), vec!["/", "/ServiceStatus"]);
    }

    #[test]
    fn malformed_import_adds_nothing() {
        let (routes, log) = routes();
        let empty: [&str; 0] = [];
        let ok = routes.import_routes([
            ("good", RouteDescriptor::new(&["http"], "/good", reply("g"))),
            ("no-method", RouteDescriptor::new(&["http"], "", reply("n"))),
            ("no-transports", RouteDescriptor::new(&empty, "/bare", reply("b"))),
        ]);
        assert!(!ok);
        assert!(routes.methods().is_empty());

        let entries = log.matching(LogLevel::Warning, "malformed");
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].values.as_ref().unwrap()["routes"],
            json!(["no-method", "no-transports"])
        );
    }
}
