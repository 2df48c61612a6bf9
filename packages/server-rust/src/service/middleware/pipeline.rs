//! Named-channel middleware pipeline.
//!
//! Each channel holds an ordered list of bindings. A binding is keyed by
//! `(channel, service namespace, middleware name)` and at most one binding
//! per key exists; the first registration wins. Calling a channel threads a
//! value through every bound handler in registration order.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use switchyard_core::{LogLevel, LogSink};

use super::channel::{normalize, BOOTSTRAP_CHANNELS};

/// A middleware function: receives the channel value and returns the value
/// for the next handler.
pub type MiddlewareHandler = Arc<dyn Fn(Value) -> Value + Send + Sync>;

struct Binding {
    namespace: String,
    middleware: String,
    handler: MiddlewareHandler,
}

struct ChannelSlot {
    name: String,
    bindings: Vec<Binding>,
}

/// Registry of channels and the middleware bound to them.
pub struct MiddlewarePipeline {
    channels: RwLock<Vec<ChannelSlot>>,
    log: Arc<dyn LogSink>,
}

impl MiddlewarePipeline {
    /// Creates a pipeline with the bootstrap channels and no bindings.
    #[must_use]
    pub fn new(log: Arc<dyn LogSink>) -> Self {
        let channels = BOOTSTRAP_CHANNELS
            .iter()
            .map(|name| ChannelSlot {
                name: (*name).to_string(),
                bindings: Vec::new(),
            })
            .collect();
        Self {
            channels: RwLock::new(channels),
            log,
        }
    }

    /// Adds a channel. Returns `false` if it already exists.
    pub fn register_channel(&self, channel: &str) -> bool {
        let name = normalize(channel);
        let mut channels = self.channels.write();
        if name.is_empty() || channels.iter().any(|slot| slot.name == name) {
            return false;
        }
        channels.push(ChannelSlot {
            name: name.clone(),
            bindings: Vec::new(),
        });
        drop(channels);
        self.log.note(
            "Middleware:registerChannel",
            LogLevel::Info,
            &format!("Registered middleware channel {name}"),
        );
        true
    }

    #[must_use]
    pub fn has_channel(&self, channel: &str) -> bool {
        let name = normalize(channel);
        self.channels.read().iter().any(|slot| slot.name == name)
    }

    /// Channel names in creation order.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.channels.read().iter().map(|slot| slot.name.clone()).collect()
    }

    /// Binds `handler` to `channel` for `namespace`/`middleware`.
    ///
    /// Rejects unknown channels and duplicate `(channel, namespace,
    /// middleware)` triples.
    pub fn add_middleware(
        &self,
        channel: &str,
        namespace: &str,
        middleware: &str,
        handler: MiddlewareHandler,
    ) -> bool {
        let name = normalize(channel);
        let values = json!({ "channel": name, "namespace": namespace, "middleware": middleware });
        let mut channels = self.channels.write();
        let Some(slot) = channels.iter_mut().find(|slot| slot.name == name) else {
            drop(channels);
            self.log.log(
                "Middleware:addMiddleware",
                LogLevel::ClientFault,
                &format!(
                    "Attempted to add a middleware for non-existent channel: {name} - for Service Namespace: {namespace}"
                ),
                Some(&values),
                None,
            );
            return false;
        };

        if slot
            .bindings
            .iter()
            .any(|b| b.namespace == namespace && b.middleware == middleware)
        {
            drop(channels);
            self.log.log(
                "Middleware:addMiddleware",
                LogLevel::Warning,
                &format!(
                    "Attempted to add duplicate middleware {middleware} for Service Namespace: {namespace} on Channel: {name}"
                ),
                Some(&values),
                None,
            );
            return false;
        }

        slot.bindings.push(Binding {
            namespace: namespace.to_string(),
            middleware: middleware.to_string(),
            handler,
        });
        drop(channels);
        self.log.log(
            "Middleware:addMiddleware",
            LogLevel::Info,
            &format!("A new middleware was added for Service Namespace: {namespace} on Channel: {name}"),
            Some(&values),
            None,
        );
        true
    }

    /// Unbinds the middleware registered under the given triple.
    pub fn remove_middleware(&self, channel: &str, namespace: &str, middleware: &str) -> bool {
        let name = normalize(channel);
        let mut channels = self.channels.write();
        let removed = channels
            .iter_mut()
            .find(|slot| slot.name == name)
            .and_then(|slot| {
                let pos = slot
                    .bindings
                    .iter()
                    .position(|b| b.namespace == namespace && b.middleware == middleware)?;
                Some(slot.bindings.remove(pos))
            })
            .is_some();
        drop(channels);

        if removed {
            self.log.note(
                "Middleware:removeMiddleware",
                LogLevel::Info,
                &format!("Removed middleware {middleware} for Service Namespace: {namespace} from Channel: {name}"),
            );
        } else {
            self.log.note(
                "Middleware:removeMiddleware",
                LogLevel::Warning,
                &format!("No middleware {middleware} bound for Service Namespace: {namespace} on Channel: {name}"),
            );
        }
        removed
    }

    /// Drops every binding owned by `namespace`. Returns how many were removed.
    pub fn remove_namespace(&self, namespace: &str) -> usize {
        let mut channels = self.channels.write();
        let mut removed = 0;
        for slot in channels.iter_mut() {
            let before = slot.bindings.len();
            slot.bindings.retain(|b| b.namespace != namespace);
            removed += before - slot.bindings.len();
        }
        removed
    }

    /// Number of bindings on `channel` (0 for unknown channels).
    #[must_use]
    pub fn binding_count(&self, channel: &str) -> usize {
        let name = normalize(channel);
        self.channels
            .read()
            .iter()
            .find(|slot| slot.name == name)
            .map_or(0, |slot| slot.bindings.len())
    }

    /// Threads `data` through the handlers bound to `channel`.
    ///
    /// Unknown channels log and return `data` unchanged.
    pub fn call_channel(&self, channel: &str, data: Value) -> Value {
        match self.handlers(channel) {
            Some(handlers) => handlers.iter().fold(data, |value, handler| handler(value)),
            None => data,
        }
    }

    /// Typed variant of [`call_channel`](Self::call_channel).
    ///
    /// Skips serialization when nothing is bound. If a handler returns a
    /// value that no longer deserializes as `T`, the original is kept.
    pub fn call_channel_typed<T>(&self, channel: &str, data: T) -> T
    where
        T: Serialize + DeserializeOwned,
    {
        let Some(handlers) = self.handlers(channel) else {
            return data;
        };
        if handlers.is_empty() {
            return data;
        }

        let value = match serde_json::to_value(&data) {
            Ok(value) => value,
            Err(e) => {
                self.log.note(
                    "Middleware:callChannel",
                    LogLevel::ServerFault,
                    &format!("Unable to encode value for channel {channel}: {e}"),
                );
                return data;
            }
        };
        let threaded = handlers.iter().fold(value, |value, handler| handler(value));
        match serde_json::from_value(threaded) {
            Ok(result) => result,
            Err(e) => {
                self.log.note(
                    "Middleware:callChannel",
                    LogLevel::ServerFault,
                    &format!("Middleware on channel {channel} returned an incompatible value: {e}"),
                );
                data
            }
        }
    }

    /// Snapshot of the handlers on `channel`, or `None` (logged) if the
    /// channel does not exist. The lock is released before handlers run.
    fn handlers(&self, channel: &str) -> Option<Vec<MiddlewareHandler>> {
        let name = normalize(channel);
        let channels = self.channels.read();
        if let Some(slot) = channels.iter().find(|slot| slot.name == name) {
            return Some(slot.bindings.iter().map(|b| Arc::clone(&b.handler)).collect());
        }
        drop(channels);
        self.log.note(
            "Middleware:callChannel",
            LogLevel::ClientFault,
            &format!("Attempted to call a non-existent channel: {name}"),
        );
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
