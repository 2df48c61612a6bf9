//! Service registration descriptors.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::transport::{TransportParseError, TransportSpec, TransportType};

/// Who may call a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Callable from inside the process (other services, api registry).
    Internal,
    /// Callable from outside the process.
    External,
}

/// Errors detected when validating a descriptor at registration time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("service namespace must not be empty")]
    EmptyNamespace,
    #[error("service namespace {0:?} contains whitespace")]
    InvalidNamespace(String),
    #[error("transport {transport} listed more than once for service {namespace}")]
    DuplicateTransport {
        namespace: String,
        transport: TransportType,
    },
    #[error("{transports} transports but {ports} ports for service {namespace}")]
    PortListMismatch {
        namespace: String,
        transports: usize,
        ports: usize,
    },
    #[error(transparent)]
    Transport(#[from] TransportParseError),
}

/// Static description of a service: identity plus the transports it accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Unique key across the container, router, and network stack.
    pub namespace: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    /// Ordered transport list; each transport at most once.
    #[serde(default)]
    pub transports: Vec<TransportSpec>,
    #[serde(default)]
    pub permissions: BTreeSet<Permission>,
    /// Root directory for static assets (`{file_root}/public`).
    #[serde(default)]
    pub file_root: PathBuf,
}

impl ServiceDescriptor {
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            display_name: namespace.clone(),
            namespace,
            description: String::new(),
            transports: Vec::new(),
            permissions: BTreeSet::from([Permission::Internal]),
            file_root: PathBuf::new(),
        }
    }

    #[must_use]
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: TransportType, port: Option<u16>) -> Self {
        self.transports.push(TransportSpec::new(transport, port));
        self
    }

    #[must_use]
    pub fn permission(mut self, permission: Permission) -> Self {
        self.permissions.insert(permission);
        self
    }

    #[must_use]
    pub fn file_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.file_root = root.into();
        self
    }

    /// Builds the transport list from two parallel lists of names and ports.
    ///
    /// # Errors
    ///
    /// Fails when the lists differ in length or a name is not a recognised
    /// transport.
    pub fn with_parallel_transports(
        mut self,
        transports: &[&str],
        ports: &[Option<u16>],
    ) -> Result<Self, DescriptorError> {
        if transports.len() != ports.len() {
            return Err(DescriptorError::PortListMismatch {
                namespace: self.namespace,
                transports: transports.len(),
                ports: ports.len(),
            });
        }
        for (name, port) in transports.iter().zip(ports) {
            let transport: TransportType = name.parse()?;
            self.transports.push(TransportSpec::new(transport, *port));
        }
        Ok(self)
    }

    /// Checks the invariants a network stack relies on.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.namespace.is_empty() {
            return Err(DescriptorError::EmptyNamespace);
        }
        if self.namespace.chars().any(char::is_whitespace) {
            return Err(DescriptorError::InvalidNamespace(self.namespace.clone()));
        }
        let mut seen = BTreeSet::new();
        for spec in &self.transports {
            if !seen.insert(spec.transport) {
                return Err(DescriptorError::DuplicateTransport {
                    namespace: self.namespace.clone(),
                    transport: spec.transport,
                });
            }
        }
        Ok(())
    }

    /// Requested port for `transport`, if the service lists it.
    #[must_use]
    pub fn port_for(&self, transport: TransportType) -> Option<Option<u16>> {
        self.transports
            .iter()
            .find(|spec| spec.transport == transport)
            .map(|spec| spec.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> ServiceDescriptor {
        ServiceDescriptor::new("status")
            .transport(TransportType::Rest, Some(2600))
            .transport(TransportType::WebSocket, Some(2688))
    }

    #[test]
    fn builder_keeps_transport_order() {
        let descriptor = status();
        let order: Vec<_> = descriptor.transports.iter().map(|s| s.transport).collect();
        assert_eq!(order, vec![TransportType::Rest, TransportType::WebSocket]);
        assert!(descriptor.validate().is_ok());
        assert_eq!(descriptor.port_for(TransportType::Rest), Some(Some(2600)));
        assert_eq!(descriptor.port_for(TransportType::Api), None);
    }

    #[test]
    fn empty_namespace_is_rejected() {
        let descriptor = ServiceDescriptor::new("");
        assert_eq!(descriptor.validate(), Err(DescriptorError::EmptyNamespace));
    }

    #[test]
    fn duplicate_transport_is_rejected() {
        let descriptor = status().transport(TransportType::Rest, None);
        assert!(matches!(
            descriptor.validate(),
            Err(DescriptorError::DuplicateTransport { transport: TransportType::Rest, .. })
        ));
    }

    #[test]
    fn parallel_lists_must_line_up() {
        let err = ServiceDescriptor::new("status")
            .with_parallel_transports(&["rest", "api"], &[Some(2600)])
            .unwrap_err();
        assert!(matches!(err, DescriptorError::PortListMismatch { transports: 2, ports: 1, .. }));

        let descriptor = ServiceDescriptor::new("status")
            .with_parallel_transports(
                &["rest", "socket", "http", "webSocket", "api"],
                &[Some(2600), None, Some(2680), Some(2688), None],
            )
            .unwrap();
        assert_eq!(descriptor.transports.len(), 5);
        assert_eq!(descriptor.port_for(TransportType::Socket), Some(None));
    }

    #[test]
    fn parallel_lists_reject_unknown_transport() {
        let err = ServiceDescriptor::new("status")
            .with_parallel_transports(&["gopher"], &[None])
            .unwrap_err();
        assert!(matches!(err, DescriptorError::Transport(_)));
    }

    #[test]
    fn deserializes_from_json_with_defaults() {
        let descriptor: ServiceDescriptor = serde_json::from_str(
            r#"{"namespace":"status","transports":[{"transport":"rest","port":2600}],"permissions":["internal","external"]}"#,
        )
        .unwrap();
        assert_eq!(descriptor.namespace, "status");
        assert_eq!(descriptor.permissions.len(), 2);
        assert!(descriptor.file_root.as_os_str().is_empty());
    }
}
