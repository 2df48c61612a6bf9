//! Process configuration: network settings plus per-service overrides,
//! loaded from a TOML file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use switchyard_core::{ServiceDescriptor, TransportParseError, TransportSpec, TransportType};

use crate::network::config::NetworkConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    UnknownTransport(#[from] TransportParseError),
}

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    /// Overrides keyed by service namespace.
    pub services: BTreeMap<String, ServiceOverride>,
}

impl ServerConfig {
    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] when the file cannot be read and
    /// [`ConfigError::Parse`] when it is not valid configuration.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// # Errors
    ///
    /// [`ConfigError::Parse`] when `text` is not valid configuration.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Applies the override for the descriptor's namespace, if any.
    ///
    /// Returns `None` when the service is disabled.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownTransport`] when an override names a transport
    /// that does not exist.
    pub fn descriptor_for(&self, descriptor: ServiceDescriptor) -> Result<Option<ServiceDescriptor>, ConfigError> {
        match self.services.get(&descriptor.namespace) {
            None => Ok(Some(descriptor)),
            Some(over) if !over.enabled => Ok(None),
            Some(over) => over.apply(descriptor).map(Some),
        }
    }
}

/// Per-service adjustments on top of the compiled-in descriptor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceOverride {
    /// Port per transport name. 0 lets the OS pick. A transport the
    /// descriptor does not list is added.
    pub ports: BTreeMap<String, u16>,
    pub file_root: Option<PathBuf>,
    pub enabled: bool,
}

impl Default for ServiceOverride {
    fn default() -> Self {
        Self {
            ports: BTreeMap::new(),
            file_root: None,
            enabled: true,
        }
    }
}

impl ServiceOverride {
    /// # Errors
    ///
    /// [`ConfigError::UnknownTransport`] for an unrecognised transport name.
    pub fn apply(&self, mut descriptor: ServiceDescriptor) -> Result<ServiceDescriptor, ConfigError> {
        for (name, port) in &self.ports {
            let transport: TransportType = name.parse()?;
            let port = if transport.uses_port() { Some(*port) } else { None };
            match descriptor.transports.iter_mut().find(|spec| spec.transport == transport) {
                Some(spec) => spec.port = port,
                None => descriptor.transports.push(TransportSpec::new(transport, port)),
            }
        }
        if let Some(root) = &self.file_root {
            descriptor.file_root.clone_from(root);
        }
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::network::config::PortSharing;

    fn status() -> ServiceDescriptor {
        ServiceDescriptor::new("status")
            .transport(TransportType::Rest, Some(2600))
            .transport(TransportType::Api, None)
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = ServerConfig::from_toml_str("").unwrap();
        assert_eq!(config.network.host, "0.0.0.0");
        assert!(config.services.is_empty());
    }

    #[test]
    fn parses_network_and_services() {
        let config = ServerConfig::from_toml_str(
            r#"
            [network]
            host = "127.0.0.1"
            port_sharing = "exclusive"
            drain_timeout = 2.5

            [services.status]
            file_root = "/srv/status"

            [services.status.ports]
            rest = 8080
            webSocket = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.network.host, "127.0.0.1");
        assert_eq!(config.network.port_sharing, PortSharing::Exclusive);
        assert_eq!(config.network.drain_timeout, Duration::from_millis(2500));

        let descriptor = config.descriptor_for(status()).unwrap().unwrap();
        assert_eq!(descriptor.port_for(TransportType::Rest), Some(Some(8080)));
        assert_eq!(descriptor.port_for(TransportType::WebSocket), Some(Some(0)));
        assert_eq!(descriptor.port_for(TransportType::Api), Some(None));
        assert_eq!(descriptor.file_root, PathBuf::from("/srv/status"));
    }

    #[test]
    fn api_port_override_is_ignored() {
        let mut over = ServiceOverride::default();
        over.ports.insert("api".into(), 9000);
        let descriptor = over.apply(status()).unwrap();
        assert_eq!(descriptor.port_for(TransportType::Api), Some(None));
    }

    #[test]
    fn disabled_service_is_dropped() {
        let config = ServerConfig::from_toml_str("[services.status]\nenabled = false\n").unwrap();
        assert!(config.descriptor_for(status()).unwrap().is_none());
    }

    #[test]
    fn unknown_transport_is_an_error() {
        let mut over = ServiceOverride::default();
        over.ports.insert("carrier-pigeon".into(), 1);
        assert!(matches!(over.apply(status()), Err(ConfigError::UnknownTransport(_))));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = ServerConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchyard.toml");
        std::fs::write(&path, "[network]\nbody_limit = 1024\n").unwrap();
        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.network.body_limit, 1024);
    }
}
