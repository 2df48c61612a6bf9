//! Transport taxonomy shared by routing, listeners, and service descriptors.
//!
//! Two views of the same set of protocols exist:
//!
//! - [`TransportType`] is the permission key carried by every inbound call
//!   and checked by a service's route table (`rest`, `socket`, `http`,
//!   `webSocket`, `api`).
//! - [`TransportBinding`] is the listener-construction view: the four
//!   listener families a network stack knows how to build, each carrying the
//!   parameters it needs. `rest` and `http` share one family and differ only
//!   in the managed-session sub-mode.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Inbound protocol a call arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransportType {
    /// Request/response with managed sessions.
    #[serde(rename = "rest")]
    Rest,
    /// Raw TCP stream.
    #[serde(rename = "socket")]
    Socket,
    /// Plain request/response.
    #[serde(rename = "http")]
    Http,
    /// Bidirectional push socket.
    #[serde(rename = "webSocket")]
    WebSocket,
    /// In-process call through the api registry.
    #[serde(rename = "api")]
    Api,
}

impl TransportType {
    /// Every recognised transport, in canonical order.
    pub const ALL: [TransportType; 5] = [
        TransportType::Rest,
        TransportType::Socket,
        TransportType::Http,
        TransportType::WebSocket,
        TransportType::Api,
    ];

    /// Wire name used in descriptors and log lines.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rest => "rest",
            Self::Socket => "socket",
            Self::Http => "http",
            Self::WebSocket => "webSocket",
            Self::Api => "api",
        }
    }

    /// Listener family for this transport with the requested port.
    ///
    /// `None` and `Some(0)` both mean "any available port".
    #[must_use]
    pub fn binding(self, port: Option<u16>) -> TransportBinding {
        let port = port.unwrap_or(0);
        match self {
            Self::Rest => TransportBinding::RequestResponse {
                port,
                managed_session: true,
            },
            Self::Http => TransportBinding::RequestResponse {
                port,
                managed_session: false,
            },
            Self::Socket => TransportBinding::RawStream { port },
            Self::WebSocket => TransportBinding::PushSocket { port },
            Self::Api => TransportBinding::InProcess,
        }
    }

    /// Whether calls on this transport arrive over a bound network port.
    #[must_use]
    pub fn uses_port(self) -> bool {
        !matches!(self, Self::Api)
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a transport name is not one of the recognised set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognised transport type: {0}")]
pub struct TransportParseError(pub String);

impl FromStr for TransportType {
    type Err = TransportParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rest" => Ok(Self::Rest),
            "socket" => Ok(Self::Socket),
            "http" => Ok(Self::Http),
            "webSocket" | "websocket" => Ok(Self::WebSocket),
            "api" => Ok(Self::Api),
            other => Err(TransportParseError(other.to_string())),
        }
    }
}

/// Listener family plus its construction parameters.
///
/// Adding a family here forces every listener factory to handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportBinding {
    /// HTTP listener. `managed_session` enables cookie-backed sessions.
    RequestResponse { port: u16, managed_session: bool },
    /// TCP accept loop handing each connection to the service.
    RawStream { port: u16 },
    /// WebSocket listener with peer tracking.
    PushSocket { port: u16 },
    /// Registration in the in-process api registry. Binds no port.
    InProcess,
}

impl TransportBinding {
    /// Requested port, or `None` for in-process bindings.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        match *self {
            Self::RequestResponse { port, .. } | Self::RawStream { port } | Self::PushSocket { port } => {
                Some(port)
            }
            Self::InProcess => None,
        }
    }
}

/// One entry of a service's transport list: which transport, on which port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportSpec {
    pub transport: TransportType,
    /// Requested port; `None` or `0` binds any available port.
    #[serde(default)]
    pub port: Option<u16>,
}

impl TransportSpec {
    #[must_use]
    pub fn new(transport: TransportType, port: Option<u16>) -> Self {
        Self { transport, port }
    }

    #[must_use]
    pub fn binding(&self) -> TransportBinding {
        self.transport.binding(self.port)
    }
}
