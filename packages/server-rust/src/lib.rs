//! `Switchyard` Server: binds services to rest, http, socket, webSocket and
//! in-process transports behind one network stack.

pub mod network;
pub mod service;
pub mod traits;

pub use network::{NetworkConfig, NetworkError, NetworkStack};
pub use service::{ServerConfig, ServiceContainer, ServiceContext, StatusService};
pub use traits::{MeshService, ServiceId};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
