//! Service-side plumbing:
//!
//! 1. **Routes** (`routes`): per-service method table gated by transport
//! 2. **Middleware** (`middleware`): named interception channels
//! 3. **Api registry** (`api`): in-process calls between services
//! 4. **Container** (`container`): lifecycle of the services in this process
//! 5. **Status** (`status`): the built-in status service

pub mod api;
pub mod config;
pub mod container;
pub mod middleware;
pub mod routes;
pub mod status;

pub use api::{ApiHandler, ApiNode, ApiRegistry, RESERVED_NAMESPACES};
pub use config::{ConfigError, ServerConfig, ServiceOverride};
pub use container::{ServiceContainer, ServiceContext};
pub use middleware::{MiddlewareHandler, MiddlewarePipeline};
pub use routes::{RouteDescriptor, RouteError, RouteHandler, Routes};
pub use status::{StatusService, STATUS_NAMESPACE};
