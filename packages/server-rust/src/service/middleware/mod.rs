//! Middleware interception on named channels.
//!
//! - [`channel`]: channel names and normalisation
//! - [`pipeline`]: the binding registry and channel dispatch

pub mod channel;
pub mod pipeline;

pub use channel::{BOOTSTRAP_CHANNELS, POST_API_CALL, PRE_API_CALL, REQUEST, RESPONSE};
pub use pipeline::{MiddlewareHandler, MiddlewarePipeline};
