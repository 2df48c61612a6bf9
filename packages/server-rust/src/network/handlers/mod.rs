//! Listener handlers, one per transport binding:
//!
//! - [`request`]: request/response (`rest`, `http`)
//! - [`stream`]: raw stream (`socket`)
//! - [`websocket`]: push socket (`webSocket`)

pub mod request;
pub mod stream;
pub mod websocket;

pub use request::{dispatch_handler, InboundRequest, OutboundResponse, RequestError, RequestState};
pub use stream::serve_stream;
pub use websocket::{ws_upgrade_handler, PushParams, PushState, ERROR_EVENT};
