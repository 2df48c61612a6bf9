use std::net::SocketAddr;

use async_trait::async_trait;
use serde_json::Value;
use switchyard_core::{ApiCall, ServiceDescriptor, TransportType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::network::connection::SocketEvents;
use crate::network::handlers::{InboundRequest, OutboundResponse};
use crate::service::container::ServiceContext;
use crate::service::routes::{RouteError, Routes};

/// Greeting written by the default raw-stream handler.
pub const STREAM_GREETING: &[u8] = b"hello\r\n";

/// Identifier the network stack assigns to each active service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(pub u64);

/// A service the network stack can bind to transports.
///
/// Every listener funnels inbound traffic through one of the entry points
/// below, tagged with the transport it arrived on. The defaults delegate to
/// the service's [`Routes`].
#[async_trait]
pub trait MeshService: Send + Sync + 'static {
    fn descriptor(&self) -> &ServiceDescriptor;

    fn routes(&self) -> &Routes;

    fn namespace(&self) -> &str {
        &self.descriptor().namespace
    }

    /// Runs once before the service is bound.
    async fn init(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs once after every listener of the service is unbound.
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Request/response entry point. Called exactly once per inbound call.
    ///
    /// Routes by path with the request itself as the only payload element.
    /// Unknown and disallowed routes both answer 404; a failed handler
    /// answers 500.
    fn service_request(&self, request: InboundRequest, transport: TransportType) -> OutboundResponse {
        let method = request.path.clone();
        let payload = serde_json::to_value(&request).unwrap_or(Value::Null);
        match self.routes().route(transport, &method, vec![payload]) {
            Ok(body) => OutboundResponse::ok(body),
            Err(RouteError::HandlerFailed { .. }) => OutboundResponse::internal_error(),
            Err(_) => OutboundResponse::not_found(),
        }
    }

    /// In-process entry point used by the api registry.
    fn api_request(&self, mut call: ApiCall) -> ApiCall {
        match self
            .routes()
            .route(TransportType::Api, &call.method, vec![call.data.clone()])
        {
            Ok(data) => call.respond(data),
            Err(err) => call.fail(err.to_string()),
        }
        call
    }

    /// Push-socket hook, called once per connection before any event is
    /// read. Events left unregistered fall back to [`Routes`].
    fn socket_events(&self, _events: &mut SocketEvents) {}

    /// Raw-stream entry point: owns the connection until it returns.
    ///
    /// The default greets and then echoes bytes back.
    async fn handle_stream(&self, mut stream: TcpStream, _peer: SocketAddr) -> anyhow::Result<()> {
        stream.write_all(STREAM_GREETING).await?;
        let mut buf = vec![0u8; 4096];
        loop {
            let read = stream.read(&mut buf).await?;
            if read == 0 {
                return Ok(());
            }
            stream.write_all(&buf[..read]).await?;
        }
    }
}
