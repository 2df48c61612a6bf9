//! Built-in status service: reports uptime and bound transports.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use switchyard_core::{LogSink, ServiceDescriptor, TransportType};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};

use super::routes::Routes;
use crate::traits::MeshService;

pub const STATUS_NAMESPACE: &str = "status";

/// Longest accepted command line on the raw stream.
const MAX_LINE: usize = 1024;

pub struct StatusService {
    descriptor: ServiceDescriptor,
    routes: Routes,
    started: Instant,
}

impl StatusService {
    /// Default transports: rest 2600, http 2680, webSocket 2688, socket on any
    /// port, and the api registry.
    #[must_use]
    pub fn default_descriptor() -> ServiceDescriptor {
        ServiceDescriptor::new(STATUS_NAMESPACE)
            .display_name("Service Status")
            .description("Reports uptime and the transports this process serves")
            .transport(TransportType::Rest, Some(2600))
            .transport(TransportType::Socket, None)
            .transport(TransportType::Http, Some(2680))
            .transport(TransportType::WebSocket, Some(2688))
            .transport(TransportType::Api, None)
    }

    #[must_use]
    pub fn new(log: Arc<dyn LogSink>) -> Self {
        Self::with_descriptor(Self::default_descriptor(), log)
    }

    #[must_use]
    pub fn with_descriptor(descriptor: ServiceDescriptor, log: Arc<dyn LogSink>) -> Self {
        let started = Instant::now();
        let routes = Routes::new(descriptor.namespace.clone(), log);

        let report = status_report(descriptor.clone(), started);
        routes.add(
            TransportType::ALL,
            "/ServiceStatus",
            Arc::new(move |_: &str, transport: TransportType, _: Vec<Value>| {
                let mut body = report();
                body["via"] = json!(transport);
                body
            }),
        );

        let display = descriptor.display_name.clone();
        routes.add(
            [TransportType::Http],
            "/",
            Arc::new(move |_: &str, _: TransportType, _: Vec<Value>| json!({ "service": display })),
        );

        Self {
            descriptor,
            routes,
            started,
        }
    }

    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

fn status_report(descriptor: ServiceDescriptor, started: Instant) -> impl Fn() -> Value + Send + Sync {
    move || {
        json!({
            "namespace": descriptor.namespace,
            "displayName": descriptor.display_name,
            "uptime": started.elapsed().as_secs(),
            "transports": descriptor.transports,
        })
    }
}

#[async_trait]
impl MeshService for StatusService {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    fn routes(&self) -> &Routes {
        &self.routes
    }

    /// Line protocol: `status`, `ping`, `quit`.
    async fn handle_stream(&self, stream: TcpStream, _peer: SocketAddr) -> anyhow::Result<()> {
        let mut lines = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE));
        while let Some(line) = lines.next().await {
            let line = line?;
            let reply = match line.trim() {
                "status" => status_report(self.descriptor.clone(), self.started)().to_string(),
                "ping" => "pong".to_string(),
                "quit" => break,
                "" => continue,
                _ => "unknown command".to_string(),
            };
            lines.send(reply).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use switchyard_core::MemoryLogSink;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    use super::*;

    fn service() -> StatusService {
        StatusService::new(Arc::new(MemoryLogSink::new()))
    }

    #[test]
    fn descriptor_is_valid() {
        let descriptor = StatusService::default_descriptor();
        assert!(descriptor.validate().is_ok());
        assert_eq!(descriptor.port_for(TransportType::Rest), Some(Some(2600)));
        assert_eq!(descriptor.port_for(TransportType::Socket), Some(None));
    }

    #[test]
    fn status_route_answers_every_transport() {
        let status = service();
        for transport in TransportType::ALL {
            let body = status
                .routes()
                .route(transport, "/ServiceStatus", vec![])
                .unwrap();
            assert_eq!(body["namespace"], "status");
            assert_eq!(body["displayName"], "Service Status");
            assert_eq!(body["via"], json!(transport));
            assert_eq!(body["transports"].as_array().map(Vec::len), Some(5));
        }
    }

    #[test]
    fn root_is_http_only() {
        let status = service();
        assert!(status.routes().route(TransportType::Http, "/", vec![]).is_ok());
        assert!(status.routes().route(TransportType::Rest, "/", vec![]).is_err());
    }

    #[test]
    fn api_request_wraps_route() {
        let status = service();
        let call = status.api_request(switchyard_core::ApiCall::new("/ServiceStatus", Value::Null, 0));
        assert!(call.is_ok());
        assert_eq!(call.data["namespace"], "status");

        let missing = status.api_request(switchyard_core::ApiCall::new("/nope", Value::Null, 0));
        assert!(!missing.is_ok());
    }

    #[tokio::test]
    async fn line_protocol() {
        let status = Arc::new(service());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = {
            let status = Arc::clone(&status);
            tokio::spawn(async move {
                let (stream, peer) = listener.accept().await.unwrap();
                status.handle_stream(stream, peer).await
            })
        };

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut read = BufReader::new(read).lines();

        write.write_all(b"ping\n").await.unwrap();
        assert_eq!(read.next_line().await.unwrap().as_deref(), Some("pong"));

        write.write_all(b"status\n").await.unwrap();
        let line = read.next_line().await.unwrap().unwrap();
        let body: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(body["namespace"], "status");

        write.write_all(b"dance\n").await.unwrap();
        assert_eq!(read.next_line().await.unwrap().as_deref(), Some("unknown command"));

        write.write_all(b"quit\n").await.unwrap();
        assert!(server.await.unwrap().is_ok());
    }
}
