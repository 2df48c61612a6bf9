//! Raw TCP stream listener: accept loop handing each connection to the
//! service.

use std::sync::Arc;

use serde_json::json;
use switchyard_core::{LogLevel, LogSink};
use tokio::net::TcpListener;
use tokio::task::JoinSet;

use crate::network::shutdown::DrainController;
use crate::traits::MeshService;

/// Accepts connections until draining starts, then waits for the open ones.
///
/// Connection tasks live in a `JoinSet`, so aborting this future aborts
/// every connection with it.
pub async fn serve_stream(
    listener: TcpListener,
    service: Arc<dyn MeshService>,
    drain: Arc<DrainController>,
    log: Arc<dyn LogSink>,
) {
    let namespace = service.namespace().to_string();
    let mut connections = JoinSet::new();
    let drained = drain.drained();
    tokio::pin!(drained);
    drain.set_serving();

    loop {
        tokio::select! {
            () = &mut drained => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let guard = drain.in_flight_guard();
                    let service = Arc::clone(&service);
                    let log = Arc::clone(&log);
                    connections.spawn(async move {
                        let _guard = guard;
                        if let Err(err) = service.handle_stream(stream, peer).await {
                            log.log(
                                "Network:stream",
                                LogLevel::Warning,
                                &format!("Stream from {peer} on {} ended with an error: {err}", service.namespace()),
                                Some(&json!({ "namespace": service.namespace(), "peer": peer.to_string() })),
                                None,
                            );
                        }
                    });
                }
                Err(err) => {
                    log.log(
                        "Network:stream",
                        LogLevel::ServerFault,
                        &format!("Accept failed on {namespace}: {err}"),
                        None,
                        None,
                    );
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
}
