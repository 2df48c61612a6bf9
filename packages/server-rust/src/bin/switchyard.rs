//! `switchyard`: runs the built-in services behind one network stack until
//! interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use switchyard_core::{LogSink, TracingLogSink};
use switchyard_server::service::{ServerConfig, ServiceContainer, StatusService};
use switchyard_server::NetworkStack;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "switchyard", about = "Multi-transport service host", version)]
struct Args {
    /// TOML configuration file.
    #[arg(short, long, env = "SWITCHYARD_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address, overriding the configuration file.
    #[arg(long, env = "SWITCHYARD_HOST")]
    host: Option<String>,

    /// Directory for daily access logs, overriding the configuration file.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Some(host) = args.host {
        config.network.host = host;
    }
    if let Some(dir) = args.log_dir {
        config.network.access_log_dir = Some(dir);
    }

    let log: Arc<dyn LogSink> = Arc::new(TracingLogSink);
    let stack = NetworkStack::new(config.network.clone(), Arc::clone(&log));
    let container = ServiceContainer::new(Arc::clone(&log));

    match config.descriptor_for(StatusService::default_descriptor())? {
        Some(descriptor) => {
            container.add(Arc::new(StatusService::with_descriptor(descriptor, Arc::clone(&log))));
        }
        None => warn!("status service disabled by configuration"),
    }

    let registrations = container.start_all(&stack).await?;
    for registration in &registrations {
        for bound in registration.bound() {
            info!(
                namespace = %registration.namespace,
                transport = %bound.transport,
                port = ?bound.port,
                shared = bound.shared,
                "listener ready"
            );
        }
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    container.shutdown_all(&stack).await;
    Ok(())
}
