//! Daily access log per service namespace: `access-{namespace}-{YYYYMMDD}.log`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use switchyard_core::clock::day_stamp;
use switchyard_core::{ClockSource, SystemClock};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

struct OpenFile {
    day: String,
    file: File,
}

/// Appends one line per request, rolling to a new file when the UTC day
/// changes.
pub struct AccessLog {
    dir: PathBuf,
    namespace: String,
    clock: Arc<dyn ClockSource>,
    current: Mutex<Option<OpenFile>>,
}

impl AccessLog {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
        Self::with_clock(dir, namespace, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(dir: impl Into<PathBuf>, namespace: impl Into<String>, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            dir: dir.into(),
            namespace: namespace.into(),
            clock,
            current: Mutex::new(None),
        }
    }

    /// File name for `namespace` on the day stamped `day`.
    #[must_use]
    pub fn file_name(namespace: &str, day: &str) -> String {
        format!("access-{namespace}-{day}.log")
    }

    #[must_use]
    pub fn path_for(&self, day: &str) -> PathBuf {
        self.dir.join(Self::file_name(&self.namespace, day))
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Appends `line` to today's file.
    ///
    /// # Errors
    ///
    /// Propagates directory creation, open, and write failures.
    pub async fn record(&self, line: &str) -> std::io::Result<()> {
        let day = day_stamp(self.clock.now());
        let mut current = self.current.lock().await;

        let stale = !matches!(current.as_ref(), Some(open) if open.day == day);
        if stale {
            tokio::fs::create_dir_all(&self.dir).await?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path_for(&day))
                .await?;
            *current = Some(OpenFile { day, file });
        }

        if let Some(open) = current.as_mut() {
            open.file.write_all(line.as_bytes()).await?;
            open.file.write_all(b"\n").await?;
            open.file.flush().await?;
        }
        Ok(())
    }
}

/// Writes `{remote} "{METHOD} {uri} {version}" {status} {millis}ms` for every
/// request passing through.
pub async fn access_log_layer(State(log): State<Arc<AccessLog>>, request: Request, next: Next) -> Response {
    let started = Instant::now();
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "-".to_string(), |info| info.0.to_string());
    let request_line = format!("{} {} {:?}", request.method(), request.uri(), request.version());

    let response = next.run(request).await;

    let line = format!(
        "{remote} \"{request_line}\" {} {}ms",
        response.status().as_u16(),
        started.elapsed().as_millis()
    );
    if let Err(err) = log.record(&line).await {
        tracing::warn!(namespace = %log.namespace, error = %err, "access log write failed");
    }
    response
}
