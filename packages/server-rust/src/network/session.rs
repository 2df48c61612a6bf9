//! Cookie-backed in-memory sessions for managed request/response listeners.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use dashmap::DashMap;
use serde_json::Value;
use switchyard_core::{ClockSource, SystemClock};
use uuid::Uuid;

/// Session id attached to request extensions by [`session_layer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId(pub String);

#[derive(Debug, Clone)]
pub struct Session {
    pub created_at: u64,
    pub last_seen: u64,
    pub data: Value,
}

/// Process-wide session table shared by every managed listener.
///
/// Sessions idle for longer than the ttl expire. Expired sessions are
/// dropped when next looked up and by [`SessionStore::sweep`], which
/// [`SessionStore::create`] runs at most once per ttl. A zero ttl keeps
/// sessions until they are destroyed.
pub struct SessionStore {
    cookie_name: String,
    ttl_ms: u64,
    sessions: DashMap<String, Session>,
    last_sweep: AtomicU64,
    clock: Arc<dyn ClockSource>,
}

impl SessionStore {
    #[must_use]
    pub fn new(cookie_name: impl Into<String>, ttl: Duration) -> Self {
        Self::with_clock(cookie_name, ttl, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(cookie_name: impl Into<String>, ttl: Duration, clock: Arc<dyn ClockSource>) -> Self {
        let last_sweep = AtomicU64::new(clock.now());
        Self {
            cookie_name: cookie_name.into(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            sessions: DashMap::new(),
            last_sweep,
            clock,
        }
    }

    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    fn is_expired(&self, session: &Session, now: u64) -> bool {
        self.ttl_ms > 0 && now.saturating_sub(session.last_seen) > self.ttl_ms
    }

    /// Drops every expired session and returns how many went.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        self.last_sweep.store(now, Ordering::Relaxed);
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !self.is_expired(session, now));
        before.saturating_sub(self.sessions.len())
    }

    /// Starts a new empty session and returns its id.
    pub fn create(&self) -> String {
        let now = self.clock.now();
        if self.ttl_ms > 0 && now.saturating_sub(self.last_sweep.load(Ordering::Relaxed)) >= self.ttl_ms {
            self.sweep();
        }
        let id = Uuid::new_v4().to_string();
        self.sessions.insert(
            id.clone(),
            Session {
                created_at: now,
                last_seen: now,
                data: Value::Null,
            },
        );
        id
    }

    /// Marks `id` as seen. False when the session is unknown or has
    /// expired; an expired session is dropped.
    pub fn touch(&self, id: &str) -> bool {
        let now = self.clock.now();
        if self.sessions.remove_if(id, |_, session| self.is_expired(session, now)).is_some() {
            return false;
        }
        match self.sessions.get_mut(id) {
            Some(mut session) => {
                session.last_seen = now;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Session> {
        let now = self.clock.now();
        self.sessions
            .get(id)
            .filter(|session| !self.is_expired(session, now))
            .map(|s| s.clone())
    }

    /// Replaces the data stored for `id`.
    pub fn set_data(&self, id: &str, data: Value) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut session) => {
                session.data = data;
                true
            }
            None => false,
        }
    }

    pub fn destroy(&self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    /// Drops every session.
    pub fn clear(&self) {
        self.sessions.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Parses every `Cookie` header into `(name, value)` pairs.
#[must_use]
pub fn parse_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|line| line.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_string(), value.trim().trim_matches('"').to_string()))
        })
        .collect()
}

/// Resumes the session named by the cookie or starts a fresh one, exposing
/// its id as a [`SessionId`] request extension.
pub async fn session_layer(State(store): State<Arc<SessionStore>>, mut request: Request, next: Next) -> Response {
    let resumed = parse_cookies(request.headers())
        .into_iter()
        .find(|(name, _)| name == store.cookie_name())
        .map(|(_, id)| id)
        .filter(|id| store.touch(id));

    let (id, fresh) = match resumed {
        Some(id) => (id, false),
        None => (store.create(), true),
    };
    request.extensions_mut().insert(SessionId(id.clone()));

    let mut response = next.run(request).await;
    if fresh {
        let cookie = format!("{}={id}; Path=/; HttpOnly", store.cookie_name());
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }
    response
}
