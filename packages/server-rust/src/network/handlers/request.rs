//! Request/response dispatch: axum request in, service call, JSON out.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Form, FromRequest, Query, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use switchyard_core::{LogLevel, LogSink, TransportType};

use crate::network::session::{parse_cookies, SessionId};
use crate::network::shutdown::DrainController;
use crate::service::middleware::{MiddlewarePipeline, REQUEST, RESPONSE};
use crate::traits::MeshService;

/// Transport-neutral view of one HTTP request handed to a service.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InboundRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// What a service answers; rendered as a JSON response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundResponse {
    pub status: u16,
    pub body: Value,
}

impl OutboundResponse {
    #[must_use]
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    #[must_use]
    pub fn with_status(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    /// Uniform answer for unknown and disallowed routes alike.
    #[must_use]
    pub fn not_found() -> Self {
        Self {
            status: 404,
            body: json!({ "error": "not found" }),
        }
    }

    #[must_use]
    pub fn internal_error() -> Self {
        Self {
            status: 500,
            body: json!({ "error": "internal error" }),
        }
    }
}

impl IntoResponse for OutboundResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.body)).into_response()
    }
}

/// Why an inbound request could not be turned into an [`InboundRequest`].
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("request body is unreadable or exceeds the size limit")]
    Body,
    #[error("malformed JSON body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed form body")]
    Form,
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Body => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Json(_) | Self::Form => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl InboundRequest {
    /// Reads method, path, query, headers, cookies, session and body.
    ///
    /// # Errors
    ///
    /// [`RequestError`] when the body is too large or does not parse as its
    /// declared content type.
    pub async fn read(request: Request, body_limit: usize) -> Result<Self, RequestError> {
        let (parts, body) = request.into_parts();

        let query = Query::<BTreeMap<String, String>>::try_from_uri(&parts.uri)
            .map(|Query(query)| query)
            .unwrap_or_default();
        let cookies = parse_cookies(&parts.headers).into_iter().collect();
        let session_id = parts.extensions.get::<SessionId>().map(|id| id.0.clone());

        let bytes = axum::body::to_bytes(body, body_limit)
            .await
            .map_err(|_| RequestError::Body)?;
        let body = parse_body(&parts.headers, bytes).await?;

        Ok(Self {
            method: parts.method.to_string(),
            path: parts.uri.path().to_string(),
            query,
            headers: header_map(&parts.headers),
            cookies,
            body,
            session_id,
        })
    }
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else { continue };
        map.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    map
}

/// JSON, urlencoded form, or text, chosen by `Content-Type`.
async fn parse_body(headers: &HeaderMap, bytes: Bytes) -> Result<Value, RequestError> {
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("application/json") || content_type.contains("+json") {
        return Ok(serde_json::from_slice(&bytes)?);
    }
    if content_type.starts_with("application/x-www-form-urlencoded") {
        let request = Request::builder()
            .method(Method::POST)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(bytes))
            .map_err(|_| RequestError::Form)?;
        let Form(fields) = Form::<BTreeMap<String, String>>::from_request(request, &())
            .await
            .map_err(|_| RequestError::Form)?;
        return Ok(json!(fields));
    }
    Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
}

/// Shared state of one request/response listener.
#[derive(Clone)]
pub struct RequestState {
    pub service: Arc<dyn MeshService>,
    pub transport: TransportType,
    pub middleware: Arc<MiddlewarePipeline>,
    /// Extra middleware channels threaded after `REQUEST`.
    pub channels: Arc<[String]>,
    pub drain: Arc<DrainController>,
    pub body_limit: usize,
    pub log: Arc<dyn LogSink>,
}

/// Catch-all handler behind the static file service.
pub async fn dispatch_handler(State(state): State<RequestState>, request: Request) -> Response {
    if !state.drain.is_accepting() {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "unavailable" }))).into_response();
    }
    let _guard = state.drain.in_flight_guard();

    let inbound = match InboundRequest::read(request, state.body_limit).await {
        Ok(inbound) => inbound,
        Err(err) => {
            state.log.log(
                "Network:request",
                LogLevel::ClientFault,
                &format!("Rejected request for {}: {err}", state.service.namespace()),
                Some(&json!({ "namespace": state.service.namespace(), "transport": state.transport })),
                None,
            );
            return err.into_response();
        }
    };

    let inbound = state.middleware.call_channel_typed(REQUEST, inbound);
    let inbound = state
        .channels
        .iter()
        .fold(inbound, |request, channel| state.middleware.call_channel_typed(channel, request));

    let response = state.service.service_request(inbound, state.transport);
    state.middleware.call_channel_typed(RESPONSE, response).into_response()
}
