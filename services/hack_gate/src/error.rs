//! Unified API error type — every 4xx/5xx response is JSON with a consistent shape.
//!
//! ```json
//! { "code": "parse_error", "message": "Main.vm:3: unknown command 'jump'", "detail": { ... } }
//! ```

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use hack_vm::{BuildError, LinkError, ParseError, RuntimeError};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub detail: Option<Value>,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", msg)
    }

    pub fn not_found(resource: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", format!("{resource} not found"))
    }

    pub fn unsupported_media_type() -> Self {
        Self::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "unsupported_media_type",
            "content-type must be application/json",
        )
    }

    pub fn unprocessable(code: &'static str, msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, code, msg)
    }

    pub fn bad_gateway(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "bad_gateway", msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
    }
}

impl From<ParseError> for AppError {
    fn from(e: ParseError) -> Self {
        let detail = serde_json::to_value(&e).unwrap_or(Value::Null);
        Self::unprocessable("parse_error", e.to_string()).with_detail(detail)
    }
}

impl From<LinkError> for AppError {
    fn from(e: LinkError) -> Self {
        let detail = serde_json::to_value(&e).unwrap_or(Value::Null);
        Self::unprocessable("link_error", e.to_string()).with_detail(detail)
    }
}

impl From<BuildError> for AppError {
    fn from(e: BuildError) -> Self {
        match e {
            BuildError::Parse(e) => e.into(),
            BuildError::Link(e) => e.into(),
        }
    }
}

/// Host memory access outside the address space.
impl From<RuntimeError> for AppError {
    fn from(e: RuntimeError) -> Self {
        Self::bad_request(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            code: self.code,
            message: self.message,
            detail: self.detail,
        };
        let mut resp = (self.status, Json(body)).into_response();
        resp.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        resp
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.status.as_u16(), self.code, self.message)
    }
}

impl std::error::Error for AppError {}
