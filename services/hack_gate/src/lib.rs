pub mod api;
pub mod error;
pub mod session;

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;
use session::SessionStore;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Max request body size: 1 MiB
const MAX_BODY_BYTES: usize = 1_048_576;
/// Request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionStore,
    /// Base URL of the compile service.
    pub compile_url: String,
    pub http: reqwest::Client,
    /// Default `/run` budget.
    pub steps_per_tick: u64,
}

impl AppState {
    pub fn new(sessions: SessionStore, compile_url: impl Into<String>, steps_per_tick: u64) -> Self {
        Self {
            sessions,
            compile_url: compile_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            steps_per_tick,
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            SessionStore::from_env(),
            hack_config::COMPILE_URL.as_str(),
            *hack_config::STEPS_PER_TICK,
        )
    }
}

pub fn app() -> Router {
    app_with_state(AppState::from_env())
}

pub fn app_with_state(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/sessions", post(api::create_session))
        .route(
            "/v1/sessions/:id",
            get(api::get_session).delete(api::delete_session),
        )
        .route("/v1/sessions/:id/step", post(api::step))
        .route("/v1/sessions/:id/run", post(api::run))
        .route("/v1/sessions/:id/pause", post(api::pause))
        .route("/v1/sessions/:id/reset", post(api::reset))
        .route(
            "/v1/sessions/:id/memory",
            get(api::read_memory).put(api::write_memory),
        )
        .route("/v1/sessions/:id/screen", get(api::screen))
        .route("/v1/sessions/:id/keyboard", put(api::keyboard))
        .route("/v1/compile", post(api::compile))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(middleware::from_fn(require_json_content_type))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Middleware: reject POST/PUT requests without application/json content-type.
async fn require_json_content_type(req: Request, next: Next) -> Response {
    let is_json = match req.method().as_str() {
        "POST" | "PUT" | "PATCH" => req
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("application/json"))
            .unwrap_or(false),
        _ => true, // GET, DELETE, OPTIONS don't need content-type
    };
    if !is_json {
        return error::AppError::unsupported_media_type().into_response();
    }
    next.run(req).await
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({"ok": true}))
}

pub mod test {
    use super::AppState;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    /// Spawn the server on a random port. Returns the address and a
    /// JoinHandle that keeps the server alive until dropped.
    pub async fn spawn() -> (SocketAddr, tokio::task::JoinHandle<()>) {
        spawn_with(AppState::from_env()).await
    }

    pub async fn spawn_with(state: AppState) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        serve(super::app_with_state(state)).await
    }

    /// Serve any router on a random port; also used for fake upstreams.
    pub async fn serve(router: axum::Router) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (addr, handle)
    }
}
