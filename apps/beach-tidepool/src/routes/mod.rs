mod terminal;
mod ws;

use crate::auth::AuthRequest;
use crate::state::AppState;
use crate::terminal::SessionError;
use axum::{
    extract::{Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use std::collections::HashMap;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/terminal/status", get(terminal::status))
        .route("/api/terminal/auth", post(terminal::authenticate))
        .route("/api/terminal/logout", post(terminal::logout))
        .route(
            "/api/terminal/sessions",
            get(terminal::list_sessions).post(terminal::create_session),
        )
        .route("/api/terminal/sessions/:session_id", delete(terminal::kill_session))
        .route(
            "/api/terminal/sessions/:session_id/resize",
            post(terminal::resize_session),
        )
        .route(
            "/api/terminal/settings",
            get(terminal::get_settings).put(terminal::update_settings),
        )
        .route("/api/auth/ws-token", post(terminal::issue_ws_token))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_auth));

    Router::new()
        .route("/health", get(health_check))
        .route("/api/terminal/ws", get(ws::terminal_socket))
        .merge(api)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

async fn require_api_auth(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let allowed = state.authenticator.authenticate(&AuthRequest {
        headers: request.headers(),
        query: &query,
    });
    if !allowed {
        return Err(ApiError::Unauthorized("authentication required"));
    }
    Ok(next.run(request).await)
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(&'static str),
    Forbidden(&'static str),
    NotFound(String),
    BadRequest(String),
    TooManyRequests(String),
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg.to_string()),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg.to_string()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::TooManyRequests(msg) => {
                (StatusCode::TOO_MANY_REQUESTS, "too_many_sessions", msg)
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", msg),
        };
        (
            status,
            Json(ApiErrorBody {
                error,
                message: Some(message),
            }),
        )
            .into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::MaxSessionsReached { .. } => ApiError::TooManyRequests(err.to_string()),
            SessionError::NotFound(_) => ApiError::NotFound(err.to_string()),
            SessionError::Spawn { .. } => ApiError::Internal(err.to_string()),
        }
    }
}
