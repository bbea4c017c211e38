use super::{ApiError, ApiResult};
use crate::auth::{IssuedToken, TERMINAL_TOKEN_HEADER};
use crate::state::AppState;
use crate::terminal::registry::MAX_SESSIONS_RANGE;
use crate::terminal::{SessionOptions, SessionSummary};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

fn terminal_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(TERMINAL_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
}

fn require_terminal(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if !state.terminal_enabled() {
        return Err(ApiError::Forbidden("terminal access is disabled"));
    }
    if !state.terminal_token_ok(terminal_token(headers)) {
        return Err(ApiError::Unauthorized("terminal password required"));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalStatus {
    enabled: bool,
    password_required: bool,
    default_shell: String,
    active_sessions: usize,
    max_sessions: usize,
}

pub async fn status(State(state): State<AppState>) -> Json<TerminalStatus> {
    Json(TerminalStatus {
        enabled: state.terminal_enabled(),
        password_required: state.password_required(),
        default_shell: state.registry.default_shell().path,
        active_sessions: state.registry.len(),
        max_sessions: state.registry.max_sessions(),
    })
}

#[derive(Debug, Deserialize)]
pub struct AuthRequestBody {
    #[serde(default)]
    password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

impl From<IssuedToken> for TokenResponse {
    fn from(issued: IssuedToken) -> Self {
        Self {
            token: issued.token,
            expires_at: issued.expires_at,
        }
    }
}

pub async fn authenticate(
    State(state): State<AppState>,
    Json(body): Json<AuthRequestBody>,
) -> ApiResult<TokenResponse> {
    if !state.terminal_enabled() {
        return Err(ApiError::Forbidden("terminal access is disabled"));
    }
    if !state.check_password(&body.password) {
        info!(target = "tidepool::http", "terminal password rejected");
        return Err(ApiError::Unauthorized("invalid password"));
    }
    Ok(Json(state.terminal_tokens.issue().into()))
}

#[derive(Debug, Serialize)]
pub struct Ack {
    success: bool,
}

pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Json<Ack> {
    if let Some(token) = terminal_token(&headers) {
        state.terminal_tokens.revoke(token);
    }
    Json(Ack { success: true })
}

pub async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Vec<SessionSummary>> {
    require_terminal(&state, &headers)?;
    Ok(Json(state.registry.list()))
}

/// An empty body creates a session with every option defaulted.
pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<SessionSummary>), ApiError> {
    require_terminal(&state, &headers)?;
    let options: SessionOptions = if body.iter().all(u8::is_ascii_whitespace) {
        SessionOptions::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| ApiError::BadRequest(format!("invalid session options: {err}")))?
    };
    let session = state.registry.create(options)?;
    Ok((StatusCode::CREATED, Json(session.summary())))
}

pub async fn kill_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> ApiResult<Ack> {
    require_terminal(&state, &headers)?;
    if state.registry.kill(&session_id) {
        Ok(Json(Ack { success: true }))
    } else {
        Err(ApiError::NotFound(format!("terminal session {session_id} not found")))
    }
}

#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    cols: i64,
    rows: i64,
}

#[derive(Debug, Serialize)]
pub struct ResizeResponse {
    applied: bool,
}

pub async fn resize_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(body): Json<ResizeRequest>,
) -> ApiResult<ResizeResponse> {
    require_terminal(&state, &headers)?;
    let session = state
        .registry
        .get(&session_id)
        .ok_or_else(|| ApiError::NotFound(format!("terminal session {session_id} not found")))?;
    let outcome = session.resize(body.cols, body.rows, false);
    Ok(Json(ResizeResponse {
        applied: outcome.is_applied(),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSettings {
    max_sessions: usize,
    min_max_sessions: usize,
    max_max_sessions: usize,
}

fn settings_of(state: &AppState) -> TerminalSettings {
    TerminalSettings {
        max_sessions: state.registry.max_sessions(),
        min_max_sessions: *MAX_SESSIONS_RANGE.start(),
        max_max_sessions: *MAX_SESSIONS_RANGE.end(),
    }
}

pub async fn get_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<TerminalSettings> {
    require_terminal(&state, &headers)?;
    Ok(Json(settings_of(&state)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    max_sessions: i64,
}

pub async fn update_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<SettingsUpdate>,
) -> ApiResult<TerminalSettings> {
    require_terminal(&state, &headers)?;
    let limit = usize::try_from(update.max_sessions)
        .ok()
        .filter(|limit| MAX_SESSIONS_RANGE.contains(limit))
        .ok_or_else(|| {
            ApiError::BadRequest(format!(
                "maxSessions must be between {} and {}",
                MAX_SESSIONS_RANGE.start(),
                MAX_SESSIONS_RANGE.end()
            ))
        })?;
    state.registry.set_max_sessions(limit);
    Ok(Json(settings_of(&state)))
}

pub async fn issue_ws_token(State(state): State<AppState>) -> ApiResult<TokenResponse> {
    Ok(Json(state.ws_tokens.issue().into()))
}
