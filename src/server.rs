//!
//! marketgate HTTP server
//! ----------------------
//! This module defines the Axum-based HTTP API for the custom auth path.
//! It exposes a single multiplexed endpoint: `POST /custom-auth` with a
//! JSON body carrying a `path` field selecting the operation
//! (`/register`, `/login`, `/verify-pin`, `/reset-password`, `/logout`).
//!
//! Responsibilities:
//! - Account operations delegating to the local directory (Argon2 hashes).
//! - Opaque 7-day session tokens via the session manager.
//! - `GET /session` to turn a bearer token back into a principal.
//! - Error bodies with the shared status mapping.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{extract::State, Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::error::{AppError, AppResult};
use crate::identity::{LocalDirectory, Registration, Role, SessionManager};
use crate::repository::FileRepository;

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub directory: LocalDirectory,
    pub sessions: Arc<SessionManager>,
}

/// One call against the multiplexed auth endpoint. Field presence depends on
/// the selected `path`.
#[derive(Debug, Deserialize)]
struct AuthCall {
    path: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    pin: Option<String>,
    #[serde(default)]
    new_password: Option<String>,
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

fn require<'a>(field: &'a Option<String>, name: &str) -> AppResult<&'a str> {
    field
        .as_deref()
        .ok_or_else(|| AppError::user("missing_field", format!("field '{}' is required", name)))
}

fn error_body(e: &AppError) -> (StatusCode, serde_json::Value) {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, json!({"status": "error", "code": e.code_str(), "error": e.message()}))
}

/// Route one auth call. Split out of the handler so the dispatch table can be
/// exercised without a socket.
fn dispatch(state: &AppState, call: &AuthCall) -> (StatusCode, serde_json::Value) {
    let out = match call.path.as_str() {
        "/register" => register(state, call),
        "/login" => login(state, call),
        "/verify-pin" => verify_pin(state, call),
        "/reset-password" => reset_password(state, call),
        "/logout" => logout(state, call),
        other => Err(AppError::not_found("unknown_path", format!("no auth operation at '{}'", other))),
    };
    match out {
        Ok(value) => (StatusCode::OK, value),
        Err(e) => {
            // caller mistakes are routine; only transient failures are server errors
            if e.is_transient() {
                error!(target: "marketgate::server", "custom-auth {} failed: {}", call.path, e);
            } else {
                info!(target: "marketgate::server", "custom-auth {} rejected: {}", call.path, e);
            }
            error_body(&e)
        }
    }
}

fn register(state: &AppState, call: &AuthCall) -> AppResult<serde_json::Value> {
    let reg = Registration {
        username: require(&call.username, "username")?.to_string(),
        password: require(&call.password, "password")?.to_string(),
        pin: require(&call.pin, "pin")?.to_string(),
        role: call.role.unwrap_or(Role::Client),
        first_name: call.first_name.clone().unwrap_or_default(),
        last_name: call.last_name.clone().unwrap_or_default(),
    };
    let principal = state.directory.register(&reg)?;
    let session = state.sessions.issue(principal.clone());
    Ok(json!({
        "status": "ok",
        "token": session.token,
        "expires_at": session.expires_at,
        "user": principal,
    }))
}

fn login(state: &AppState, call: &AuthCall) -> AppResult<serde_json::Value> {
    let username = require(&call.username, "username")?;
    let password = require(&call.password, "password")?;
    let principal = state.directory.login(username, password)?;
    let session = state.sessions.issue(principal.clone());
    Ok(json!({
        "status": "ok",
        "token": session.token,
        "expires_at": session.expires_at,
        "user": principal,
    }))
}

fn verify_pin(state: &AppState, call: &AuthCall) -> AppResult<serde_json::Value> {
    let username = require(&call.username, "username")?;
    let pin = require(&call.pin, "pin")?;
    state.directory.verify_pin(username, pin)?;
    Ok(json!({"status": "ok", "valid": true}))
}

fn reset_password(state: &AppState, call: &AuthCall) -> AppResult<serde_json::Value> {
    let username = require(&call.username, "username")?;
    let pin = require(&call.pin, "pin")?;
    let new_password = require(&call.new_password, "new_password")?;
    state.directory.reset_password(username, pin, new_password)?;
    // existing tokens stay out after a credential change
    if let Some(principal) = state.directory.lookup(username)? {
        state.sessions.revoke_user(&principal.id);
    }
    Ok(json!({"status": "ok"}))
}

fn logout(state: &AppState, call: &AuthCall) -> AppResult<serde_json::Value> {
    let token = require(&call.token, "token")?;
    let removed = state.sessions.logout(token);
    Ok(json!({"status": "ok", "removed": removed}))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization").or_else(|| headers.get("Authorization"))?;
    let s = value.to_str().ok()?;
    s.strip_prefix("Bearer ").map(|t| t.to_string())
}

async fn custom_auth(State(state): State<AppState>, Json(call): Json<AuthCall>) -> impl IntoResponse {
    let (status, body) = dispatch(&state, &call);
    (status, Json(body))
}

async fn get_session(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let Some(token) = bearer_token(&headers) else {
        return (StatusCode::UNAUTHORIZED, Json(json!({"status": "unauthorized"})));
    };
    match state.sessions.validate(&token) {
        Some(principal) => (StatusCode::OK, Json(json!({"status": "ok", "user": principal}))),
        None => (StatusCode::UNAUTHORIZED, Json(json!({"status": "unauthorized"}))),
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "marketgate ok" }))
        .route("/custom-auth", post(custom_auth))
        .route("/session", get(get_session))
        .route("/health", get(health))
        .with_state(state)
}

/// Start the marketgate HTTP server bound to the given port, with the
/// directory persisted under `data_dir`.
pub async fn run_with_port(http_port: u16, data_dir: &str) -> anyhow::Result<()> {
    let repo = Arc::new(FileRepository::new(data_dir)?);
    let state = AppState {
        directory: LocalDirectory::new(repo),
        sessions: Arc::new(SessionManager::default()),
    };
    let app = router(state);

    let addr: SocketAddr = format!("0.0.0.0:{}", http_port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Convenience entry point using the default port 7890 and data root "data".
pub async fn run() -> anyhow::Result<()> {
    run_with_port(7890, "data").await
}
