//! HTTP control plane.
//!
//! JSON in, JSON out. Everything except the health probes, the pairing
//! exchange and the agent card requires a bearer token once a
//! [`PairingManager`] is installed. CORS pre-flight is answered directly
//! with 204 before authentication runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{
    Router,
    extract::{Path, Request, State},
    http::{HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::channels::pipeline::InboundPipeline;
use crate::channels::types::{InboundMessage, Sender};
use crate::pairing::PairingManager;
use crate::session::{Session, SessionConfig, SessionManager};

const AUTH_EXEMPT_PATHS: &[&str] = &["/health", "/ready", "/pair", "/.well-known/agent.json"];

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub pairing: Option<Arc<PairingManager>>,
    pub pipeline: Arc<InboundPipeline>,
    pub started_at: DateTime<Utc>,
    pub identity_enabled: bool,
    pub tunnel_connected: Option<bool>,
    pub ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(
        sessions: Arc<SessionManager>,
        pairing: Option<Arc<PairingManager>>,
        pipeline: Arc<InboundPipeline>,
    ) -> Self {
        Self {
            sessions,
            pairing,
            pipeline,
            started_at: Utc::now(),
            identity_enabled: false,
            tunnel_connected: None,
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn with_identity(mut self, enabled: bool) -> Self {
        self.identity_enabled = enabled;
        self
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/.well-known/agent.json", get(agent_card))
        .route("/pair", post(pair))
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/:id", get(get_session).delete(end_session))
        .route("/sessions/:id/steer", post(steer_session))
        .route("/webhooks/:name", post(webhook))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(middleware::from_fn(cors_middleware))
        .with_state(state)
}

/// Binds and serves until `shutdown` fires.
pub async fn serve(
    router: Router,
    addr: std::net::SocketAddr,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP control plane listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

// ── Middleware ──────────────────────────────────────────────────────────

/// Pre-flight gets an immediate 204; every other response gets the
/// allow-origin header appended.
async fn cors_middleware(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return (
            StatusCode::NO_CONTENT,
            [
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                (
                    header::ACCESS_CONTROL_ALLOW_METHODS,
                    "GET, POST, DELETE, OPTIONS",
                ),
                (header::ACCESS_CONTROL_ALLOW_HEADERS, "Authorization, Content-Type"),
            ],
        )
            .into_response();
    }
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(pairing) = &state.pairing else {
        return next.run(request).await;
    };
    let path = request.uri().path();
    if AUTH_EXEMPT_PATHS.contains(&path) {
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match token {
        Some(token) if pairing.validate_token(token) => next.run(request).await,
        _ => {
            warn!(%path, "Rejected unauthenticated request");
            error_response(StatusCode::UNAUTHORIZED, "unauthorized")
        }
    }
}

// ── Handlers ────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Response {
    let mut body = json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "uptimeSecs": (Utc::now() - state.started_at).num_seconds(),
        "sessions": state.sessions.session_count().await,
    });
    if let Some(pairing) = &state.pairing {
        let stats = pairing.stats();
        body["pairing"] = json!({
            "activeCodes": stats.active_codes,
            "pairedClients": stats.paired_clients,
        });
    }
    if let Some(connected) = state.tunnel_connected {
        body["tunnel"] = json!({ "connected": connected });
    }
    axum::Json(body).into_response()
}

async fn ready(State(state): State<AppState>) -> Response {
    if state.ready.load(Ordering::SeqCst) {
        (StatusCode::OK, axum::Json(json!({"ready": true}))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(json!({"ready": false})),
        )
            .into_response()
    }
}

async fn agent_card(State(state): State<AppState>) -> Response {
    if !state.identity_enabled {
        return error_response(StatusCode::NOT_FOUND, "identity not enabled");
    }
    axum::Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "capabilities": ["sessions", "steering", "webhooks"],
    }))
    .into_response()
}

async fn pair(State(state): State<AppState>, body: Option<axum::Json<Value>>) -> Response {
    let Some(pairing) = &state.pairing else {
        return error_response(StatusCode::BAD_REQUEST, "pairing disabled");
    };
    let code = body
        .as_ref()
        .and_then(|b| b.get("code"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|c| !c.is_empty());
    let Some(code) = code else {
        return error_response(StatusCode::BAD_REQUEST, "missing code");
    };
    let label = body
        .as_ref()
        .and_then(|b| b.get("label"))
        .and_then(Value::as_str)
        .map(String::from);

    match pairing.exchange_code(code, label) {
        Some(token) => axum::Json(json!({"paired": true, "token": token})).into_response(),
        None => error_response(StatusCode::UNAUTHORIZED, "invalid or expired code"),
    }
}

async fn list_sessions(State(state): State<AppState>) -> Response {
    let mut sessions = state.sessions.list_sessions().await;
    sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    let snapshots: Vec<Value> = sessions.iter().map(session_snapshot).collect();
    axum::Json(json!({"sessions": snapshots})).into_response()
}

async fn create_session(State(state): State<AppState>, body: Option<axum::Json<Value>>) -> Response {
    let channel_id = body
        .as_ref()
        .and_then(|b| b.get("channelId"))
        .and_then(Value::as_str)
        .unwrap_or("api")
        .to_string();
    let user_id = body
        .as_ref()
        .and_then(|b| b.get("userId"))
        .and_then(Value::as_str)
        .map(String::from);

    let session = state
        .sessions
        .create_session(SessionConfig::for_channel(channel_id, user_id))
        .await;
    (
        StatusCode::CREATED,
        axum::Json(json!({
            "sessionId": session.id,
            "channelId": session.config.channel_id,
            "userId": session.config.user_id,
            "status": "active",
        })),
    )
        .into_response()
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.sessions.get_session(&id).await {
        Some(session) => axum::Json(session_snapshot(&session)).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "session not found"),
    }
}

async fn end_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    // Cancel the live loop first so the context lock is released promptly.
    state.pipeline.cancel_session(&id).await;
    if state.sessions.end_session(&id).await {
        axum::Json(json!({"ended": true})).into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, "session not found")
    }
}

async fn steer_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<axum::Json<Value>>,
) -> Response {
    let message = body
        .as_ref()
        .and_then(|b| b.get("message"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty());
    let Some(message) = message else {
        return error_response(StatusCode::BAD_REQUEST, "missing message");
    };
    if state.sessions.get_session(&id).await.is_none() {
        return error_response(StatusCode::NOT_FOUND, "session not found");
    }

    let delivered = state.pipeline.steer_session(&id, message).await;
    if !delivered {
        info!(session_id = %id, "No live run, steering message had no target");
    }
    state.sessions.touch_session(&id).await;
    axum::Json(json!({"steered": true, "message": message})).into_response()
}

async fn webhook(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<axum::Json<Value>>,
) -> Response {
    let message = body
        .as_ref()
        .and_then(|b| b.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let Some(message) = message else {
        return error_response(StatusCode::BAD_REQUEST, "missing message");
    };
    let user_id = body
        .as_ref()
        .and_then(|b| b.get("userId"))
        .and_then(Value::as_str)
        .map(String::from);

    let channel_id = format!("webhook:{name}");
    let from = Sender {
        channel_id: channel_id.clone(),
        user_id,
        group_id: None,
        thread_id: None,
        name: None,
    };
    state
        .pipeline
        .dispatch(InboundMessage::new(channel_id, from, message));
    (StatusCode::ACCEPTED, axum::Json(json!({"accepted": true}))).into_response()
}

async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "not found")
}

// ── Helpers ─────────────────────────────────────────────────────────────

fn session_snapshot(session: &Session) -> Value {
    json!({
        "sessionId": session.id,
        "channelId": session.config.channel_id,
        "userId": session.config.user_id,
        "status": session.status,
        "createdAt": session.created_at.to_rfc3339(),
        "lastActiveAt": session.last_active_at.to_rfc3339(),
        "metadata": {
            "loopIterations": session.metadata.loop_iterations,
            "llmCalls": session.metadata.llm_calls,
            "toolInvocations": session.metadata.tool_invocations,
            "errors": session.metadata.errors,
        },
    })
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, axum::Json(json!({"error": message}))).into_response()
}
