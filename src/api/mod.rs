// HTTP API routes (sessions, battle control, results, metrics).

pub mod ws;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::auth::AuthUser;
use crate::battle::{BattleError, TimeoutPolicy};
use crate::db::Database;
use crate::live::{BattleServer, LiveBattle};
use crate::metrics;
use crate::rate_limit::{RateLimitType, RateLimiter};
use crate::session;

// ── Request types ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub max_players: Option<i64>,
    pub time_limit: Option<i64>,
    pub battle_theme: Option<String>,
}

#[derive(Deserialize)]
pub struct SetPromptRequest {
    pub player: u8,
    pub prompt: String,
}

#[derive(Deserialize)]
pub struct SubmitRequest {
    pub player: u8,
}

#[derive(Deserialize)]
pub struct RecordResultRequest {
    pub winner_prompt_id: i64,
    pub winner_votes: i64,
    pub total_votes: i64,
}

// ── Shared application state ─────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub battles: Arc<BattleServer>,
    pub rate_limiter: RateLimiter,
    pub timeout_policy: TimeoutPolicy,
}

// ── Error helpers ─────────────────────────────────────────────────────

fn json_error(status: StatusCode, msg: &str) -> impl IntoResponse {
    (status, Json(json!({ "error": msg })))
}

fn internal_error(e: sqlx::Error) -> impl IntoResponse {
    tracing::error!("Database error: {e}");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

fn battle_error(e: BattleError) -> axum::response::Response {
    let status = match e {
        BattleError::EmptyPrompt | BattleError::InvalidPlayer => StatusCode::BAD_REQUEST,
        BattleError::AlreadyStarted | BattleError::NotPlayersTurn(_) => StatusCode::CONFLICT,
    };
    json_error(status, &e.to_string()).into_response()
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(
    db: Arc<Database>,
    battles: Arc<BattleServer>,
    rate_limiter: RateLimiter,
    timeout_policy: TimeoutPolicy,
) -> Router {
    let state = AppState {
        db,
        battles,
        rate_limiter,
        timeout_policy,
    };

    Router::new()
        // Sessions
        .route("/api/sessions", get(list_my_sessions).post(create_session))
        .route("/api/sessions/{code}", get(lookup_session))
        .route("/api/sessions/{code}/join", post(join_session))
        .route("/api/sessions/{code}/close", post(close_session))
        // Battle control
        .route("/api/battles/{session_id}/start", post(start_battle))
        .route("/api/battles/{session_id}/prompt", put(set_prompt))
        .route("/api/battles/{session_id}/submit", post(submit_prompt))
        .route("/api/battles/{session_id}/reset", post(reset_battle))
        .route("/api/battles/{session_id}/state", get(battle_state))
        // Results
        .route(
            "/api/battles/{session_id}/result",
            get(get_result).post(record_result),
        )
        // Observability
        .route("/metrics", get(metrics_endpoint))
        // WebSocket
        .route("/ws/battles/{session_id}", get(ws::ws_battle))
        .with_state(state)
}

// ── Session handlers ──────────────────────────────────────────────────

async fn create_session(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    if let Err(e) = state
        .rate_limiter
        .check_limit(auth.0.sub, RateLimitType::SessionCreates)
    {
        return json_error(StatusCode::TOO_MANY_REQUESTS, &e.to_string()).into_response();
    }

    let max_players = req.max_players.unwrap_or(2);
    if !(2..=8).contains(&max_players) {
        return json_error(StatusCode::BAD_REQUEST, "max_players must be 2-8").into_response();
    }
    let time_limit = req.time_limit.unwrap_or(60);
    if !(5..=600).contains(&time_limit) {
        return json_error(StatusCode::BAD_REQUEST, "time_limit must be 5-600 seconds")
            .into_response();
    }

    match session::create_session_with_code(
        &state.db,
        auth.0.sub,
        max_players,
        time_limit,
        req.battle_theme.as_deref(),
    )
    .await
    {
        Ok(created) => {
            metrics::SESSIONS_CREATED_TOTAL.inc();
            // Open the in-memory battle in the waiting phase so spectators
            // can attach before the host hits start.
            state.battles.open(
                created.id,
                created.time_limit as u32,
                state.timeout_policy,
                Some(auth.0.sub),
            );
            (StatusCode::CREATED, Json(json!(created))).into_response()
        }
        Err(e) => internal_error(e).into_response(),
    }
}

async fn list_my_sessions(State(state): State<AppState>, auth: AuthUser) -> impl IntoResponse {
    match state.db.list_sessions_for_host(auth.0.sub).await {
        Ok(sessions) => (StatusCode::OK, Json(json!(sessions))).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn lookup_session(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> impl IntoResponse {
    if !session::is_valid_code(&code) {
        return json_error(StatusCode::NOT_FOUND, "Session not found").into_response();
    }
    match state.db.get_joinable_session_by_code(&code).await {
        Ok(Some(found)) => (StatusCode::OK, Json(json!(found))).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Session not found").into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn join_session(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(code): Path<String>,
) -> impl IntoResponse {
    match state.db.join_session(&code).await {
        Ok(true) => {}
        Ok(false) => {
            return json_error(StatusCode::NOT_FOUND, "Session not found or full").into_response()
        }
        Err(e) => return internal_error(e).into_response(),
    }

    let joined = match state.db.get_session_by_code(&code).await {
        Ok(Some(s)) => s,
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "Session not found").into_response(),
        Err(e) => return internal_error(e).into_response(),
    };

    metrics::SESSIONS_JOINED_TOTAL.inc();
    // Second seat goes to the joiner; the battle may not exist yet after
    // a server restart, in which case start_battle re-opens it.
    let battle = state.battles.open(
        joined.id,
        joined.time_limit as u32,
        state.timeout_policy,
        Some(joined.host_user_id),
    );
    battle.set_player(2, auth.0.sub);

    tracing::info!(session_id = joined.id, user_id = auth.0.sub, "Player joined session");
    (StatusCode::OK, Json(json!(joined))).into_response()
}

async fn close_session(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(code): Path<String>,
) -> impl IntoResponse {
    let found = match state.db.get_session_by_code(&code).await {
        Ok(Some(s)) => s,
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "Session not found").into_response(),
        Err(e) => return internal_error(e).into_response(),
    };
    if found.host_user_id != auth.0.sub {
        return json_error(StatusCode::FORBIDDEN, "Only the host can close a session")
            .into_response();
    }
    match state.db.close_session(found.id).await {
        Ok(true) => {
            state.battles.remove(found.id);
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => json_error(StatusCode::NOT_FOUND, "Session not found").into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

// ── Battle handlers ───────────────────────────────────────────────────

/// Fetch the live battle for a session, reviving it from the database row
/// if the process restarted since the session was created.
async fn get_or_open_battle(
    state: &AppState,
    session_id: i64,
) -> Result<Arc<LiveBattle>, axum::response::Response> {
    if let Some(battle) = state.battles.get(session_id) {
        return Ok(battle);
    }
    match state.db.get_session(session_id).await {
        Ok(Some(found)) if found.is_active => Ok(state.battles.open(
            session_id,
            found.time_limit as u32,
            state.timeout_policy,
            Some(found.host_user_id),
        )),
        Ok(_) => {
            Err(json_error(StatusCode::NOT_FOUND, "No battle for this session").into_response())
        }
        Err(e) => Err(internal_error(e).into_response()),
    }
}

async fn start_battle(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(session_id): Path<i64>,
) -> impl IntoResponse {
    let battle = match get_or_open_battle(&state, session_id).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    match state.battles.start(&battle) {
        Ok(snapshot) => (StatusCode::OK, Json(json!(snapshot))).into_response(),
        Err(e) => battle_error(e),
    }
}

async fn set_prompt(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(session_id): Path<i64>,
    Json(req): Json<SetPromptRequest>,
) -> impl IntoResponse {
    let battle = match get_or_open_battle(&state, session_id).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    match state.battles.set_prompt(&battle, req.player, &req.prompt) {
        Ok(snapshot) => (StatusCode::OK, Json(json!(snapshot))).into_response(),
        Err(e) => battle_error(e),
    }
}

async fn submit_prompt(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(session_id): Path<i64>,
    Json(req): Json<SubmitRequest>,
) -> impl IntoResponse {
    if let Err(e) = state
        .rate_limiter
        .check_limit(auth.0.sub, RateLimitType::GenerationRequests)
    {
        return json_error(StatusCode::TOO_MANY_REQUESTS, &e.to_string()).into_response();
    }

    let battle = match get_or_open_battle(&state, session_id).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    match state.battles.submit(&battle, req.player) {
        Ok(snapshot) => (StatusCode::OK, Json(json!(snapshot))).into_response(),
        Err(e) => battle_error(e),
    }
}

async fn reset_battle(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(session_id): Path<i64>,
) -> impl IntoResponse {
    let battle = match get_or_open_battle(&state, session_id).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let snapshot = state.battles.reset(&battle);
    (StatusCode::OK, Json(json!(snapshot))).into_response()
}

async fn battle_state(
    State(state): State<AppState>,
    Path(session_id): Path<i64>,
) -> impl IntoResponse {
    match state.battles.get(session_id) {
        Some(battle) => (StatusCode::OK, Json(json!(battle.snapshot()))).into_response(),
        None => json_error(StatusCode::NOT_FOUND, "No battle for this session").into_response(),
    }
}

// ── Result handlers ───────────────────────────────────────────────────

async fn record_result(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(session_id): Path<i64>,
    Json(req): Json<RecordResultRequest>,
) -> impl IntoResponse {
    if req.winner_votes > req.total_votes || req.winner_votes < 0 || req.total_votes < 0 {
        return json_error(StatusCode::BAD_REQUEST, "invalid vote counts").into_response();
    }
    match state.db.get_session(session_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "Session not found").into_response(),
        Err(e) => return internal_error(e).into_response(),
    }
    match state
        .db
        .record_result(
            session_id,
            req.winner_prompt_id,
            req.winner_votes,
            req.total_votes,
        )
        .await
    {
        Ok(result) => (StatusCode::CREATED, Json(json!(result))).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn get_result(
    State(state): State<AppState>,
    Path(session_id): Path<i64>,
) -> impl IntoResponse {
    match state.db.get_result(session_id).await {
        Ok(Some(result)) => (StatusCode::OK, Json(json!(result))).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "No result for this session").into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

// ── Observability ─────────────────────────────────────────────────────

async fn metrics_endpoint() -> impl IntoResponse {
    (StatusCode::OK, metrics::gather_metrics())
}
