// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Operator status surface. Everything lives under `/api/v1/`; health is
// public, every other route requires the `AuthBearer` extractor.
//
// Positions are served from each session's cache; no route calls the
// exchange.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::error::BotError;
use crate::router::Router as AccountRouter;
use crate::settings::AccountSettings;

/// Build the REST router with CORS middleware and shared state.
pub fn router(accounts: Arc<AccountRouter>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/accounts", get(list_accounts))
        .route("/api/v1/accounts/:id/positions", get(account_positions))
        .route("/api/v1/accounts/:id/disable", post(disable_account))
        .route("/api/v1/accounts/:id/settings", put(update_settings))
        .route("/api/v1/engine/:inst", get(engine_dump))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(accounts)
}

/// `BotError` as an HTTP response.
struct ApiError(BotError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BotError::NotFound(_) => StatusCode::NOT_FOUND,
            BotError::Configuration(_) | BotError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<BotError> for ApiError {
    fn from(e: BotError) -> Self {
        Self(e)
    }
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    accounts: usize,
    server_time: i64,
}

async fn health(State(accounts): State<Arc<AccountRouter>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        accounts: accounts.accounts().len(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Accounts (authenticated)
// =============================================================================

async fn list_accounts(
    _auth: AuthBearer,
    State(accounts): State<Arc<AccountRouter>>,
) -> impl IntoResponse {
    Json(accounts.accounts())
}

async fn account_positions(
    _auth: AuthBearer,
    State(accounts): State<Arc<AccountRouter>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(accounts.account_status(&id)?))
}

async fn disable_account(
    _auth: AuthBearer,
    State(accounts): State<Arc<AccountRouter>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !accounts.disable_account(&id) {
        return Err(BotError::NotFound(format!("account {id} is not enabled")).into());
    }
    warn!(account = %id, "account disabled via API");
    Ok(Json(serde_json::json!({ "account_id": id, "enabled": false })))
}

async fn update_settings(
    _auth: AuthBearer,
    State(accounts): State<Arc<AccountRouter>>,
    Path(id): Path<String>,
    Json(settings): Json<AccountSettings>,
) -> Result<impl IntoResponse, ApiError> {
    accounts.update_settings(&id, settings).await?;
    info!(account = %id, "account settings updated via API");
    Ok(Json(serde_json::json!({ "account_id": id, "updated": true })))
}

// =============================================================================
// Engine diagnostics (authenticated)
// =============================================================================

async fn engine_dump(
    _auth: AuthBearer,
    State(accounts): State<Arc<AccountRouter>>,
    Path(inst): Path<String>,
) -> impl IntoResponse {
    Json(serde_json::json!({ "inst_id": inst, "state": accounts.engine_dump(&inst) }))
}
