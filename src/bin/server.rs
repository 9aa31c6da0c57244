//! CodeWatch server
//!
//! The minimal inbound HTTP surface the audit engine needs (spec §6):
//! start an audit, poll its status, read its tier-filtered report, and
//! drive the disclosure/finding-status mutations. Everything above this
//! — OAuth login, session cookies, the browse/list pages — is out of
//! scope; this binary assumes a reverse proxy or gateway in front of it
//! already resolved the caller's identity and passes it through headers.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use codewatch::db::{self, audits as audits_db};
use codewatch::models::{AuditLevel, FindingStatus};
use codewatch::{
    AccessGate, AuditOrchestrator, Config, LlmGateway, OwnershipResolver, PromptRenderer,
    RepoStore,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    pool: PgPool,
    repo_store: Arc<RepoStore>,
    gateway: Arc<LlmGateway>,
    renderer: Arc<PromptRenderer>,
    ownership: Arc<OwnershipResolver>,
}

#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
}

fn err_response(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (
        status,
        Json(ApiError {
            error: message.into(),
        }),
    )
}

fn map_err(e: codewatch::AuditError) -> (StatusCode, Json<ApiError>) {
    use codewatch::AuditError::*;
    let status = match &e {
        NotFound(_) | RepositoryNotFound(_) => StatusCode::NOT_FOUND,
        Forbidden(_) => StatusCode::FORBIDDEN,
        PathTraversal(_) | InvalidPath(_) | Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    err_response(status, e.to_string())
}

/// Caller identity, threaded in via headers until the session layer
/// (out of scope) resolves them from a cookie.
struct Viewer {
    id: Uuid,
    login: String,
    token: String,
}

fn viewer_from_headers(headers: &HeaderMap) -> Result<Viewer, (StatusCode, Json<ApiError>)> {
    let id = headers
        .get("x-viewer-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or_else(|| err_response(StatusCode::UNAUTHORIZED, "missing x-viewer-id"))?;
    let login = headers
        .get("x-viewer-login")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| err_response(StatusCode::UNAUTHORIZED, "missing x-viewer-login"))?;
    let token = headers
        .get("x-viewer-token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_default();
    Ok(Viewer { id, login, token })
}

// ---------------------------------------------------------------------------
// POST /audit/start
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StartAuditRequest {
    project_id: Uuid,
    level: String,
    api_key: String,
    base_audit_id: Option<Uuid>,
    component_ids: Option<Vec<Uuid>>,
}

#[derive(Debug, Serialize)]
struct StartAuditResponse {
    audit_id: Uuid,
}

async fn start_audit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<StartAuditRequest>,
) -> impl IntoResponse {
    let viewer = match viewer_from_headers(&headers) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };
    let level: AuditLevel = match req.level.parse() {
        Ok(l) => l,
        Err(e) => return map_err(e).into_response(),
    };

    let audit = match audits_db::create_audit(
        &state.pool,
        req.project_id,
        viewer.id,
        level,
        req.base_audit_id,
        req.component_ids,
    )
    .await
    {
        Ok(a) => a,
        Err(e) => return map_err(e).into_response(),
    };

    let orchestrator = AuditOrchestrator::new(
        state.pool.clone(),
        state.repo_store.clone(),
        state.gateway.clone(),
        state.renderer.clone(),
    );
    let audit_id = audit.id;
    let api_key = req.api_key;
    // Detached task: HTTP handlers never block on an audit (spec §5).
    tokio::spawn(async move {
        orchestrator.run_audit(audit_id, &api_key).await;
    });

    (
        StatusCode::ACCEPTED,
        Json(StartAuditResponse { audit_id: audit.id }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// GET /audit/{id}
// ---------------------------------------------------------------------------

async fn get_audit_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match audits_db::get_audit(&state.pool, id).await {
        Ok(audit) => Json(audit).into_response(),
        Err(e) => map_err(e).into_response(),
    }
}

// ---------------------------------------------------------------------------
// GET /audit/{id}/report
// ---------------------------------------------------------------------------

async fn get_audit_report(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let viewer = match viewer_from_headers(&headers) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };
    let audit = match audits_db::get_audit(&state.pool, id).await {
        Ok(a) => a,
        Err(e) => return map_err(e).into_response(),
    };

    let gate = AccessGate::new(&state.pool, &state.ownership);
    let tier = match gate
        .resolve_tier(&audit, viewer.id, &viewer.login, &viewer.token)
        .await
    {
        Ok(t) => t,
        Err(e) => return map_err(e).into_response(),
    };
    match gate.report_view(&audit, tier).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => map_err(e).into_response(),
    }
}

// ---------------------------------------------------------------------------
// POST /audit/{id}/publish | /unpublish | /notify-owner
// ---------------------------------------------------------------------------

async fn publish_audit(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    let gate = AccessGate::new(&state.pool, &state.ownership);
    match gate.publish(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => map_err(e).into_response(),
    }
}

async fn unpublish_audit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let gate = AccessGate::new(&state.pool, &state.ownership);
    match gate.unpublish(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => map_err(e).into_response(),
    }
}

#[derive(Debug, Serialize)]
struct NotifyOwnerResponse {
    publishable_after: Option<chrono::DateTime<chrono::Utc>>,
}

async fn notify_owner(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let viewer = match viewer_from_headers(&headers) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };

    let audit = match audits_db::get_audit(&state.pool, id).await {
        Ok(a) => a,
        Err(e) => return map_err(e).into_response(),
    };

    // Only triggerable by the requester (or owner); spec §4.9 requires the
    // disclosure clock to be started deliberately, not by any public viewer.
    let gate = AccessGate::new(&state.pool, &state.ownership);
    let tier = match gate
        .resolve_tier(&audit, viewer.id, &viewer.login, &viewer.token)
        .await
    {
        Ok(t) => t,
        Err(e) => return map_err(e).into_response(),
    };
    if tier == codewatch::models::AccessTier::Public {
        return err_response(
            StatusCode::FORBIDDEN,
            "only the requester or owner may notify the owner",
        )
        .into_response();
    }

    match gate.notify_owner(&audit).await {
        Ok(publishable_after) => Json(NotifyOwnerResponse { publishable_after }).into_response(),
        Err(e) => map_err(e).into_response(),
    }
}

// ---------------------------------------------------------------------------
// PATCH /findings/{id}/status
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct UpdateFindingStatusRequest {
    status: String,
}

async fn update_finding_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<UpdateFindingStatusRequest>,
) -> impl IntoResponse {
    let viewer = match viewer_from_headers(&headers) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };

    let finding = match db::findings::get_finding(&state.pool, id).await {
        Ok(Some(f)) => f,
        Ok(None) => {
            return err_response(StatusCode::NOT_FOUND, format!("finding {id} not found"))
                .into_response()
        }
        Err(e) => return map_err(e).into_response(),
    };
    let audit = match audits_db::get_audit(&state.pool, finding.audit_id).await {
        Ok(a) => a,
        Err(e) => return map_err(e).into_response(),
    };

    // Status is mutable only by the project owner (spec §3).
    let gate = AccessGate::new(&state.pool, &state.ownership);
    let tier = match gate
        .resolve_tier(&audit, viewer.id, &viewer.login, &viewer.token)
        .await
    {
        Ok(t) => t,
        Err(e) => return map_err(e).into_response(),
    };
    if tier != codewatch::models::AccessTier::Owner {
        return err_response(
            StatusCode::FORBIDDEN,
            "only the project owner may mutate finding status",
        )
        .into_response();
    }

    let status: FindingStatus = match req.status.parse() {
        Ok(s) => s,
        Err(e) => return map_err(e).into_response(),
    };
    match db::findings::set_status(&state.pool, id, status).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => map_err(e).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match db::health_check(&state.pool).await {
        Ok(h) => Json(h).into_response(),
        Err(e) => map_err(e).into_response(),
    }
}

fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(health_check))
        .route("/audit/start", post(start_audit))
        .route("/audit/:id", get(get_audit_status))
        .route("/audit/:id/report", get(get_audit_report))
        .route("/audit/:id/publish", post(publish_audit))
        .route("/audit/:id/unpublish", post(unpublish_audit))
        .route("/audit/:id/notify-owner", post(notify_owner))
        .route("/findings/:id/status", patch(update_finding_status))
        .layer(cors)
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,codewatch=debug".into()),
        )
        .json()
        .init();

    let config = Config::from_env();
    info!(config = %config.redacted_summary(), "starting codewatch server");

    let pool = db::init_pool(&config.database_url, config.db_max_connections).await?;
    let repo_store = Arc::new(RepoStore::new(config.repos_root.clone()));
    let gateway = Arc::new(LlmGateway::new("https://api.anthropic.com"));
    let renderer = Arc::new(PromptRenderer::new());
    let ownership = Arc::new(OwnershipResolver::new(pool.clone()));

    let state = AppState {
        pool,
        repo_store,
        gateway,
        renderer,
        ownership,
    };

    let app = create_router(state);

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".into());
    let addr = format!("{host}:{port}");

    info!("codewatch server listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
