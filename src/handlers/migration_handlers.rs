//! Migration endpoints. Every call takes an optional `masterGistId`
//! (query string or JSON body) and falls back to the bound master container.

use crate::{
    errors::AppError,
    routes::routes::AppState,
    services::shard_migration::{
        MigrationAnalysis, MigrationResult, MigrationState, ReconcileReport, RollbackResult, VerificationReport,
    },
};
use axum::{
    Json,
    extract::{Query, State},
};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterParam {
    pub master_gist_id: Option<String>,
}

async fn resolve_master(store: &AppState, requested: Option<String>) -> Result<String, AppError> {
    match requested.filter(|id| !id.trim().is_empty()) {
        Some(id) => Ok(id),
        None => store
            .master_gist_id()
            .await
            .ok_or_else(|| AppError::bad_request("masterGistId is required, no master container is bound")),
    }
}

/// `GET /migration/analyze`
pub async fn analyze(
    State(store): State<AppState>,
    Query(param): Query<MasterParam>,
) -> Result<Json<MigrationAnalysis>, AppError> {
    let master = resolve_master(&store, param.master_gist_id).await?;
    Ok(Json(store.analyze_migration(&master).await?))
}

/// `POST /migration/start`
pub async fn start(
    State(store): State<AppState>,
    body: Option<Json<MasterParam>>,
) -> Result<Json<MigrationResult>, AppError> {
    let requested = body.and_then(|Json(param)| param.master_gist_id);
    let master = resolve_master(&store, requested).await?;
    Ok(Json(store.migrate(&master, None).await))
}

/// `POST /migration/rollback`
pub async fn rollback(
    State(store): State<AppState>,
    body: Option<Json<MasterParam>>,
) -> Result<Json<RollbackResult>, AppError> {
    let requested = body.and_then(|Json(param)| param.master_gist_id);
    let master = resolve_master(&store, requested).await?;
    Ok(Json(store.rollback(&master).await))
}

/// `GET /migration/verify`
pub async fn verify(
    State(store): State<AppState>,
    Query(param): Query<MasterParam>,
) -> Result<Json<VerificationReport>, AppError> {
    let master = resolve_master(&store, param.master_gist_id).await?;
    Ok(Json(store.verify_migration(&master).await))
}

/// `POST /migration/reconcile`
pub async fn reconcile(
    State(store): State<AppState>,
    body: Option<Json<MasterParam>>,
) -> Result<Json<ReconcileReport>, AppError> {
    let requested = body.and_then(|Json(param)| param.master_gist_id);
    let master = resolve_master(&store, requested).await?;
    Ok(Json(store.reconcile_migration(&master).await))
}

/// `GET /migration/state`
pub async fn state(State(store): State<AppState>) -> Json<MigrationState> {
    Json(store.migration_state().await)
}
