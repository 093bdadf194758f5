//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that probes the key-value store and backend

use crate::routes::routes::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

const READY_PROBE_KEY: &str = "readyz:probe";

/// `GET /healthz`
///
/// Very small liveness probe. Never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// 1. Reads a key from the durable key-value store.
/// 2. Lists the master container, when one is bound.
///
/// HTTP 200 when all checks pass, HTTP 503 when any check fails.
pub async fn readyz(State(store): State<AppState>) -> impl IntoResponse {
    let kv_check = match store.kv().get_raw(READY_PROBE_KEY).await {
        Ok(_) => CheckStatus { ok: true, error: None },
        Err(e) => CheckStatus {
            ok: false,
            error: Some(format!("error: {}", e)),
        },
    };

    let backend_check = match store.master_gist_id().await {
        Some(master) => match store.backend().get_container(&master).await {
            Ok(Some(_)) => CheckStatus { ok: true, error: None },
            Ok(None) => CheckStatus {
                ok: false,
                error: Some(format!("master container {} not found", master)),
            },
            Err(e) => CheckStatus {
                ok: false,
                error: Some(format!("error: {}", e)),
            },
        },
        None => CheckStatus {
            ok: true,
            error: Some("no master container bound, skipped".into()),
        },
    };

    let overall_ok = kv_check.ok && backend_check.ok;
    let mut checks = HashMap::new();
    checks.insert("kv", kv_check);
    checks.insert("backend", backend_check);

    let body = ReadyResponse {
        status: if overall_ok { "ok".into() } else { "error".into() },
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
